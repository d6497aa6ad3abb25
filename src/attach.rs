//! Attaching to a running guest.
//!
//! [`attach`] brings a freshly opened VM into a debuggable state: paused, in
//! kernel code, with no breakpoints armed, and with the kernel located.

use core::fmt::{self, Debug, Display};

use log::{info, trace};

use crate::provider::Provider;
use crate::target::{DebugTarget, KernelInfo, SharedTarget, TargetError};

/// The steps performed by [`attach`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStep {
    /// Opening the provider.
    Open,
    /// Checking the number of CPUs.
    CpuCount,
    /// Pausing the VM, and clearing leftover breakpoints.
    Halt,
    /// Running the VM until it executes kernel code.
    ContinueUntilKernelCode,
    /// Locating the kernel image and version.
    DiscoverKernel,
}

impl Display for AttachStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttachStep::Open => "opening the VM",
            AttachStep::CpuCount => "counting CPUs",
            AttachStep::Halt => "halting the VM",
            AttachStep::ContinueUntilKernelCode => "waiting for kernel code",
            AttachStep::DiscoverKernel => "discovering the kernel",
        };
        f.write_str(s)
    }
}

/// An error which aborted an [`attach`].
#[derive(Debug)]
#[non_exhaustive]
pub enum AttachError<E> {
    /// Only single-CPU guests can be debugged.
    MultipleCpus(u32),
    /// A step failed.
    Step {
        /// The failing step.
        step: AttachStep,
        /// What went wrong.
        error: TargetError<E>,
    },
}

impl<E> AttachError<E> {
    /// The step which failed.
    pub fn step(&self) -> AttachStep {
        match self {
            AttachError::MultipleCpus(_) => AttachStep::CpuCount,
            AttachError::Step { step, .. } => *step,
        }
    }
}

impl<E: Debug> Display for AttachError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::MultipleCpus(n) => {
                write!(f, "guest has {} CPUs, only single-CPU guests are supported", n)
            }
            AttachError::Step { step, error } => write!(f, "failed while {}: {}", step, error),
        }
    }
}

impl<E: Debug> std::error::Error for AttachError<E> {}

trait AttachResultExt<V, E> {
    fn during(self, step: AttachStep) -> Result<V, AttachError<E>>;
}

impl<V, E> AttachResultExt<V, E> for Result<V, TargetError<E>> {
    fn during(self, step: AttachStep) -> Result<V, AttachError<E>> {
        self.map_err(|error| AttachError::Step { step, error })
    }
}

/// Open a VM with `open`, and prepare it for debugging.
///
/// On failure, the partially attached target is dropped.
pub fn attach<P, F>(open: F) -> Result<(SharedTarget<P>, KernelInfo), AttachError<P::Error>>
where
    P: Provider,
    F: FnOnce() -> Result<P, P::Error>,
{
    trace!("attach");

    let provider = open()
        .map_err(TargetError::Provider)
        .during(AttachStep::Open)?;
    let mut target = DebugTarget::new(provider);

    let cpus = target.cpu_count().during(AttachStep::CpuCount)?;
    if cpus > 1 {
        return Err(AttachError::MultipleCpus(cpus));
    }

    target.halt().during(AttachStep::Halt)?;
    target.unset_all_breakpoints().during(AttachStep::Halt)?;

    info!("waiting for the guest to execute kernel code");
    target
        .continue_until_kernel_code()
        .during(AttachStep::ContinueUntilKernelCode)?;

    let kernel = target
        .discover_kernel()
        .during(AttachStep::DiscoverKernel)?
        .clone();
    info!("attached to {}", kernel.version);

    Ok((SharedTarget::new(target), kernel))
}
