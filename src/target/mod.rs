//! The VM-control layer.
//!
//! [`DebugTarget`] wraps a [`Provider`], and turns KDP-level operations into
//! provider calls. It owns all mutable debugger-side state about the guest:
//! soft breakpoints, pending synthetic exceptions, deferred resume actions,
//! and the kernel metadata discovered at attach time.
//!
//! `DebugTarget` is shared between the KDP server thread and user commands
//! through a [`SharedTarget`], which serializes every operation behind a single
//! mutex.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use crate::arch::x86_64::{Register, ThreadState64, CPU_SUBTYPE_X86_ARCH1, CPU_TYPE_X86_64, EFL_TF};
use crate::provider::{BreakpointId, Provider, ProviderState};
use crate::xnu::Exception;

mod breakpoints;
mod discovery;
mod error;
mod memory;

#[cfg(test)]
pub(crate) mod fixtures;

pub use breakpoints::{HwTrigger, ParseHwTriggerError};
pub use discovery::KernelInfo;
pub use error::TargetError;

/// A specialized `Result` type for `DebugTarget` operations.
pub type TargetResult<T, P> = Result<T, TargetError<<P as Provider>::Error>>;

/// Extension trait to lift provider results into [`TargetResult`]s.
trait ProviderResultExt<V, E> {
    fn handle_error(self) -> Result<V, TargetError<E>>;
}

impl<V, E> ProviderResultExt<V, E> for Result<V, E> {
    fn handle_error(self) -> Result<V, TargetError<E>> {
        self.map_err(TargetError::Provider)
    }
}

/// Values reported in `HOSTINFO` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    /// One bit per logical CPU.
    pub cpus_mask: u32,
    /// Mach CPU type.
    pub cpu_type: u32,
    /// Mach CPU subtype.
    pub cpu_subtype: u32,
}

/// Outcome of [`DebugTarget::interrupt_and_restore_last_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    /// The last snapshot was restored.
    Restored,
    /// There was no snapshot to restore.
    NotFound,
}

/// A debuggable VM.
pub struct DebugTarget<P: Provider> {
    provider: P,

    exception: Option<Exception>,
    soft_breakpoints: BTreeMap<u64, BreakpointId>,

    interrupt_at_next_resume: bool,
    single_step_at_next_resume: bool,
    increment_rip_at_next_read: bool,

    introspection_addr: Option<u64>,
    capture_introspection_at_next_write: bool,

    kernel: Option<KernelInfo>,
}

impl<P: Provider> DebugTarget<P> {
    /// Wrap a freshly opened provider.
    pub fn new(provider: P) -> DebugTarget<P> {
        DebugTarget {
            provider,

            exception: None,
            soft_breakpoints: BTreeMap::new(),

            interrupt_at_next_resume: false,
            single_step_at_next_resume: false,
            increment_rip_at_next_read: false,

            introspection_addr: None,
            capture_introspection_at_next_write: false,

            kernel: None,
        }
    }

    /// Returns a reference to the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns a mutable reference to the underlying provider.
    ///
    /// Bypassing the `DebugTarget` can desynchronize its view of the guest
    /// (e.g: removing breakpoints behind its back).
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Kernel metadata, once attach has completed.
    pub fn kernel(&self) -> Option<&KernelInfo> {
        self.kernel.as_ref()
    }

    /// Record the kernel metadata discovered at attach time.
    pub fn set_kernel(&mut self, kernel: KernelInfo) {
        self.kernel = Some(kernel);
    }

    /// Pause the VM.
    pub fn halt(&mut self) -> TargetResult<(), P> {
        trace!("halt");
        self.provider.pause().handle_error()
    }

    /// Pause the VM, and report it to the client as a `SIGINT`.
    pub fn interrupt(&mut self) -> TargetResult<(), P> {
        trace!("interrupt");
        self.exception = Some(Exception::INTERRUPT);
        self.halt()
    }

    /// Execute a single instruction, and report it to the client as a
    /// breakpoint trap.
    pub fn single_step(&mut self) -> TargetResult<(), P> {
        trace!("single_step");
        self.exception = Some(Exception::BREAKPOINT);
        self.provider.single_step().handle_error()
    }

    /// Resume the VM, honoring any deferred action.
    ///
    /// A pending [`interrupt_at_next_resume`](Self::interrupt_at_next_resume)
    /// takes priority over a pending single step (armed by setting the trap
    /// flag in RFLAGS). When stopped on a breakpoint, the VM first steps over
    /// it.
    pub fn resume(&mut self) -> TargetResult<(), P> {
        trace!("resume");

        if core::mem::take(&mut self.interrupt_at_next_resume) {
            debug!("interrupting instead of resuming");
            return self.interrupt();
        }

        if core::mem::take(&mut self.single_step_at_next_resume) {
            debug!("single stepping instead of resuming");
            return self.single_step();
        }

        if self.is_breakpoint_hit()? {
            debug!("stepping over breakpoint before resuming");
            self.provider.single_step().handle_error()?;
        }

        self.provider.resume().handle_error()
    }

    /// Turn the next [`resume`](Self::resume) into an interrupt.
    pub fn interrupt_at_next_resume(&mut self) {
        trace!("interrupt_at_next_resume");
        self.interrupt_at_next_resume = true;
    }

    /// Current provider state, along with the pending exception (if any).
    ///
    /// Taking the state consumes the pending exception. If the VM stopped on
    /// a breakpoint, a breakpoint exception is reported, and the next RIP read
    /// returns `rip + 1` (the value the client expects after an `int3` trap).
    pub fn state(&mut self) -> TargetResult<(ProviderState, Option<Exception>), P> {
        trace!("state");
        if self.is_breakpoint_hit()? {
            debug!("stopped on breakpoint");
            self.exception = Some(Exception::BREAKPOINT);
            self.increment_rip_at_next_read = true;
        }
        let state = self.provider.state().handle_error()?;
        Ok((state, self.exception.take()))
    }

    /// Returns `true` if the provider state changed, or an exception is
    /// pending.
    pub fn is_state_changed(&mut self) -> TargetResult<bool, P> {
        let changed = self.provider.state_changed().handle_error()?;
        Ok(changed || self.exception.is_some())
    }

    /// Returns `true` if the VM is paused.
    pub fn is_halted(&mut self) -> TargetResult<bool, P> {
        let state = self.provider.state().handle_error()?;
        Ok(state.contains(ProviderState::PAUSED))
    }

    /// Returns `true` if the VM stopped on a (soft or hardware) breakpoint.
    pub fn is_breakpoint_hit(&mut self) -> TargetResult<bool, P> {
        let state = self.provider.state().handle_error()?;
        Ok(state.intersects(ProviderState::BREAKPOINT_HIT | ProviderState::HARD_BREAKPOINT_HIT))
    }

    fn require_halted(&mut self) -> TargetResult<(), P> {
        if self.is_halted()? {
            Ok(())
        } else {
            Err(TargetError::NotHalted)
        }
    }

    /// Number of logical CPUs.
    pub fn cpu_count(&mut self) -> TargetResult<u32, P> {
        self.provider.cpu_count().handle_error()
    }

    /// CPU mask, type and subtype of the guest.
    pub fn host_info(&mut self) -> TargetResult<HostInfo, P> {
        trace!("host_info");
        let cpus = self.cpu_count()?;
        let cpus_mask = (0..cpus.min(32)).fold(0u32, |mask, cpu| mask | 1 << cpu);
        Ok(HostInfo {
            cpus_mask,
            cpu_type: CPU_TYPE_X86_64,
            cpu_subtype: CPU_SUBTYPE_X86_ARCH1,
        })
    }

    /// Read a model-specific register of CPU 0.
    pub fn read_msr(&mut self, msr: u32) -> TargetResult<u64, P> {
        trace!("read_msr({:#x})", msr);
        self.provider.read_msr(msr).handle_error()
    }

    /// Write a model-specific register of CPU 0.
    pub fn write_msr(&mut self, msr: u32, val: u64) -> TargetResult<(), P> {
        trace!("write_msr({:#x}, {:#x})", msr, val);
        self.provider.write_msr(msr, val).handle_error()
    }

    /// Read a register of CPU 0.
    pub fn read_register(&mut self, reg: Register) -> TargetResult<u64, P> {
        let val = self.provider.read_register(reg).handle_error()?;
        if reg == Register::Rip && core::mem::take(&mut self.increment_rip_at_next_read) {
            debug!("reporting rip past the breakpoint");
            return Ok(val.wrapping_add(1));
        }
        Ok(val)
    }

    /// Write a register of CPU 0.
    ///
    /// Writes to RFLAGS are never forwarded to the provider. Instead, setting
    /// the trap flag arms a single step at the next resume.
    pub fn write_register(&mut self, reg: Register, val: u64) -> TargetResult<(), P> {
        if reg == Register::Rflags {
            if val & EFL_TF != 0 {
                debug!("trap flag set, single stepping at next resume");
                self.single_step_at_next_resume = true;
            }
            return Ok(());
        }
        self.provider.write_register(reg, val).handle_error()
    }

    /// Read the `x86_THREAD_STATE64` register set.
    pub fn read_thread_state(&mut self) -> TargetResult<ThreadState64, P> {
        trace!("read_thread_state");
        let mut vals = [0; ThreadState64::LEN];
        for (val, reg) in vals.iter_mut().zip(ThreadState64::REGISTERS.iter()) {
            *val = self.read_register(*reg)?;
        }
        Ok(ThreadState64::from_array(vals))
    }

    /// Write the `x86_THREAD_STATE64` register set.
    pub fn write_thread_state(&mut self, state: &ThreadState64) -> TargetResult<(), P> {
        trace!("write_thread_state");
        for (reg, val) in state.iter() {
            self.write_register(reg, val)?;
        }
        Ok(())
    }

    /// Interrupt the VM, then save a snapshot of it.
    pub fn interrupt_and_take_snapshot(&mut self) -> TargetResult<(), P> {
        trace!("interrupt_and_take_snapshot");
        self.interrupt()?;
        self.provider.save().handle_error()
    }

    /// Interrupt the VM, then restore the last snapshot.
    ///
    /// Provider breakpoints do not survive a restore, so the soft breakpoint
    /// table is cleared. Deferred actions, the pending RIP adjustment and the
    /// introspection struct capture are reset as well. Debug registers are
    /// left as restored, and the interrupt is still reported.
    pub fn interrupt_and_restore_last_snapshot(&mut self) -> TargetResult<Snapshot, P> {
        trace!("interrupt_and_restore_last_snapshot");
        self.interrupt()?;
        if self.provider.restore().handle_error()? {
            self.soft_breakpoints.clear();
            self.interrupt_at_next_resume = false;
            self.single_step_at_next_resume = false;
            self.increment_rip_at_next_read = false;
            self.introspection_addr = None;
            self.capture_introspection_at_next_write = false;
            Ok(Snapshot::Restored)
        } else {
            debug!("no snapshot to restore");
            Ok(Snapshot::NotFound)
        }
    }
}

/// A [`DebugTarget`] shared between threads.
///
/// Every operation runs under the lock for its full duration, so callers
/// should hold a single guard across multi-step sequences that must not
/// interleave with other users.
pub struct SharedTarget<P: Provider> {
    inner: Arc<Mutex<DebugTarget<P>>>,
}

impl<P: Provider> Clone for SharedTarget<P> {
    fn clone(&self) -> Self {
        SharedTarget {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Provider> SharedTarget<P> {
    /// Share `target`.
    pub fn new(target: DebugTarget<P>) -> SharedTarget<P> {
        SharedTarget {
            inner: Arc::new(Mutex::new(target)),
        }
    }

    /// Acquire exclusive access to the target. A poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, DebugTarget<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
