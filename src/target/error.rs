use core::fmt::{self, Debug, Display};

/// An error which may occur while operating on a
/// [`DebugTarget`](super::DebugTarget).
#[derive(Debug)]
#[non_exhaustive]
pub enum TargetError<E> {
    /// The capability provider failed.
    Provider(E),
    /// The operation requires the VM to be paused.
    NotHalted,
    /// Hardware breakpoint slots are numbered 0 through 3.
    InvalidSlot(u8),
    /// Kernel metadata is only available once attach has completed.
    KernelUnknown,
    /// Neither `lgStext` nor a backwards scan located the kernel's Mach-O
    /// header.
    KernelLoadAddressNotFound,
    /// No version string was found in the kernel image.
    KernelVersionNotFound,
    /// The per-CPU data structure doesn't point back at itself.
    CpuDataMismatch {
        /// Address read from the GS base MSRs.
        cpu_data: u64,
        /// Value of its `cpu_this` field.
        cpu_this: u64,
    },
    /// Guest memory at this address could not be read.
    UnreadableMemory(u64),
    /// The introspection struct address has already been captured, so the
    /// capture can no longer be aborted.
    IntrospectionAlreadyCaptured,
    /// A software breakpoint is already set at this address.
    BreakpointAlreadySet(u64),
    /// No software breakpoint is set at this address.
    BreakpointNotFound(u64),
    /// The provider refused to install another breakpoint.
    NoBreakpointRoom,
}

impl<E: Debug> Display for TargetError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::TargetError::*;
        match self {
            Provider(e) => write!(f, "provider error: {:?}", e),
            NotHalted => write!(f, "target must be halted"),
            InvalidSlot(slot) => write!(f, "invalid hardware breakpoint slot {}", slot),
            KernelUnknown => write!(f, "kernel has not been discovered yet"),
            KernelLoadAddressNotFound => write!(f, "could not find the kernel load address"),
            KernelVersionNotFound => write!(f, "could not find the kernel version string"),
            CpuDataMismatch { cpu_data, cpu_this } => write!(
                f,
                "cpu_data at {:#018x} has cpu_this = {:#018x}",
                cpu_data, cpu_this
            ),
            UnreadableMemory(addr) => write!(f, "could not read memory at {:#018x}", addr),
            IntrospectionAlreadyCaptured => {
                write!(f, "introspection struct address already captured")
            }
            BreakpointAlreadySet(addr) => write!(f, "breakpoint already set at {:#018x}", addr),
            BreakpointNotFound(addr) => write!(f, "no breakpoint at {:#018x}", addr),
            NoBreakpointRoom => write!(f, "provider refused to set a breakpoint"),
        }
    }
}

impl<E: Debug> std::error::Error for TargetError<E> {}
