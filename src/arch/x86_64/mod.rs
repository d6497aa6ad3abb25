//! 64-bit x86 register identifiers, the KDP thread-state layout and the
//! handful of architectural constants the debug target relies on.

mod reg;

pub use reg::{Register, ThreadState64};

/// Size of a 4 KiB page.
pub const PAGE_SIZE: u64 = 0x1000;

/// RFLAGS trap flag. Setting it makes the CPU single-step.
pub const EFL_TF: u64 = 0x0000_0100;

/// Per-CPU base pointer in effect at the moment of the read.
pub const MSR_IA32_GS_BASE: u32 = 0xC000_0101;
/// Base pointer swapped in by `swapgs`.
pub const MSR_IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

const CPU_TYPE_X86: u32 = 0x7;
const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// Mach CPU type reported in `HOSTINFO` replies.
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
/// Mach CPU subtype reported in `HOSTINFO` replies.
pub const CPU_SUBTYPE_X86_ARCH1: u32 = 0x4;

/// Register-set flavors understood by `READREGS` / `WRITEREGS`.
#[allow(non_upper_case_globals)]
pub mod flavor {
    /// General purpose registers (see [`ThreadState64`](super::ThreadState64)).
    pub const x86_THREAD_STATE64: u32 = 0x4;
    /// Floating point state. Not supported.
    pub const x86_FLOAT_STATE64: u32 = 0x5;
}
