//! In-memory layout constants of the XNU kernel, and the Mach exception
//! triples reported to the debugger client.
//!
//! Sources:
//! - <https://github.com/apple/darwin-xnu/blob/xnu-4903.221.2/osfmk/mach/i386/vm_param.h>
//! - <https://github.com/apple/darwin-xnu/blob/xnu-4903.221.2/osfmk/x86_64/lowglobals.h>
//! - <https://github.com/apple/darwin-xnu/blob/xnu-4903.221.2/osfmk/mach/exception_types.h>

/// Lowest kernel virtual address.
pub const VM_MIN_KERNEL_ADDRESS: u64 = 0xFFFF_FF80_0000_0000;
/// Highest kernel virtual address.
pub const VM_MAX_KERNEL_ADDRESS: u64 = 0xFFFF_FFFF_FFFF_EFFF;

/// Magic number of a 64-bit Mach-O header.
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;

/// Address of `lgStext` in the low globals page. When the `debug` boot-arg
/// is set it holds the kernel load address.
pub const LG_STEXT_ADDRESS: u64 = 0xFFFF_FF80_0000_2010;

/// Link-time load address of the kernel (no KASLR slide).
pub const DEFAULT_KERNEL_LOAD_ADDRESS: u64 = 0xFFFF_FF80_0020_0000;

/// Returns `true` if `addr` lies in kernel address space.
pub fn in_kernel_space(addr: u64) -> bool {
    (VM_MIN_KERNEL_ADDRESS..=VM_MAX_KERNEL_ADDRESS).contains(&addr)
}

/// KASLR slide of a kernel loaded at `load_address`.
pub fn kernel_slide(load_address: u64) -> u64 {
    load_address.wrapping_sub(DEFAULT_KERNEL_LOAD_ADDRESS)
}

/// A Mach exception, as carried by a `KDP_EXCEPTION` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    /// Exception type (`EXC_*`).
    pub exception: u32,
    /// Exception code.
    pub code: u32,
    /// Exception subcode.
    pub subcode: u32,
}

#[allow(missing_docs)]
impl Exception {
    pub const EXC_SOFTWARE: u32 = 0x5;
    pub const EXC_BREAKPOINT: u32 = 0x6;
    pub const EXC_SOFT_SIGNAL: u32 = 0x10003;
    pub const EXC_I386_BPTFLT: u32 = 0x3;
    pub const SIGINT: u32 = 0x2;

    /// Reported when the debugger interrupts the guest.
    pub const INTERRUPT: Exception = Exception {
        exception: Self::EXC_SOFTWARE,
        code: Self::EXC_SOFT_SIGNAL,
        subcode: Self::SIGINT,
    };

    /// Reported after a single step or a breakpoint hit.
    pub const BREAKPOINT: Exception = Exception {
        exception: Self::EXC_BREAKPOINT,
        code: Self::EXC_I386_BPTFLT,
        subcode: 0,
    };
}
