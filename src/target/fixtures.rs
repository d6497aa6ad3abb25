//! A simulated guest laid out like a booted XNU kernel.

use crate::arch::x86_64::{Register, MSR_IA32_GS_BASE, MSR_IA32_KERNEL_GS_BASE};
use crate::provider::sim::SimVm;
use crate::xnu::{kernel_slide, LG_STEXT_ADDRESS, MH_MAGIC_64};

use super::{DebugTarget, KernelInfo};

pub const KERNEL_CR3: u64 = 0x0f00_0000;
pub const USER_CR3: u64 = 0x0e00_0000;
pub const KERNEL_LOAD: u64 = 0xffff_ff80_1320_0000;
pub const KERNEL_RIP: u64 = KERNEL_LOAD + 0x42_0000;
pub const CPU_DATA: u64 = 0xffff_ff80_0a00_0000;
pub const ACTIVE_THREAD: u64 = 0xffff_ff80_2abc_d000;
pub const USER_RIP: u64 = 0x0000_7fff_6000_1000;

pub const VERSION: &str = "Darwin Kernel Version 18.7.0: Tue Aug 20 16:57:14 PDT 2019; \
                           root:xnu-4903.271.2~2/RELEASE_X86_64";

/// Kernel image, low globals and per-CPU data, without any register state.
pub fn kernel_memory() -> SimVm {
    let mut vm = SimVm::new();

    vm.map(KERNEL_LOAD, &MH_MAGIC_64.to_le_bytes());
    vm.map(LG_STEXT_ADDRESS, &KERNEL_LOAD.to_le_bytes());
    vm.map(KERNEL_RIP, &[0x90; 16]);

    let mut version = VERSION.as_bytes().to_vec();
    version.push(0);
    vm.map(KERNEL_LOAD + 0x8000, &version);

    let mut cpu_data = CPU_DATA.to_le_bytes().to_vec();
    cpu_data.extend_from_slice(&ACTIVE_THREAD.to_le_bytes());
    vm.map(CPU_DATA, &cpu_data);

    vm.set_msr(MSR_IA32_GS_BASE, 0x0000_7fff_1234_0000);
    vm.set_msr(MSR_IA32_KERNEL_GS_BASE, CPU_DATA);

    vm
}

/// A paused guest executing kernel code.
pub fn kernel_vm() -> SimVm {
    let mut vm = kernel_memory();
    vm.set_register(Register::Rip, KERNEL_RIP);
    vm.set_register(Register::Cr3, KERNEL_CR3);
    vm
}

/// A target whose attach has already completed.
pub fn attached_target() -> DebugTarget<SimVm> {
    let mut target = DebugTarget::new(kernel_vm());
    target.set_kernel(KernelInfo {
        load_address: KERNEL_LOAD,
        slide: kernel_slide(KERNEL_LOAD),
        cr3: KERNEL_CR3,
        version: VERSION.to_string(),
    });
    target
}
