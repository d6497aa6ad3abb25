//! Attach-time discovery of the running XNU kernel.

use log::{debug, info, trace};
use regex::bytes::Regex;

use crate::arch::x86_64::{Register, MSR_IA32_GS_BASE, MSR_IA32_KERNEL_GS_BASE, PAGE_SIZE};
use crate::internal::LeBytes;
use crate::provider::{BreakpointSpec, Provider};
use crate::xnu::{in_kernel_space, LG_STEXT_ADDRESS, MH_MAGIC_64, VM_MIN_KERNEL_ADDRESS};

use super::{DebugTarget, ProviderResultExt, TargetError, TargetResult};

/// The kernel image is searched in chunks of this size...
const VERSION_CHUNK_SIZE: usize = 2 * 1024 * 1024;
/// ...up to this far past its load address.
const VERSION_SEARCH_LIMIT: usize = 42 * 1024 * 1024;

const VERSION_PATTERN: &str = r"(?-u)(?P<version>Darwin Kernel Version .+?X86_64)\x00";

/// What attach learned about the running kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    /// Address of the kernel's Mach-O header.
    pub load_address: u64,
    /// KASLR slide.
    pub slide: u64,
    /// CR3 of the kernel address space.
    pub cr3: u64,
    /// e.g: `Darwin Kernel Version 18.7.0: ...; root:xnu-4903.271.2~2/RELEASE_X86_64`
    pub version: String,
}

impl<P: Provider> DebugTarget<P> {
    /// Resume the VM until it executes kernel code.
    ///
    /// Uses a breakpoint on CR3 writes (which are, with high probability, made
    /// by the kernel) to get there. The breakpoint is removed afterwards.
    pub fn continue_until_kernel_code(&mut self) -> TargetResult<(), P> {
        trace!("continue_until_kernel_code");

        if in_kernel_space(self.raw_rip()?) {
            return Ok(());
        }

        let id = self
            .provider
            .set_breakpoint(BreakpointSpec::cr_write(3))
            .handle_error()?
            .ok_or(TargetError::NoBreakpointRoom)?;

        let res = self.run_until_kernel_code();
        let unset = self.provider.unset_breakpoint(id).handle_error();
        res?;
        unset?;
        Ok(())
    }

    fn run_until_kernel_code(&mut self) -> TargetResult<(), P> {
        loop {
            self.provider.resume().handle_error()?;
            self.provider.wait_for_state_change().handle_error()?;

            let rip = self.raw_rip()?;
            if in_kernel_space(rip) {
                debug!("stopped in kernel code at {:#018x}", rip);
                return Ok(());
            }
            self.provider.single_step().handle_error()?;
        }
    }

    /// Locate the kernel's Mach-O header.
    ///
    /// The `lgStext` slot of the low globals page is tried first (it's only
    /// filled in when the `debug` boot-arg is set). Otherwise, memory is
    /// scanned backwards, one page at a time, from the current RIP.
    pub fn find_kernel_load_address(&mut self) -> TargetResult<u64, P> {
        trace!("find_kernel_load_address");

        if let Some(lg_stext) = self.read_u64(LG_STEXT_ADDRESS)? {
            if self.is_kernel_load_address(lg_stext)? {
                debug!("found kernel through lgStext");
                return Ok(lg_stext);
            }
        }

        let rip = self.raw_rip()?;
        if !in_kernel_space(rip) {
            return Err(TargetError::KernelLoadAddressNotFound);
        }

        let mut addr = rip & !(PAGE_SIZE - 1);
        while addr >= VM_MIN_KERNEL_ADDRESS {
            if self.is_kernel_load_address(addr)? {
                return Ok(addr);
            }
            addr -= PAGE_SIZE;
        }

        Err(TargetError::KernelLoadAddressNotFound)
    }

    fn is_kernel_load_address(&mut self, addr: u64) -> TargetResult<bool, P> {
        if !in_kernel_space(addr) {
            return Ok(false);
        }
        let magic = self
            .read_virtual_memory(addr, 4)?
            .and_then(|data| u32::read_le(&data));
        Ok(magic == Some(MH_MAGIC_64))
    }

    /// Extract the kernel version string from the kernel image loaded at
    /// `load_address`.
    ///
    /// Pages which cannot be read are treated as zero-filled.
    pub fn find_kernel_version(&mut self, load_address: u64) -> TargetResult<String, P> {
        trace!("find_kernel_version({:#018x})", load_address);

        let pattern = Regex::new(VERSION_PATTERN).expect("version pattern is valid");
        let page_size = PAGE_SIZE as usize;

        let mut image = Vec::new();
        while image.len() < VERSION_SEARCH_LIMIT {
            let chunk_end = image.len() + VERSION_CHUNK_SIZE;
            while image.len() < chunk_end {
                let addr = load_address.wrapping_add(image.len() as u64);
                match self.read_virtual_memory(addr, page_size)? {
                    Some(page) => image.extend_from_slice(&page),
                    None => image.resize(image.len() + page_size, 0),
                }
            }

            if let Some(caps) = pattern.captures(&image) {
                let version = String::from_utf8_lossy(&caps["version"]).into_owned();
                return Ok(version);
            }
        }

        Err(TargetError::KernelVersionNotFound)
    }

    /// Address of the thread currently running on CPU 0.
    ///
    /// Read from the per-CPU data structure pointed to by the GS base (or,
    /// when in user mode, the kernel GS base).
    pub fn active_thread(&mut self) -> TargetResult<u64, P> {
        trace!("active_thread");

        let mut cpu_data = self.read_msr(MSR_IA32_GS_BASE)?;
        if !in_kernel_space(cpu_data) {
            cpu_data = self.read_msr(MSR_IA32_KERNEL_GS_BASE)?;
        }

        // `cpu_this` is the first field of `cpu_data_t`, `cpu_active_thread`
        // the second
        let cpu_this = self
            .read_u64_unpatched(cpu_data)?
            .ok_or(TargetError::UnreadableMemory(cpu_data))?;
        if cpu_this != cpu_data {
            return Err(TargetError::CpuDataMismatch { cpu_data, cpu_this });
        }

        let thread_addr = cpu_data.wrapping_add(8);
        self.read_u64_unpatched(thread_addr)?
            .ok_or(TargetError::UnreadableMemory(thread_addr))
    }

    /// Run the attach-time discovery steps which follow
    /// [`continue_until_kernel_code`](Self::continue_until_kernel_code), and
    /// record the result.
    pub fn discover_kernel(&mut self) -> TargetResult<&KernelInfo, P> {
        let cr3 = self.provider.read_register(Register::Cr3).handle_error()?;
        let load_address = self.find_kernel_load_address()?;
        let slide = crate::xnu::kernel_slide(load_address);
        info!("kernel loaded at {:#018x} (slide {:#x})", load_address, slide);

        let version = self.find_kernel_version(load_address)?;
        info!("{}", version);

        Ok(&*self.kernel.insert(KernelInfo {
            load_address,
            slide,
            cr3,
            version,
        }))
    }

    /// The kernel version string reported in `KERNELVERSION` replies.
    ///
    /// The kernel load address is appended (as `; stext=0x...`), unless the
    /// string already carries one. This spares the client a search.
    pub fn kernel_version(&mut self) -> TargetResult<String, P> {
        trace!("kernel_version");
        let kernel = self.kernel.as_ref().ok_or(TargetError::KernelUnknown)?;
        let mut version = kernel.version.clone();
        if !version.contains("stext") {
            version.push_str(&format!("; stext={:#018x}", kernel.load_address));
        }
        Ok(version)
    }

    fn raw_rip(&mut self) -> TargetResult<u64, P> {
        self.provider.read_register(Register::Rip).handle_error()
    }

    fn read_u64(&mut self, addr: u64) -> TargetResult<Option<u64>, P> {
        Ok(self
            .read_virtual_memory(addr, 8)?
            .and_then(|data| u64::read_le(&data)))
    }

    fn read_u64_unpatched(&mut self, addr: u64) -> TargetResult<Option<u64>, P> {
        Ok(self
            .read_virtual_memory_unpatched(addr, 8)?
            .and_then(|data| u64::read_le(&data)))
    }
}
