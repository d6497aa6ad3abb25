use log::{debug, trace};

use crate::arch::x86_64::Register;
use crate::provider::Provider;
use crate::xnu::in_kernel_space;

use super::{DebugTarget, ProviderResultExt, TargetError, TargetResult};

impl<P: Provider> DebugTarget<P> {
    /// Read `len` bytes of virtual memory. Returns `Ok(None)` if the range is
    /// not mapped.
    ///
    /// When stopped in user mode, kernel addresses are usually not mapped by
    /// the current page tables, so failed reads are retried in the kernel's
    /// address space.
    ///
    /// Reads containing the start of a captured introspection struct (see
    /// [`capture_introspection_struct`](Self::capture_introspection_struct))
    /// have its `saved_state` and `kdp_thread` fields filled in. Reads
    /// starting inside the struct are returned as is.
    pub fn read_virtual_memory(
        &mut self,
        addr: u64,
        len: usize,
    ) -> TargetResult<Option<Vec<u8>>, P> {
        trace!("read_virtual_memory({:#018x}, {:#x})", addr, len);

        let mut data = match self.read_virtual_memory_unpatched(addr, len)? {
            Some(data) => data,
            None => return Ok(None),
        };

        if let Some(struct_addr) = self.introspection_addr {
            let end = addr.saturating_add(len as u64);
            if addr <= struct_addr && struct_addr < end {
                debug!("patching introspection struct at {:#018x}", struct_addr);
                // null `saved_state`, then `kdp_thread`
                let mut patch = 0u64.to_le_bytes().to_vec();
                patch.extend_from_slice(&self.active_thread()?.to_le_bytes());

                // clipped to the read, which keeps its length
                let offset = (struct_addr - addr) as usize;
                let n = patch.len().min(len - offset);
                data[offset..offset + n].copy_from_slice(&patch[..n]);
            }
        }

        Ok(Some(data))
    }

    pub(super) fn read_virtual_memory_unpatched(
        &mut self,
        addr: u64,
        len: usize,
    ) -> TargetResult<Option<Vec<u8>>, P> {
        let data = self.provider.read_virtual_memory(addr, len).handle_error()?;
        if data.is_some() {
            return Ok(data);
        }

        let kernel_cr3 = match &self.kernel {
            Some(kernel) => kernel.cr3,
            None => return Ok(None),
        };
        if in_kernel_space(self.provider.read_register(Register::Rip).handle_error()?) {
            return Ok(None);
        }

        debug!("retrying read of {:#018x} using the kernel pmap", addr);
        let process_cr3 = self.provider.read_register(Register::Cr3).handle_error()?;
        self.provider
            .write_register(Register::Cr3, kernel_cr3)
            .handle_error()?;
        let data = self.provider.read_virtual_memory(addr, len);
        self.provider
            .write_register(Register::Cr3, process_cr3)
            .handle_error()?;
        data.handle_error()
    }

    /// Write virtual memory. Requires the VM to be halted.
    ///
    /// Returns `Ok(false)` if the range is not mapped.
    pub fn write_virtual_memory(&mut self, addr: u64, data: &[u8]) -> TargetResult<bool, P> {
        trace!("write_virtual_memory({:#018x}, {:#x})", addr, data.len());
        self.require_halted()?;

        if core::mem::take(&mut self.capture_introspection_at_next_write) {
            debug!("captured introspection struct at {:#018x}", addr);
            self.introspection_addr = Some(addr);
            return Ok(true);
        }

        self.provider.write_virtual_memory(addr, data).handle_error()
    }

    /// Read guest-physical memory. Returns `Ok(None)` if the range lies
    /// outside of guest RAM.
    pub fn read_physical_memory(
        &mut self,
        addr: u64,
        len: usize,
    ) -> TargetResult<Option<Vec<u8>>, P> {
        trace!("read_physical_memory({:#x}, {:#x})", addr, len);
        self.provider.read_physical_memory(addr, len).handle_error()
    }

    /// Write guest-physical memory. Requires the VM to be halted.
    pub fn write_physical_memory(&mut self, addr: u64, data: &[u8]) -> TargetResult<bool, P> {
        trace!("write_physical_memory({:#x}, {:#x})", addr, data.len());
        self.require_halted()?;
        self.provider.write_physical_memory(addr, data).handle_error()
    }

    /// Swallow the next virtual memory write, recording its address as the
    /// location of the kernel's debugger introspection struct (`kdp`).
    ///
    /// Kernels booted without the `debug` boot-arg leave that struct empty,
    /// which breaks client-side kernel macros. Once captured, reads of the
    /// struct report the active thread.
    pub fn capture_introspection_struct(&mut self) {
        trace!("capture_introspection_struct");
        self.capture_introspection_at_next_write = true;
    }

    /// Disarm a pending [`capture_introspection_struct`](Self::capture_introspection_struct).
    ///
    /// Fails once the address has been captured.
    pub fn abort_introspection_capture(&mut self) -> TargetResult<(), P> {
        trace!("abort_introspection_capture");
        if self.introspection_addr.is_some() {
            return Err(TargetError::IntrospectionAlreadyCaptured);
        }
        self.capture_introspection_at_next_write = false;
        Ok(())
    }

    /// Address of the captured introspection struct.
    pub fn introspection_address(&self) -> Option<u64> {
        self.introspection_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::provider::sim::SimVm;
    use crate::target::fixtures::*;

    const KDP: u64 = 0xffff_ff80_0b00_0100;

    #[test]
    fn kernel_pmap_fallback() {
        let mut vm = kernel_memory();
        vm.map_in(KERNEL_CR3, 0xffff_ff80_4000_0000, b"only in kernel space");
        let mut target = attached_target();
        *target.provider_mut() = vm;
        target.provider_mut().set_register(Register::Rip, USER_RIP);
        target.provider_mut().set_register(Register::Cr3, USER_CR3);

        assert_eq!(
            target.read_virtual_memory(0xffff_ff80_4000_0000, 4).unwrap(),
            Some(b"only".to_vec())
        );
        assert_eq!(target.provider().register(Register::Cr3), USER_CR3);

        // no fallback from kernel code
        target.provider_mut().set_register(Register::Rip, KERNEL_RIP);
        assert_eq!(
            target.read_virtual_memory(0xffff_ff80_4000_0000, 4).unwrap(),
            None
        );
    }

    #[test]
    fn introspection_struct() {
        let mut target = attached_target();
        target.provider_mut().map(KDP - 0x100, &[0xff; 0x200]);

        target.capture_introspection_struct();
        assert!(target.write_virtual_memory(KDP, &[1, 2, 3]).unwrap());
        assert_eq!(target.introspection_address(), Some(KDP));
        // the write was swallowed
        assert_eq!(
            target.provider_mut().read_virtual_memory(KDP, 1).unwrap(),
            Some(vec![0xff])
        );

        let data = target.read_virtual_memory(KDP - 4, 24).unwrap().unwrap();
        assert_eq!(&data[..4], &[0xff; 4]);
        assert_eq!(&data[4..12], &[0; 8]);
        assert_eq!(&data[12..20], &ACTIVE_THREAD.to_le_bytes());
        assert_eq!(&data[20..], &[0xff; 4]);

        // the patch is clipped to the read
        let data = target.read_virtual_memory(KDP - 4, 12).unwrap().unwrap();
        assert_eq!(&data[..4], &[0xff; 4]);
        assert_eq!(&data[4..], &[0; 8]);

        // reads starting past the struct's address are not patched
        let data = target.read_virtual_memory(KDP + 8, 8).unwrap().unwrap();
        assert_eq!(data, vec![0xff; 8]);

        // one-shot: later writes go through
        assert!(target.write_virtual_memory(KDP + 0x40, &[7]).unwrap());
        assert_eq!(
            target.provider_mut().read_virtual_memory(KDP + 0x40, 1).unwrap(),
            Some(vec![7])
        );

        assert!(matches!(
            target.abort_introspection_capture(),
            Err(TargetError::IntrospectionAlreadyCaptured)
        ));
    }

    #[test]
    fn abort_capture() {
        let mut target = attached_target();
        target.provider_mut().map(KDP, &[0; 8]);

        target.capture_introspection_struct();
        target.abort_introspection_capture().unwrap();
        assert!(target.write_virtual_memory(KDP, &[5]).unwrap());
        assert_eq!(target.introspection_address(), None);
    }

    #[test]
    fn physical_memory() {
        let mut target = DebugTarget::new(SimVm::new().with_physical_memory(0x2000));
        assert!(target.write_physical_memory(0x1ffe, &[1, 2]).unwrap());
        assert_eq!(
            target.read_physical_memory(0x1ffe, 2).unwrap(),
            Some(vec![1, 2])
        );
        assert_eq!(target.read_physical_memory(0x1fff, 2).unwrap(), None);

        target.provider_mut().resume().unwrap();
        assert!(matches!(
            target.write_physical_memory(0, &[0]),
            Err(TargetError::NotHalted)
        ));
    }
}
