//! The hypervisor capability interface consumed by [`DebugTarget`].
//!
//! A `Provider` exposes a small, fixed set of VM-control primitives: run
//! control, register / MSR / memory access, breakpoints, and snapshots. It
//! knows nothing about KDP, or about the kernel running inside the VM. All of
//! that lives in [`DebugTarget`].
//!
//! The [`sim`] module contains an in-memory implementation, which can be used
//! to exercise the rest of the crate without a hypervisor.
//!
//! [`DebugTarget`]: crate::target::DebugTarget

use core::fmt::Debug;

use crate::arch::x86_64::Register;

pub mod sim;

bitflags::bitflags! {
    /// Execution state of the VM, as reported by the provider.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProviderState: u16 {
        /// The VM is not executing.
        const PAUSED = 0x1;
        /// Execution stopped on a provider-managed breakpoint.
        const BREAKPOINT_HIT = 0x2;
        /// A debugger has been alerted of a state change.
        const DEBUGGER_ALERTED = 0x4;
        /// Execution stopped on a hardware (DR0-DR3) breakpoint.
        const HARD_BREAKPOINT_HIT = 0x8;
    }
}

bitflags::bitflags! {
    /// Which accesses trigger a breakpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessType: u16 {
        #[allow(missing_docs)]
        const EXECUTE = 0x1;
        #[allow(missing_docs)]
        const WRITE = 0x2;
        #[allow(missing_docs)]
        const READ = 0x4;
        #[allow(missing_docs)]
        const INSTRUCTION_FETCH = 0x8;
    }
}

/// Breakpoint implementation requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Patched-instruction breakpoint.
    Soft,
    /// Debug register breakpoint, managed by the provider.
    Hard,
    /// Page-protection breakpoint.
    Page,
    /// Breakpoint on MSR access. The address is the MSR number.
    Msr,
    /// Breakpoint on control register access. The address is the CR number.
    Cr,
}

/// Address space a breakpoint address lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    #[allow(missing_docs)]
    Virtual,
    #[allow(missing_docs)]
    Physical,
}

/// Provider-assigned breakpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u8);

/// A full description of a breakpoint, as passed to
/// [`Provider::set_breakpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointSpec {
    /// Breakpoint implementation.
    pub kind: BreakpointKind,
    /// Accesses which trigger the breakpoint.
    pub access: AccessType,
    /// Address space of `address`.
    pub address_type: AddressType,
    /// Breakpoint address (or MSR / CR number).
    pub address: u64,
    /// Length of the watched range, in bytes.
    pub length: u64,
    /// Only trigger in the address space with this CR3. `None` triggers in
    /// every address space.
    pub cr3: Option<u64>,
}

impl BreakpointSpec {
    /// A software execute breakpoint at a virtual address.
    pub fn soft_exec(address: u64) -> BreakpointSpec {
        BreakpointSpec {
            kind: BreakpointKind::Soft,
            access: AccessType::EXECUTE,
            address_type: AddressType::Virtual,
            address,
            length: 1,
            cr3: None,
        }
    }

    /// A breakpoint triggering on writes to control register `cr`.
    pub fn cr_write(cr: u64) -> BreakpointSpec {
        BreakpointSpec {
            kind: BreakpointKind::Cr,
            access: AccessType::WRITE,
            address_type: AddressType::Virtual,
            address: cr,
            length: 1,
            cr3: None,
        }
    }
}

/// Hypervisor-level VM-control primitives.
///
/// Only single-CPU VMs are supported: every per-CPU operation targets CPU 0.
pub trait Provider {
    /// A provider-specific error.
    type Error: Debug;

    /// Pause VM execution.
    fn pause(&mut self) -> Result<(), Self::Error>;

    /// Resume VM execution.
    fn resume(&mut self) -> Result<(), Self::Error>;

    /// Execute a single instruction, then pause.
    fn single_step(&mut self) -> Result<(), Self::Error>;

    /// Current execution state.
    fn state(&mut self) -> Result<ProviderState, Self::Error>;

    /// Returns `true` if the state changed since the last call.
    fn state_changed(&mut self) -> Result<bool, Self::Error>;

    /// Block (without timeout) until the execution state changes, returning
    /// the new state.
    fn wait_for_state_change(&mut self) -> Result<ProviderState, Self::Error>;

    /// Number of logical CPUs in the VM.
    fn cpu_count(&mut self) -> Result<u32, Self::Error>;

    /// Read a register.
    fn read_register(&mut self, reg: Register) -> Result<u64, Self::Error>;

    /// Write a register.
    fn write_register(&mut self, reg: Register, val: u64) -> Result<(), Self::Error>;

    /// Read a model-specific register.
    fn read_msr(&mut self, msr: u32) -> Result<u64, Self::Error>;

    /// Write a model-specific register.
    fn write_msr(&mut self, msr: u32, val: u64) -> Result<(), Self::Error>;

    /// Read `len` bytes of virtual memory, translated through the current
    /// CR3.
    ///
    /// Returns `Ok(None)` if the range is not (fully) mapped.
    fn read_virtual_memory(&mut self, addr: u64, len: usize)
        -> Result<Option<Vec<u8>>, Self::Error>;

    /// Write virtual memory. Returns `Ok(false)` if the range is not (fully)
    /// mapped.
    fn write_virtual_memory(&mut self, addr: u64, data: &[u8]) -> Result<bool, Self::Error>;

    /// Read `len` bytes of guest-physical memory.
    ///
    /// Returns `Ok(None)` if the range lies outside of guest RAM.
    fn read_physical_memory(&mut self, addr: u64, len: usize)
        -> Result<Option<Vec<u8>>, Self::Error>;

    /// Write guest-physical memory. Returns `Ok(false)` if the range lies
    /// outside of guest RAM.
    fn write_physical_memory(&mut self, addr: u64, data: &[u8]) -> Result<bool, Self::Error>;

    /// Install a breakpoint.
    ///
    /// Returns `Ok(None)` if the provider has no room left for it.
    fn set_breakpoint(&mut self, spec: BreakpointSpec)
        -> Result<Option<BreakpointId>, Self::Error>;

    /// Remove a breakpoint. Returns `Ok(false)` if `id` is unknown.
    fn unset_breakpoint(&mut self, id: BreakpointId) -> Result<bool, Self::Error>;

    /// Remove every provider-managed breakpoint.
    fn unset_all_breakpoints(&mut self) -> Result<(), Self::Error>;

    /// Save a snapshot of the whole VM.
    fn save(&mut self) -> Result<(), Self::Error>;

    /// Restore the last snapshot. Returns `Ok(false)` if there is none.
    fn restore(&mut self) -> Result<bool, Self::Error>;
}
