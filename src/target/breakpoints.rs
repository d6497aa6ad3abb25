//! Software breakpoints (delegated to the provider), and hardware breakpoints
//! (programmed directly into DR0-DR3 / DR7).

use core::fmt;
use core::str::FromStr;

use log::{debug, trace};

use crate::arch::x86_64::Register;
use crate::provider::{BreakpointId, BreakpointSpec, Provider};

use super::{DebugTarget, ProviderResultExt, TargetError, TargetResult};

/// Access which triggers a hardware breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwTrigger {
    /// Instruction execution.
    Execute,
    /// Data writes.
    Write,
    /// Data reads or writes.
    ReadWrite,
}

impl HwTrigger {
    /// The DR7 R/W field encoding.
    fn bits(self) -> u64 {
        match self {
            HwTrigger::Execute => 0b00,
            HwTrigger::Write => 0b01,
            HwTrigger::ReadWrite => 0b11,
        }
    }
}

/// Error returned when parsing an [`HwTrigger`] other than `e`, `w` or `rw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseHwTriggerError(String);

impl fmt::Display for ParseHwTriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger {:?} (expected one of e, w, rw)", self.0)
    }
}

impl std::error::Error for ParseHwTriggerError {}

impl FromStr for HwTrigger {
    type Err = ParseHwTriggerError;

    fn from_str(s: &str) -> Result<HwTrigger, ParseHwTriggerError> {
        match s {
            "e" => Ok(HwTrigger::Execute),
            "w" => Ok(HwTrigger::Write),
            "rw" => Ok(HwTrigger::ReadWrite),
            other => Err(ParseHwTriggerError(other.to_string())),
        }
    }
}

fn trigger_shift(slot: u8) -> u64 {
    16 + 4 * slot as u64
}

fn enable_shift(slot: u8) -> u64 {
    2 * slot as u64
}

/// Program `slot` in a DR7 value: replace its trigger, and enable it globally.
fn dr7_set_slot(dr7: u64, slot: u8, trigger: HwTrigger) -> u64 {
    let dr7 = dr7 & !(0b11 << trigger_shift(slot));
    let dr7 = dr7 | trigger.bits() << trigger_shift(slot);
    dr7 | 0b10 << enable_shift(slot)
}

/// Disable `slot` (both locally and globally) in a DR7 value.
fn dr7_clear_slot(dr7: u64, slot: u8) -> u64 {
    dr7 & !(0b11 << enable_shift(slot))
}

impl<P: Provider> DebugTarget<P> {
    /// Set a software execute breakpoint. Requires the VM to be halted.
    pub fn set_soft_breakpoint(&mut self, addr: u64) -> TargetResult<BreakpointId, P> {
        trace!("set_soft_breakpoint({:#018x})", addr);
        self.require_halted()?;

        if self.soft_breakpoints.contains_key(&addr) {
            return Err(TargetError::BreakpointAlreadySet(addr));
        }

        let id = self
            .provider
            .set_breakpoint(BreakpointSpec::soft_exec(addr))
            .handle_error()?
            .ok_or(TargetError::NoBreakpointRoom)?;
        debug!("breakpoint {:#018x} has id {:?}", addr, id);

        self.soft_breakpoints.insert(addr, id);
        Ok(id)
    }

    /// Remove a software breakpoint. Requires the VM to be halted.
    pub fn unset_soft_breakpoint(&mut self, addr: u64) -> TargetResult<(), P> {
        trace!("unset_soft_breakpoint({:#018x})", addr);
        self.require_halted()?;

        let id = self
            .soft_breakpoints
            .remove(&addr)
            .ok_or(TargetError::BreakpointNotFound(addr))?;
        if !self.provider.unset_breakpoint(id).handle_error()? {
            debug!("provider had already dropped breakpoint {:?}", id);
        }
        Ok(())
    }

    /// Program hardware breakpoint `slot` (0-3) to trigger on `trigger`
    /// accesses to `addr`. Requires the VM to be halted.
    pub fn set_hard_breakpoint(
        &mut self,
        trigger: HwTrigger,
        slot: u8,
        addr: u64,
    ) -> TargetResult<(), P> {
        trace!("set_hard_breakpoint({:?}, {}, {:#018x})", trigger, slot, addr);
        self.require_halted()?;
        let dr = debug_address_register(slot).ok_or(TargetError::InvalidSlot(slot))?;

        let dr7 = self.provider.read_register(Register::Dr7).handle_error()?;
        let dr7 = dr7_set_slot(dr7, slot, trigger);
        debug!("dr7 = {:#034b}", dr7);

        self.provider.write_register(dr, addr).handle_error()?;
        self.provider.write_register(Register::Dr7, dr7).handle_error()
    }

    /// Disable hardware breakpoint `slot` (0-3). Requires the VM to be
    /// halted.
    pub fn unset_hard_breakpoint(&mut self, slot: u8) -> TargetResult<(), P> {
        trace!("unset_hard_breakpoint({})", slot);
        self.require_halted()?;
        let dr = debug_address_register(slot).ok_or(TargetError::InvalidSlot(slot))?;

        let dr7 = self.provider.read_register(Register::Dr7).handle_error()?;
        let dr7 = dr7_clear_slot(dr7, slot);
        debug!("dr7 = {:#034b}", dr7);

        self.provider.write_register(dr, 0).handle_error()?;
        self.provider.write_register(Register::Dr7, dr7).handle_error()
    }

    /// Remove every software and hardware breakpoint. Requires the VM to be
    /// halted.
    pub fn unset_all_breakpoints(&mut self) -> TargetResult<(), P> {
        trace!("unset_all_breakpoints");
        self.require_halted()?;

        self.soft_breakpoints.clear();
        self.provider.unset_all_breakpoints().handle_error()?;

        for reg in IntoIterator::into_iter(Register::DEBUG_ADDRESS)
            .chain(IntoIterator::into_iter([Register::Dr6, Register::Dr7]))
        {
            self.provider.write_register(reg, 0).handle_error()?;
        }
        Ok(())
    }
}

fn debug_address_register(slot: u8) -> Option<Register> {
    Register::DEBUG_ADDRESS.get(slot as usize).copied()
}
