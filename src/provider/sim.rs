//! An in-memory x86-64 "VM", driven by a scripted execution trace.
//!
//! `SimVm` doesn't decode instructions. Instead, the test (or demo) scripts
//! which addresses the CPU visits, and which side effects each step has
//! (CR3 writes, memory writes). Breakpoints, debug registers, per-address-space
//! paging and snapshots are modeled on top of that trace.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::arch::x86_64::{Register, PAGE_SIZE};

use super::{
    AccessType, AddressType, BreakpointId, BreakpointKind, BreakpointSpec, Provider, ProviderState,
};

/// One step of the scripted execution trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// RIP after the step.
    pub rip: u64,
    /// Value written to CR3 by the step.
    pub cr3: Option<u64>,
    /// Virtual address written by the step.
    pub write: Option<u64>,
}

impl Step {
    /// A step which lands on `rip` without side effects.
    pub fn to(rip: u64) -> Step {
        Step {
            rip,
            cr3: None,
            write: None,
        }
    }

    /// Make the step write `cr3` into CR3.
    pub fn writing_cr3(mut self, cr3: u64) -> Step {
        self.cr3 = Some(cr3);
        self
    }

    /// Make the step write to virtual address `addr`.
    pub fn writing(mut self, addr: u64) -> Step {
        self.write = Some(addr);
        self
    }
}

/// Errors reported by [`SimVm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    /// The MSR was never set.
    UnknownMsr(u32),
    /// A fault armed with [`SimVm::inject_fault`].
    Injected,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::UnknownMsr(msr) => write!(f, "unknown MSR {:#x}", msr),
            SimError::Injected => write!(f, "injected fault"),
        }
    }
}

impl std::error::Error for SimError {}

/// How many times each run-control primitive was invoked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    #[allow(missing_docs)]
    pub pause: usize,
    #[allow(missing_docs)]
    pub resume: usize,
    #[allow(missing_docs)]
    pub single_step: usize,
    /// Virtual memory reads, successful or not.
    pub virtual_reads: usize,
}

#[derive(Debug)]
enum Event {
    Break,
    HardBreak,
}

#[derive(Debug, Clone)]
struct Machine {
    regs: [u64; Register::COUNT],
    msrs: BTreeMap<u32, u64>,
    // keyed by (owning CR3, page base). `None` pages are visible from every
    // address space.
    pages: BTreeMap<(Option<u64>, u64), Vec<u8>>,
    phys: Vec<u8>,
    trace: VecDeque<Step>,
}

/// An in-memory single-CPU guest. See the module docs.
#[derive(Debug)]
pub struct SimVm {
    machine: Machine,
    snapshot: Option<Box<Machine>>,

    cpus: u32,
    state: ProviderState,
    changed: bool,

    breakpoints: BTreeMap<BreakpointId, BreakpointSpec>,
    breakpoint_capacity: usize,

    // provider calls left before the injected fault
    fault: Option<usize>,
    calls: CallCounts,
}

impl Default for SimVm {
    fn default() -> SimVm {
        SimVm::new()
    }
}

impl SimVm {
    /// Create a paused single-CPU VM with zeroed registers and no memory.
    pub fn new() -> SimVm {
        SimVm {
            machine: Machine {
                regs: [0; Register::COUNT],
                msrs: BTreeMap::new(),
                pages: BTreeMap::new(),
                phys: Vec::new(),
                trace: VecDeque::new(),
            },
            snapshot: None,

            cpus: 1,
            state: ProviderState::PAUSED,
            changed: false,

            breakpoints: BTreeMap::new(),
            breakpoint_capacity: 64,

            fault: None,
            calls: CallCounts::default(),
        }
    }

    /// Report `cpus` logical CPUs.
    pub fn with_cpus(mut self, cpus: u32) -> SimVm {
        self.cpus = cpus;
        self
    }

    /// Accept at most `capacity` simultaneous breakpoints.
    pub fn with_breakpoint_capacity(mut self, capacity: usize) -> SimVm {
        self.breakpoint_capacity = capacity;
        self
    }

    /// Give the VM `size` bytes of zeroed physical RAM.
    pub fn with_physical_memory(mut self, size: usize) -> SimVm {
        self.machine.phys = vec![0; size];
        self
    }

    /// Directly set a register, bypassing fault injection.
    pub fn set_register(&mut self, reg: Register, val: u64) {
        self.machine.regs[reg.index()] = val;
    }

    /// Directly read a register.
    pub fn register(&self, reg: Register) -> u64 {
        self.machine.regs[reg.index()]
    }

    /// Directly set an MSR.
    pub fn set_msr(&mut self, msr: u32, val: u64) {
        self.machine.msrs.insert(msr, val);
    }

    /// Map (zero-filled) pages covering `addr..addr + data.len()` in every
    /// address space, and copy `data` there.
    pub fn map(&mut self, addr: u64, data: &[u8]) {
        self.map_pages(None, addr, data)
    }

    /// Like [`map`](Self::map), but the pages are only visible while CR3
    /// equals `cr3`.
    pub fn map_in(&mut self, cr3: u64, addr: u64, data: &[u8]) {
        self.map_pages(Some(cr3), addr, data)
    }

    fn map_pages(&mut self, owner: Option<u64>, addr: u64, data: &[u8]) {
        let mut cur = addr;
        for chunk in PageChunks::new(addr, data.len()) {
            let page = self
                .machine
                .pages
                .entry((owner, chunk.base))
                .or_insert_with(|| vec![0; PAGE_SIZE as usize]);
            let src = (cur - addr) as usize;
            page[chunk.offset..chunk.offset + chunk.len]
                .copy_from_slice(&data[src..src + chunk.len]);
            cur += chunk.len as u64;
        }
    }

    /// Append steps to the execution trace.
    pub fn push_steps(&mut self, steps: impl IntoIterator<Item = Step>) {
        self.machine.trace.extend(steps)
    }

    /// Number of steps left in the trace.
    pub fn steps_left(&self) -> usize {
        self.machine.trace.len()
    }

    /// Breakpoints currently installed.
    pub fn breakpoints(&self) -> impl Iterator<Item = (&BreakpointId, &BreakpointSpec)> {
        self.breakpoints.iter()
    }

    /// Make the next provider call fail with [`SimError::Injected`].
    pub fn inject_fault(&mut self) {
        self.inject_fault_after(0);
    }

    /// Let `calls` provider calls through, then make the next one fail with
    /// [`SimError::Injected`].
    pub fn inject_fault_after(&mut self, calls: usize) {
        self.fault = Some(calls);
    }

    /// Run-control statistics.
    pub fn calls(&self) -> CallCounts {
        self.calls
    }

    fn check_fault(&mut self) -> Result<(), SimError> {
        match self.fault {
            Some(0) => {
                self.fault = None;
                Err(SimError::Injected)
            }
            Some(n) => {
                self.fault = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn reg(&self, reg: Register) -> u64 {
        self.machine.regs[reg.index()]
    }

    fn set_state(&mut self, state: ProviderState) {
        if self.state != state {
            self.state = state;
            self.changed = true;
        }
    }

    fn translate(&self, addr: u64) -> Option<(Option<u64>, u64)> {
        let base = addr & !(PAGE_SIZE - 1);
        let cr3 = self.reg(Register::Cr3);
        IntoIterator::into_iter([Some(cr3), None])
            .map(|owner| (owner, base))
            .find(|key| self.machine.pages.contains_key(key))
    }

    fn read_virt(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        addr.checked_add(len as u64)?;

        let mut out = Vec::with_capacity(len);
        for chunk in PageChunks::new(addr, len) {
            let key = self.translate(chunk.base)?;
            let page = self.machine.pages.get(&key)?;
            out.extend_from_slice(&page[chunk.offset..chunk.offset + chunk.len]);
        }
        Some(out)
    }

    fn write_virt(&mut self, addr: u64, data: &[u8]) -> bool {
        if addr.checked_add(data.len() as u64).is_none() {
            return false;
        }

        let mut keys = Vec::new();
        for chunk in PageChunks::new(addr, data.len()) {
            match self.translate(chunk.base) {
                Some(key) => keys.push((key, chunk)),
                None => return false,
            }
        }

        let mut src = 0;
        for (key, chunk) in keys {
            if let Some(page) = self.machine.pages.get_mut(&key) {
                page[chunk.offset..chunk.offset + chunk.len]
                    .copy_from_slice(&data[src..src + chunk.len]);
            }
            src += chunk.len;
        }
        true
    }

    /// Returns the DR0-DR3 slots enabled in DR7, along with their 2-bit
    /// trigger condition.
    fn enabled_debug_slots(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let dr7 = self.reg(Register::Dr7);
        (0..4usize).filter_map(move |slot| {
            let enabled = (dr7 >> (2 * slot)) & 0b11 != 0;
            let trigger = (dr7 >> (16 + 4 * slot)) & 0b11;
            if enabled {
                Some((self.reg(Register::DEBUG_ADDRESS[slot]), trigger))
            } else {
                None
            }
        })
    }

    /// Execute one step of the trace. Returns `None` when the trace is
    /// exhausted.
    fn step(&mut self) -> Option<Option<Event>> {
        let step = self.machine.trace.pop_front()?;

        self.machine.regs[Register::Rip.index()] = step.rip;
        if let Some(cr3) = step.cr3 {
            self.machine.regs[Register::Cr3.index()] = cr3;
        }

        let cr3 = self.reg(Register::Cr3);
        let cr3_matches = |spec: &BreakpointSpec| spec.cr3.map_or(true, |want| want == cr3);

        for spec in self.breakpoints.values() {
            let hit = match spec.kind {
                BreakpointKind::Soft | BreakpointKind::Hard => {
                    spec.access.contains(AccessType::EXECUTE)
                        && spec.address_type == AddressType::Virtual
                        && spec.address == step.rip
                        && cr3_matches(spec)
                }
                BreakpointKind::Cr => {
                    spec.address == 3
                        && spec.access.contains(AccessType::WRITE)
                        && step.cr3.is_some()
                }
                // not modeled
                BreakpointKind::Page | BreakpointKind::Msr => false,
            };

            if hit {
                return Some(Some(match spec.kind {
                    BreakpointKind::Hard => Event::HardBreak,
                    _ => Event::Break,
                }));
            }
        }

        for (addr, trigger) in self.enabled_debug_slots() {
            let hit = match trigger {
                0b00 => addr == step.rip,
                0b01 | 0b11 => step.write == Some(addr),
                _ => false,
            };
            if hit {
                return Some(Some(Event::HardBreak));
            }
        }

        Some(None)
    }

    fn stop_on(&mut self, event: Event) {
        let state = match event {
            Event::Break => ProviderState::PAUSED | ProviderState::BREAKPOINT_HIT,
            Event::HardBreak => ProviderState::PAUSED | ProviderState::HARD_BREAKPOINT_HIT,
        };
        self.set_state(state);
    }
}

struct PageChunk {
    base: u64,
    offset: usize,
    len: usize,
}

/// Splits `addr..addr + len` at page boundaries.
struct PageChunks {
    cur: u64,
    end: u64,
}

impl PageChunks {
    fn new(addr: u64, len: usize) -> PageChunks {
        PageChunks {
            cur: addr,
            end: addr.saturating_add(len as u64),
        }
    }
}

impl Iterator for PageChunks {
    type Item = PageChunk;

    fn next(&mut self) -> Option<PageChunk> {
        if self.cur >= self.end {
            return None;
        }
        let base = self.cur & !(PAGE_SIZE - 1);
        let offset = (self.cur - base) as usize;
        let len = core::cmp::min(PAGE_SIZE - offset as u64, self.end - self.cur) as usize;
        self.cur += len as u64;
        Some(PageChunk { base, offset, len })
    }
}

impl Provider for SimVm {
    type Error = SimError;

    fn pause(&mut self) -> Result<(), SimError> {
        self.check_fault()?;
        self.calls.pause += 1;
        let state = self.state | ProviderState::PAUSED;
        self.set_state(state);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), SimError> {
        self.check_fault()?;
        self.calls.resume += 1;
        self.set_state(ProviderState::empty());
        self.changed = true;

        while let Some(event) = self.step() {
            if let Some(event) = event {
                self.stop_on(event);
                break;
            }
        }
        Ok(())
    }

    fn single_step(&mut self) -> Result<(), SimError> {
        self.check_fault()?;
        self.calls.single_step += 1;
        match self.step() {
            Some(Some(event)) => self.stop_on(event),
            _ => {
                self.state = ProviderState::PAUSED;
                self.changed = true;
            }
        }
        Ok(())
    }

    fn state(&mut self) -> Result<ProviderState, SimError> {
        self.check_fault()?;
        Ok(self.state)
    }

    fn state_changed(&mut self) -> Result<bool, SimError> {
        self.check_fault()?;
        Ok(core::mem::replace(&mut self.changed, false))
    }

    fn wait_for_state_change(&mut self) -> Result<ProviderState, SimError> {
        self.check_fault()?;
        // execution is synchronous: by now, any state change has happened
        self.changed = false;
        Ok(self.state)
    }

    fn cpu_count(&mut self) -> Result<u32, SimError> {
        self.check_fault()?;
        Ok(self.cpus)
    }

    fn read_register(&mut self, reg: Register) -> Result<u64, SimError> {
        self.check_fault()?;
        Ok(self.reg(reg))
    }

    fn write_register(&mut self, reg: Register, val: u64) -> Result<(), SimError> {
        self.check_fault()?;
        self.machine.regs[reg.index()] = val;
        Ok(())
    }

    fn read_msr(&mut self, msr: u32) -> Result<u64, SimError> {
        self.check_fault()?;
        self.machine
            .msrs
            .get(&msr)
            .copied()
            .ok_or(SimError::UnknownMsr(msr))
    }

    fn write_msr(&mut self, msr: u32, val: u64) -> Result<(), SimError> {
        self.check_fault()?;
        self.machine.msrs.insert(msr, val);
        Ok(())
    }

    fn read_virtual_memory(&mut self, addr: u64, len: usize) -> Result<Option<Vec<u8>>, SimError> {
        self.check_fault()?;
        self.calls.virtual_reads += 1;
        Ok(self.read_virt(addr, len))
    }

    fn write_virtual_memory(&mut self, addr: u64, data: &[u8]) -> Result<bool, SimError> {
        self.check_fault()?;
        Ok(self.write_virt(addr, data))
    }

    fn read_physical_memory(
        &mut self,
        addr: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>, SimError> {
        self.check_fault()?;
        let start = addr as usize;
        Ok(start
            .checked_add(len)
            .and_then(|end| self.machine.phys.get(start..end))
            .map(|data| data.to_vec()))
    }

    fn write_physical_memory(&mut self, addr: u64, data: &[u8]) -> Result<bool, SimError> {
        self.check_fault()?;
        let start = addr as usize;
        let dst = start
            .checked_add(data.len())
            .and_then(|end| self.machine.phys.get_mut(start..end));
        match dst {
            Some(dst) => {
                dst.copy_from_slice(data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_breakpoint(&mut self, spec: BreakpointSpec) -> Result<Option<BreakpointId>, SimError> {
        self.check_fault()?;
        if self.breakpoints.len() >= self.breakpoint_capacity {
            return Ok(None);
        }

        let id = (0..=u8::MAX)
            .map(BreakpointId)
            .find(|id| !self.breakpoints.contains_key(id));
        if let Some(id) = id {
            self.breakpoints.insert(id, spec);
        }
        Ok(id)
    }

    fn unset_breakpoint(&mut self, id: BreakpointId) -> Result<bool, SimError> {
        self.check_fault()?;
        Ok(self.breakpoints.remove(&id).is_some())
    }

    fn unset_all_breakpoints(&mut self) -> Result<(), SimError> {
        self.check_fault()?;
        self.breakpoints.clear();
        Ok(())
    }

    fn save(&mut self) -> Result<(), SimError> {
        self.check_fault()?;
        self.snapshot = Some(Box::new(self.machine.clone()));
        Ok(())
    }

    fn restore(&mut self) -> Result<bool, SimError> {
        self.check_fault()?;
        let snapshot = match &self.snapshot {
            Some(snapshot) => snapshot,
            None => return Ok(false),
        };

        self.machine = Machine::clone(snapshot);
        self.breakpoints.clear();
        self.state = ProviderState::PAUSED;
        self.changed = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL_CR3: u64 = 0x1000;
    const USER_CR3: u64 = 0x2000;

    #[test]
    fn paged_memory() {
        let mut vm = SimVm::new();
        vm.map(0xffff_ff80_0000_0ffe, &[1, 2, 3, 4]);

        // crosses a page boundary
        assert_eq!(
            vm.read_virtual_memory(0xffff_ff80_0000_0ffe, 4).unwrap(),
            Some(vec![1, 2, 3, 4])
        );
        assert_eq!(vm.read_virtual_memory(0xffff_ff80_0000_1ffe, 4).unwrap(), None);

        assert!(vm.write_virtual_memory(0xffff_ff80_0000_0fff, &[9, 9]).unwrap());
        assert_eq!(
            vm.read_virtual_memory(0xffff_ff80_0000_0ffe, 4).unwrap(),
            Some(vec![1, 9, 9, 4])
        );
        assert!(!vm.write_virtual_memory(0xffff_ff80_0000_1fff, &[0, 0]).unwrap());
    }

    #[test]
    fn address_spaces() {
        let mut vm = SimVm::new();
        vm.map_in(KERNEL_CR3, 0xffff_ff80_0040_0000, &[0xaa]);

        vm.set_register(Register::Cr3, USER_CR3);
        assert_eq!(vm.read_virtual_memory(0xffff_ff80_0040_0000, 1).unwrap(), None);

        vm.set_register(Register::Cr3, KERNEL_CR3);
        assert_eq!(
            vm.read_virtual_memory(0xffff_ff80_0040_0000, 1).unwrap(),
            Some(vec![0xaa])
        );
    }

    #[test]
    fn resume_stops_on_soft_breakpoint() {
        let mut vm = SimVm::new();
        vm.push_steps(vec![Step::to(0x10), Step::to(0x20), Step::to(0x30)]);
        vm.set_breakpoint(BreakpointSpec::soft_exec(0x20)).unwrap();

        vm.resume().unwrap();
        assert_eq!(vm.register(Register::Rip), 0x20);
        assert_eq!(
            vm.state().unwrap(),
            ProviderState::PAUSED | ProviderState::BREAKPOINT_HIT
        );
        assert!(vm.state_changed().unwrap());
        assert!(!vm.state_changed().unwrap());

        // runs off the end of the trace, and keeps "running"
        vm.resume().unwrap();
        assert_eq!(vm.register(Register::Rip), 0x30);
        assert_eq!(vm.state().unwrap(), ProviderState::empty());
    }

    #[test]
    fn cr3_write_breakpoint() {
        let mut vm = SimVm::new();
        vm.push_steps(vec![
            Step::to(0x1000),
            Step::to(0xffff_ff80_0030_0000).writing_cr3(KERNEL_CR3),
            Step::to(0xffff_ff80_0030_0004),
        ]);
        vm.set_breakpoint(BreakpointSpec::cr_write(3)).unwrap();

        vm.resume().unwrap();
        assert_eq!(vm.register(Register::Rip), 0xffff_ff80_0030_0000);
        assert_eq!(vm.register(Register::Cr3), KERNEL_CR3);
        assert_eq!(vm.steps_left(), 1);
    }

    #[test]
    fn debug_register_watch() {
        let mut vm = SimVm::new();
        vm.push_steps(vec![Step::to(0x10), Step::to(0x14).writing(0x8000)]);
        vm.set_register(Register::Dr1, 0x8000);
        // slot 1: write trigger, globally enabled
        vm.set_register(Register::Dr7, (0b01 << 20) | (0b10 << 2));

        vm.resume().unwrap();
        assert_eq!(vm.register(Register::Rip), 0x14);
        assert!(vm
            .state()
            .unwrap()
            .contains(ProviderState::HARD_BREAKPOINT_HIT));
    }

    #[test]
    fn snapshot() {
        let mut vm = SimVm::new();
        assert!(!vm.restore().unwrap());

        vm.map(0x4000, &[1]);
        vm.set_register(Register::Rax, 1);
        vm.save().unwrap();

        vm.write_virtual_memory(0x4000, &[2]).unwrap();
        vm.set_register(Register::Rax, 2);
        vm.set_breakpoint(BreakpointSpec::soft_exec(0x4000)).unwrap();

        assert!(vm.restore().unwrap());
        assert_eq!(vm.register(Register::Rax), 1);
        assert_eq!(vm.read_virtual_memory(0x4000, 1).unwrap(), Some(vec![1]));
        assert_eq!(vm.breakpoints().count(), 0);
    }

    #[test]
    fn breakpoint_capacity() {
        let mut vm = SimVm::new().with_breakpoint_capacity(1);
        let id = vm.set_breakpoint(BreakpointSpec::soft_exec(0x10)).unwrap();
        assert_eq!(id, Some(BreakpointId(0)));
        assert_eq!(vm.set_breakpoint(BreakpointSpec::soft_exec(0x20)).unwrap(), None);
        assert!(vm.unset_breakpoint(BreakpointId(0)).unwrap());
        assert!(!vm.unset_breakpoint(BreakpointId(0)).unwrap());
    }

    #[test]
    fn injected_fault_is_one_shot() {
        let mut vm = SimVm::new();
        vm.inject_fault();
        assert_eq!(vm.pause(), Err(SimError::Injected));
        assert_eq!(vm.pause(), Ok(()));

        vm.inject_fault_after(2);
        assert_eq!(vm.pause(), Ok(()));
        assert_eq!(vm.cpu_count(), Ok(1));
        assert_eq!(vm.pause(), Err(SimError::Injected));
        assert_eq!(vm.pause(), Ok(()));
    }
}
