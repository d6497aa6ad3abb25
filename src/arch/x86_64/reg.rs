use crate::internal::LeBytes;

/// x86-64 register identifier, covering every register the debug target
/// reads or writes through the capability provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Cr8,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
    Dr7,
}

impl Register {
    /// Number of register identifiers.
    pub const COUNT: usize = 35;

    /// Every register, in declaration order.
    #[rustfmt::skip]
    pub const ALL: [Register; Register::COUNT] = {
        use self::Register::*;
        [
            Rax, Rbx, Rcx, Rdx, Rdi, Rsi, Rbp, Rsp,
            R8, R9, R10, R11, R12, R13, R14, R15,
            Rip, Rflags,
            Cs, Ds, Es, Fs, Gs, Ss,
            Cr0, Cr2, Cr3, Cr4, Cr8,
            Dr0, Dr1, Dr2, Dr3, Dr6, Dr7,
        ]
    };

    /// Debug address registers, indexed by hardware breakpoint slot.
    pub const DEBUG_ADDRESS: [Register; 4] =
        [Register::Dr0, Register::Dr1, Register::Dr2, Register::Dr3];

    /// Dense index of the register, suitable for register-file arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// `x86_THREAD_STATE64`: the general purpose register set exchanged by
/// `READREGS` and `WRITEREGS`.
///
/// Source: <https://github.com/apple/darwin-xnu/blob/xnu-4903.221.2/osfmk/mach/i386/_structs.h#L658>
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ThreadState64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

impl ThreadState64 {
    /// Number of registers in the set.
    pub const LEN: usize = 21;

    /// The registers making up the set, in wire order.
    #[rustfmt::skip]
    pub const REGISTERS: [Register; ThreadState64::LEN] = {
        use self::Register::*;
        [
            Rax, Rbx, Rcx, Rdx, Rdi, Rsi, Rbp, Rsp,
            R8, R9, R10, R11, R12, R13, R14, R15,
            Rip, Rflags, Cs, Fs, Gs,
        ]
    };

    /// Register values in wire order.
    pub fn to_array(&self) -> [u64; ThreadState64::LEN] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rdi, self.rsi, self.rbp, self.rsp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
            self.rip, self.rflags, self.cs, self.fs, self.gs,
        ]
    }

    /// Build a register set from values in wire order.
    pub fn from_array(vals: [u64; ThreadState64::LEN]) -> Self {
        let [
            rax,
            rbx,
            rcx,
            rdx,
            rdi,
            rsi,
            rbp,
            rsp,
            r8,
            r9,
            r10,
            r11,
            r12,
            r13,
            r14,
            r15,
            rip,
            rflags,
            cs,
            fs,
            gs,
        ] = vals;
        ThreadState64 {
            rax,
            rbx,
            rcx,
            rdx,
            rdi,
            rsi,
            rbp,
            rsp,
            r8,
            r9,
            r10,
            r11,
            r12,
            r13,
            r14,
            r15,
            rip,
            rflags,
            cs,
            fs,
            gs,
        }
    }

    /// Iterate over `(register, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (Register, u64)> {
        IntoIterator::into_iter(Self::REGISTERS).zip(IntoIterator::into_iter(self.to_array()))
    }
}

impl LeBytes for ThreadState64 {
    const SIZE: usize = ThreadState64::LEN * 8;

    fn write_le(&self, out: &mut Vec<u8>) {
        for val in self.to_array().iter() {
            val.write_le(out);
        }
    }

    fn read_le(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(..Self::SIZE)?;

        let mut vals = [0u64; ThreadState64::LEN];
        for (val, chunk) in vals.iter_mut().zip(buf.chunks_exact(8)) {
            *val = u64::read_le(chunk)?;
        }

        Some(ThreadState64::from_array(vals))
    }
}
