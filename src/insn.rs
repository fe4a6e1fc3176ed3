//! Decoded x86/x86-64 instruction model.
//!
//! Instructions carry their raw bytes, a coarse type classification used
//! by the instrumentation engine, and up to [`MAX_OPERANDS`] operands.
//! The last operand slot is reserved for branch targets so that control
//! transfers can be inspected without knowing the operand template of
//! the opcode.

use bitflags::bitflags;

use alloc::string::String;
use alloc::vec::Vec;

/// Maximum number of operands modeled per instruction.
pub const MAX_OPERANDS: usize = 3;
/// Operand slot reserved for branch/call targets.
pub const JUMP_TARGET_OPERAND: usize = 2;

/// Decode mode, fixed per ELF class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Mode32,
    Mode64,
}

impl DecodeMode {
    /// Number of general-purpose registers addressable in this mode.
    #[inline]
    pub fn gpr_count(&self) -> u8 {
        match self {
            DecodeMode::Mode32 => 8,
            DecodeMode::Mode64 => 16,
        }
    }
}

/// A general-purpose register, numbered in hardware encoding order
/// (AX=0, CX=1, DX=2, BX=3, SP=4, BP=5, SI=6, DI=7, R8..R15=8..15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reg(pub u8);

pub const REG_AX: Reg = Reg(0);
pub const REG_CX: Reg = Reg(1);
pub const REG_DX: Reg = Reg(2);
pub const REG_BX: Reg = Reg(3);
pub const REG_SP: Reg = Reg(4);
pub const REG_BP: Reg = Reg(5);
pub const REG_SI: Reg = Reg(6);
pub const REG_DI: Reg = Reg(7);

/// Segment-override prefixes that matter for effective addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

/// Base of a memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemBase {
    /// No base register; the displacement is an absolute address.
    None,
    /// A general-purpose base register.
    Gpr(Reg),
    /// The program counter (RIP/EIP-relative addressing).
    Pc,
}

/// An explicit memory operand: `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: MemBase,
    pub index: Option<Reg>,
    /// Encoded scale factor; 0 means "no scale byte", treated as 1.
    pub scale: u8,
    pub disp: i64,
    pub segment: Option<SegReg>,
}

impl MemOperand {
    /// The scale to multiply the index by (encoded 0 behaves as 1).
    #[inline]
    pub fn effective_scale(&self) -> u8 {
        if self.scale == 0 { 1 } else { self.scale }
    }
}

/// Operand variants, in the order the decoder fills them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Unused,
    /// A PC-relative branch target, stored as the resolved absolute
    /// address.
    ImmRel { target: u64 },
    /// An explicitly encoded register.
    Reg(Reg),
    /// A register implied by the opcode (e.g. AX for `mul`).
    ImplicitReg(Reg),
    /// An immediate value.
    Imm(i64),
    /// An explicit memory reference.
    Mem(MemOperand),
}

impl Operand {
    #[inline]
    pub fn is_unused(&self) -> bool {
        matches!(self, Operand::Unused)
    }
}

/// Coarse instruction classification.
///
/// The classification drives block formation and point eligibility; it
/// deliberately does not distinguish every opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnType {
    Unknown,
    CondBranch,
    Branch,
    Int,
    Float,
    Simd,
    Io,
    Prefetch,
    Syscall,
    HwCount,
}

bitflags! {
    /// Attribute flags recorded during decode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsnFlags: u16 {
        /// The instruction reads from its memory operand.
        const READS_MEMORY   = 1 << 0;
        /// The instruction writes to its memory operand.
        const WRITES_MEMORY  = 1 << 1;
        /// A LOCK prefix was present.
        const LOCK           = 1 << 2;
        /// A REP/REPNE prefix was present.
        const REP            = 1 << 3;
        /// The instruction is a call.
        const CALL           = 1 << 4;
        /// The instruction is a return.
        const RETURN         = 1 << 5;
        /// The instruction references memory PC-relatively.
        const PC_RELATIVE    = 1 << 6;
        /// The branch target is indirect (register or memory).
        const INDIRECT       = 1 << 7;
    }
}

/// A set of general-purpose registers, by hardware number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegSet(pub u32);

impl RegSet {
    pub const fn empty() -> Self {
        RegSet(0)
    }

    #[inline]
    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg.0;
    }

    #[inline]
    pub fn contains(&self, reg: Reg) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    #[inline]
    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg.0);
    }

    /// Registers of `pool_size` GPRs not present in this set, lowest
    /// number first.
    pub fn free_regs(&self, pool_size: u8) -> impl Iterator<Item = Reg> + '_ {
        (0..pool_size).map(Reg).filter(move |r| !self.contains(*r))
    }
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    addr: u64,
    bytes: Vec<u8>,
    /// Authoritative length; may be less than `bytes.len()` after the
    /// tail of a text object is truncated.
    len: u32,
    itype: InsnType,
    flags: InsnFlags,
    operands: [Operand; MAX_OPERANDS],
    mnemonic: String,
    /// Registers read or written, including implicit ones.
    touched: RegSet,
    /// Byte offset of the PC-relative disp32 field, when the memory
    /// operand is PC-relative; the rewriter patches it in displaced
    /// copies.
    pc_disp_offset: Option<u8>,
}

impl Instruction {
    pub(crate) fn new(
        addr: u64,
        bytes: Vec<u8>,
        itype: InsnType,
        flags: InsnFlags,
        operands: [Operand; MAX_OPERANDS],
        mnemonic: String,
        touched: RegSet,
    ) -> Self {
        let len = bytes.len() as u32;
        Instruction {
            addr,
            bytes,
            len,
            itype,
            flags,
            operands,
            mnemonic,
            touched,
            pc_disp_offset: None,
        }
    }

    #[inline]
    pub(crate) fn set_pc_disp_offset(&mut self, off: u8) {
        self.pc_disp_offset = Some(off);
    }

    /// Offset of the PC-relative disp32 field within the raw bytes.
    #[inline]
    pub fn pc_disp_offset(&self) -> Option<u8> {
        self.pc_disp_offset
    }

    /// Builds a raw instruction from pre-encoded bytes.
    ///
    /// Used by the code-emitter library, whose output carries no
    /// virtual address until trampoline layout assigns one.
    pub fn from_encoding(bytes: Vec<u8>, mnemonic: &str, operands: [Operand; MAX_OPERANDS]) -> Self {
        let mut touched = RegSet::empty();
        for op in operands.iter() {
            match op {
                Operand::Reg(r) | Operand::ImplicitReg(r) => touched.insert(*r),
                Operand::Mem(m) => {
                    if let MemBase::Gpr(r) = m.base {
                        touched.insert(r);
                    }
                    if let Some(r) = m.index {
                        touched.insert(r);
                    }
                }
                _ => {}
            }
        }
        Instruction::new(
            0,
            bytes,
            InsnType::Int,
            InsnFlags::empty(),
            operands,
            String::from(mnemonic),
            touched,
        )
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub(crate) fn set_addr(&mut self, addr: u64) {
        self.addr = addr;
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Truncates the instruction to `len` bytes.
    ///
    /// Applied when the decoder over-ran the containing text object;
    /// the truncated tail is treated as raw bytes by the rewriter.
    pub(crate) fn truncate(&mut self, len: u32) {
        debug_assert!(len <= self.len);
        self.len = len;
        self.bytes.truncate(len as usize);
        self.itype = InsnType::Unknown;
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Address of the instruction that follows in the byte stream.
    #[inline]
    pub fn next_addr(&self) -> u64 {
        self.addr + self.len as u64
    }

    #[inline]
    pub fn itype(&self) -> InsnType {
        self.itype
    }

    #[inline]
    pub fn flags(&self) -> InsnFlags {
        self.flags
    }

    #[inline]
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    #[inline]
    pub fn operand(&self, idx: usize) -> &Operand {
        &self.operands[idx]
    }

    #[inline]
    pub fn operands(&self) -> &[Operand; MAX_OPERANDS] {
        &self.operands
    }

    /// True if this instruction may transfer control (branches, calls,
    /// and returns). Syscalls resume at the next instruction and are
    /// not control transfers for block-formation purposes.
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self.itype, InsnType::Branch | InsnType::CondBranch)
    }

    #[inline]
    pub fn is_cond_branch(&self) -> bool {
        self.itype == InsnType::CondBranch
    }

    #[inline]
    pub fn is_call(&self) -> bool {
        self.flags.contains(InsnFlags::CALL)
    }

    #[inline]
    pub fn is_return(&self) -> bool {
        self.flags.contains(InsnFlags::RETURN)
    }

    /// True for unconditional transfers that never fall through.
    #[inline]
    pub fn is_unconditional_branch(&self) -> bool {
        self.itype == InsnType::Branch
            && !self.flags.contains(InsnFlags::CALL)
    }

    /// The direct branch target, if this is a direct control transfer.
    pub fn branch_target(&self) -> Option<u64> {
        if !self.is_control() {
            return None;
        }
        match self.operands[JUMP_TARGET_OPERAND] {
            Operand::ImmRel { target } => Some(target),
            _ => None,
        }
    }

    /// The first explicit memory operand, if any.
    pub fn memory_operand(&self) -> Option<&MemOperand> {
        self.operands.iter().find_map(|op| match op {
            Operand::Mem(m) => Some(m),
            _ => None,
        })
    }

    /// True if this instruction reads or writes memory through an
    /// explicit memory operand and is eligible for a memory probe.
    pub fn is_memory_operation(&self) -> bool {
        self.memory_operand().is_some()
            && self
                .flags
                .intersects(InsnFlags::READS_MEMORY | InsnFlags::WRITES_MEMORY)
            && !self.is_control()
    }

    /// Registers read or written by this instruction, including
    /// implicit operands.
    #[inline]
    pub fn touched_registers(&self) -> RegSet {
        self.touched
    }
}
