//! Opcode format tables.
//!
//! Five tables classify opcodes: the one-byte map, the two-byte
//! (`0F`-escape) map, the group tables (ModRM `reg` field selects the
//! operation), the prefix-user entries (string/IO operations reached
//! through repeat prefixes share the base tables here), and the x86-64
//! overrides applied on top of the one-byte map in 64-bit mode.
//!
//! Entries describe just enough to recover instruction length, operand
//! structure, and the coarse classification the engine consumes.

use crate::insn::InsnType;

/// Immediate-operand kind attached to an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Imm {
    /// No immediate.
    None,
    /// 1 byte.
    B,
    /// 2 bytes.
    W,
    /// 2 or 4 bytes by operand size.
    Z,
    /// 2, 4, or (with REX.W) 8 bytes.
    V,
    /// `enter`: 2 bytes + 1 byte.
    WB,
}

/// Operand encoding shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enc {
    /// Not a valid opcode (in the current mode).
    Invalid,
    /// A legacy prefix byte, consumed before the opcode.
    Prefix,
    /// Escape to the two-byte map.
    Esc,
    /// No ModRM; optional immediate.
    NoOps(Imm),
    /// Implicit accumulator + immediate.
    Acc(Imm),
    /// Register encoded in the low three opcode bits.
    RegOp(Imm),
    /// ModRM (+ SIB + displacement); optional immediate.
    ModRm(Imm),
    /// 8-bit PC-relative branch.
    Rel8,
    /// 16/32-bit PC-relative branch.
    RelZ,
    /// Absolute moffs load/store (address-size-wide offset).
    Moffs,
    /// Far pointer `ptr16:16/32`.
    Far,
    /// ModRM group; the `reg` field picks the entry.
    Group(u8, Imm),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Desc {
    pub mnemonic: &'static str,
    pub itype: InsnType,
    pub enc: Enc,
}

const fn d(mnemonic: &'static str, itype: InsnType, enc: Enc) -> Desc {
    Desc {
        mnemonic,
        itype,
        enc,
    }
}

use Enc::*;
use InsnType::{Branch as BR, CondBranch as CB, Float as FL, HwCount as HC, Int as IN, Io as IO,
               Prefetch as PF, Simd as SD, Syscall as SC, Unknown as UN};

const INV: Desc = d("(bad)", UN, Invalid);
const FPU: Desc = d("fpu", FL, ModRm(Imm::None));

/// The one-byte opcode map (32-bit baseline; 64-bit overrides below).
pub(crate) static ONE_BYTE: [Desc; 256] = [
    // 0x00
    d("add", IN, ModRm(Imm::None)),
    d("add", IN, ModRm(Imm::None)),
    d("add", IN, ModRm(Imm::None)),
    d("add", IN, ModRm(Imm::None)),
    d("add", IN, Acc(Imm::B)),
    d("add", IN, Acc(Imm::Z)),
    d("push", IN, NoOps(Imm::None)),
    d("pop", IN, NoOps(Imm::None)),
    // 0x08
    d("or", IN, ModRm(Imm::None)),
    d("or", IN, ModRm(Imm::None)),
    d("or", IN, ModRm(Imm::None)),
    d("or", IN, ModRm(Imm::None)),
    d("or", IN, Acc(Imm::B)),
    d("or", IN, Acc(Imm::Z)),
    d("push", IN, NoOps(Imm::None)),
    d("(esc)", UN, Esc),
    // 0x10
    d("adc", IN, ModRm(Imm::None)),
    d("adc", IN, ModRm(Imm::None)),
    d("adc", IN, ModRm(Imm::None)),
    d("adc", IN, ModRm(Imm::None)),
    d("adc", IN, Acc(Imm::B)),
    d("adc", IN, Acc(Imm::Z)),
    d("push", IN, NoOps(Imm::None)),
    d("pop", IN, NoOps(Imm::None)),
    // 0x18
    d("sbb", IN, ModRm(Imm::None)),
    d("sbb", IN, ModRm(Imm::None)),
    d("sbb", IN, ModRm(Imm::None)),
    d("sbb", IN, ModRm(Imm::None)),
    d("sbb", IN, Acc(Imm::B)),
    d("sbb", IN, Acc(Imm::Z)),
    d("push", IN, NoOps(Imm::None)),
    d("pop", IN, NoOps(Imm::None)),
    // 0x20
    d("and", IN, ModRm(Imm::None)),
    d("and", IN, ModRm(Imm::None)),
    d("and", IN, ModRm(Imm::None)),
    d("and", IN, ModRm(Imm::None)),
    d("and", IN, Acc(Imm::B)),
    d("and", IN, Acc(Imm::Z)),
    d("(es)", UN, Prefix),
    d("daa", IN, NoOps(Imm::None)),
    // 0x28
    d("sub", IN, ModRm(Imm::None)),
    d("sub", IN, ModRm(Imm::None)),
    d("sub", IN, ModRm(Imm::None)),
    d("sub", IN, ModRm(Imm::None)),
    d("sub", IN, Acc(Imm::B)),
    d("sub", IN, Acc(Imm::Z)),
    d("(cs)", UN, Prefix),
    d("das", IN, NoOps(Imm::None)),
    // 0x30
    d("xor", IN, ModRm(Imm::None)),
    d("xor", IN, ModRm(Imm::None)),
    d("xor", IN, ModRm(Imm::None)),
    d("xor", IN, ModRm(Imm::None)),
    d("xor", IN, Acc(Imm::B)),
    d("xor", IN, Acc(Imm::Z)),
    d("(ss)", UN, Prefix),
    d("aaa", IN, NoOps(Imm::None)),
    // 0x38
    d("cmp", IN, ModRm(Imm::None)),
    d("cmp", IN, ModRm(Imm::None)),
    d("cmp", IN, ModRm(Imm::None)),
    d("cmp", IN, ModRm(Imm::None)),
    d("cmp", IN, Acc(Imm::B)),
    d("cmp", IN, Acc(Imm::Z)),
    d("(ds)", UN, Prefix),
    d("aas", IN, NoOps(Imm::None)),
    // 0x40: inc/dec in 32-bit mode; REX prefixes in 64-bit mode
    d("inc", IN, RegOp(Imm::None)),
    d("inc", IN, RegOp(Imm::None)),
    d("inc", IN, RegOp(Imm::None)),
    d("inc", IN, RegOp(Imm::None)),
    d("inc", IN, RegOp(Imm::None)),
    d("inc", IN, RegOp(Imm::None)),
    d("inc", IN, RegOp(Imm::None)),
    d("inc", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    d("dec", IN, RegOp(Imm::None)),
    // 0x50
    d("push", IN, RegOp(Imm::None)),
    d("push", IN, RegOp(Imm::None)),
    d("push", IN, RegOp(Imm::None)),
    d("push", IN, RegOp(Imm::None)),
    d("push", IN, RegOp(Imm::None)),
    d("push", IN, RegOp(Imm::None)),
    d("push", IN, RegOp(Imm::None)),
    d("push", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    d("pop", IN, RegOp(Imm::None)),
    // 0x60
    d("pusha", IN, NoOps(Imm::None)),
    d("popa", IN, NoOps(Imm::None)),
    d("bound", IN, ModRm(Imm::None)),
    d("arpl", IN, ModRm(Imm::None)),
    d("(fs)", UN, Prefix),
    d("(gs)", UN, Prefix),
    d("(osz)", UN, Prefix),
    d("(asz)", UN, Prefix),
    d("push", IN, NoOps(Imm::Z)),
    d("imul", IN, ModRm(Imm::Z)),
    d("push", IN, NoOps(Imm::B)),
    d("imul", IN, ModRm(Imm::B)),
    d("insb", IO, NoOps(Imm::None)),
    d("ins", IO, NoOps(Imm::None)),
    d("outsb", IO, NoOps(Imm::None)),
    d("outs", IO, NoOps(Imm::None)),
    // 0x70: short conditional branches
    d("jo", CB, Rel8),
    d("jno", CB, Rel8),
    d("jb", CB, Rel8),
    d("jae", CB, Rel8),
    d("je", CB, Rel8),
    d("jne", CB, Rel8),
    d("jbe", CB, Rel8),
    d("ja", CB, Rel8),
    d("js", CB, Rel8),
    d("jns", CB, Rel8),
    d("jp", CB, Rel8),
    d("jnp", CB, Rel8),
    d("jl", CB, Rel8),
    d("jge", CB, Rel8),
    d("jle", CB, Rel8),
    d("jg", CB, Rel8),
    // 0x80
    d("(grp1)", IN, Group(1, Imm::B)),
    d("(grp1)", IN, Group(1, Imm::Z)),
    d("(grp1)", IN, Group(1, Imm::B)),
    d("(grp1)", IN, Group(1, Imm::B)),
    d("test", IN, ModRm(Imm::None)),
    d("test", IN, ModRm(Imm::None)),
    d("xchg", IN, ModRm(Imm::None)),
    d("xchg", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("lea", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("(grp1a)", IN, Group(10, Imm::None)),
    // 0x90
    d("nop", IN, NoOps(Imm::None)),
    d("xchg", IN, RegOp(Imm::None)),
    d("xchg", IN, RegOp(Imm::None)),
    d("xchg", IN, RegOp(Imm::None)),
    d("xchg", IN, RegOp(Imm::None)),
    d("xchg", IN, RegOp(Imm::None)),
    d("xchg", IN, RegOp(Imm::None)),
    d("xchg", IN, RegOp(Imm::None)),
    d("cbw", IN, NoOps(Imm::None)),
    d("cwd", IN, NoOps(Imm::None)),
    d("callf", BR, Far),
    d("fwait", FL, NoOps(Imm::None)),
    d("pushf", IN, NoOps(Imm::None)),
    d("popf", IN, NoOps(Imm::None)),
    d("sahf", IN, NoOps(Imm::None)),
    d("lahf", IN, NoOps(Imm::None)),
    // 0xA0
    d("mov", IN, Moffs),
    d("mov", IN, Moffs),
    d("mov", IN, Moffs),
    d("mov", IN, Moffs),
    d("movsb", IN, NoOps(Imm::None)),
    d("movs", IN, NoOps(Imm::None)),
    d("cmpsb", IN, NoOps(Imm::None)),
    d("cmps", IN, NoOps(Imm::None)),
    d("test", IN, Acc(Imm::B)),
    d("test", IN, Acc(Imm::Z)),
    d("stosb", IN, NoOps(Imm::None)),
    d("stos", IN, NoOps(Imm::None)),
    d("lodsb", IN, NoOps(Imm::None)),
    d("lods", IN, NoOps(Imm::None)),
    d("scasb", IN, NoOps(Imm::None)),
    d("scas", IN, NoOps(Imm::None)),
    // 0xB0: byte-register immediate moves
    d("mov", IN, RegOp(Imm::B)),
    d("mov", IN, RegOp(Imm::B)),
    d("mov", IN, RegOp(Imm::B)),
    d("mov", IN, RegOp(Imm::B)),
    d("mov", IN, RegOp(Imm::B)),
    d("mov", IN, RegOp(Imm::B)),
    d("mov", IN, RegOp(Imm::B)),
    d("mov", IN, RegOp(Imm::B)),
    // 0xB8: full-width immediate moves
    d("mov", IN, RegOp(Imm::V)),
    d("mov", IN, RegOp(Imm::V)),
    d("mov", IN, RegOp(Imm::V)),
    d("mov", IN, RegOp(Imm::V)),
    d("mov", IN, RegOp(Imm::V)),
    d("mov", IN, RegOp(Imm::V)),
    d("mov", IN, RegOp(Imm::V)),
    d("mov", IN, RegOp(Imm::V)),
    // 0xC0
    d("(grp2)", IN, Group(2, Imm::B)),
    d("(grp2)", IN, Group(2, Imm::B)),
    d("ret", BR, NoOps(Imm::W)),
    d("ret", BR, NoOps(Imm::None)),
    d("les", IN, ModRm(Imm::None)),
    d("lds", IN, ModRm(Imm::None)),
    d("(grp11)", IN, Group(11, Imm::B)),
    d("(grp11)", IN, Group(11, Imm::Z)),
    d("enter", IN, NoOps(Imm::WB)),
    d("leave", IN, NoOps(Imm::None)),
    d("retf", BR, NoOps(Imm::W)),
    d("retf", BR, NoOps(Imm::None)),
    d("int3", SC, NoOps(Imm::None)),
    d("int", SC, NoOps(Imm::B)),
    d("into", SC, NoOps(Imm::None)),
    d("iret", BR, NoOps(Imm::None)),
    // 0xD0
    d("(grp2)", IN, Group(2, Imm::None)),
    d("(grp2)", IN, Group(2, Imm::None)),
    d("(grp2)", IN, Group(2, Imm::None)),
    d("(grp2)", IN, Group(2, Imm::None)),
    d("aam", IN, NoOps(Imm::B)),
    d("aad", IN, NoOps(Imm::B)),
    d("salc", IN, NoOps(Imm::None)),
    d("xlat", IN, NoOps(Imm::None)),
    FPU,
    FPU,
    FPU,
    FPU,
    FPU,
    FPU,
    FPU,
    FPU,
    // 0xE0
    d("loopne", CB, Rel8),
    d("loope", CB, Rel8),
    d("loop", CB, Rel8),
    d("jcxz", CB, Rel8),
    d("in", IO, NoOps(Imm::B)),
    d("in", IO, NoOps(Imm::B)),
    d("out", IO, NoOps(Imm::B)),
    d("out", IO, NoOps(Imm::B)),
    d("call", BR, RelZ),
    d("jmp", BR, RelZ),
    d("jmpf", BR, Far),
    d("jmp", BR, Rel8),
    d("in", IO, NoOps(Imm::None)),
    d("in", IO, NoOps(Imm::None)),
    d("out", IO, NoOps(Imm::None)),
    d("out", IO, NoOps(Imm::None)),
    // 0xF0
    d("(lock)", UN, Prefix),
    d("int1", SC, NoOps(Imm::None)),
    d("(repne)", UN, Prefix),
    d("(rep)", UN, Prefix),
    d("hlt", IN, NoOps(Imm::None)),
    d("cmc", IN, NoOps(Imm::None)),
    d("(grp3)", IN, Group(3, Imm::B)),
    d("(grp3)", IN, Group(3, Imm::Z)),
    d("clc", IN, NoOps(Imm::None)),
    d("stc", IN, NoOps(Imm::None)),
    d("cli", IN, NoOps(Imm::None)),
    d("sti", IN, NoOps(Imm::None)),
    d("cld", IN, NoOps(Imm::None)),
    d("std", IN, NoOps(Imm::None)),
    d("(grp4)", IN, Group(4, Imm::None)),
    d("(grp5)", IN, Group(5, Imm::None)),
];

const SIMD_RM: Desc = d("simd", SD, ModRm(Imm::None));

/// The two-byte (`0F`-escape) opcode map.
pub(crate) static TWO_BYTE: [Desc; 256] = [
    // 0x00
    d("(grp6)", IN, Group(6, Imm::None)),
    d("(grp7)", IN, Group(7, Imm::None)),
    d("lar", IN, ModRm(Imm::None)),
    d("lsl", IN, ModRm(Imm::None)),
    INV,
    d("syscall", SC, NoOps(Imm::None)),
    d("clts", IN, NoOps(Imm::None)),
    d("sysret", SC, NoOps(Imm::None)),
    d("invd", IN, NoOps(Imm::None)),
    d("wbinvd", IN, NoOps(Imm::None)),
    INV,
    d("ud2", IN, NoOps(Imm::None)),
    INV,
    d("prefetch", PF, ModRm(Imm::None)),
    d("femms", FL, NoOps(Imm::None)),
    INV,
    // 0x10
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    d("(grp16)", PF, Group(16, Imm::None)),
    d("nop", IN, ModRm(Imm::None)),
    d("nop", IN, ModRm(Imm::None)),
    d("nop", IN, ModRm(Imm::None)),
    d("nop", IN, ModRm(Imm::None)),
    d("nop", IN, ModRm(Imm::None)),
    d("nop", IN, ModRm(Imm::None)),
    d("nop", IN, ModRm(Imm::None)),
    // 0x20
    d("mov", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    d("mov", IN, ModRm(Imm::None)),
    INV,
    INV,
    INV,
    INV,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    // 0x30
    d("wrmsr", IN, NoOps(Imm::None)),
    d("rdtsc", HC, NoOps(Imm::None)),
    d("rdmsr", IN, NoOps(Imm::None)),
    d("rdpmc", HC, NoOps(Imm::None)),
    d("sysenter", SC, NoOps(Imm::None)),
    d("sysexit", SC, NoOps(Imm::None)),
    INV,
    d("getsec", IN, NoOps(Imm::None)),
    d("(esc38)", SD, Esc),
    INV,
    d("(esc3a)", SD, Esc),
    INV,
    INV,
    INV,
    INV,
    INV,
    // 0x40: conditional moves
    d("cmovo", IN, ModRm(Imm::None)),
    d("cmovno", IN, ModRm(Imm::None)),
    d("cmovb", IN, ModRm(Imm::None)),
    d("cmovae", IN, ModRm(Imm::None)),
    d("cmove", IN, ModRm(Imm::None)),
    d("cmovne", IN, ModRm(Imm::None)),
    d("cmovbe", IN, ModRm(Imm::None)),
    d("cmova", IN, ModRm(Imm::None)),
    d("cmovs", IN, ModRm(Imm::None)),
    d("cmovns", IN, ModRm(Imm::None)),
    d("cmovp", IN, ModRm(Imm::None)),
    d("cmovnp", IN, ModRm(Imm::None)),
    d("cmovl", IN, ModRm(Imm::None)),
    d("cmovge", IN, ModRm(Imm::None)),
    d("cmovle", IN, ModRm(Imm::None)),
    d("cmovg", IN, ModRm(Imm::None)),
    // 0x50
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    // 0x60
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    // 0x70
    d("pshuf", SD, ModRm(Imm::B)),
    d("(grp12)", SD, Group(12, Imm::B)),
    d("(grp13)", SD, Group(13, Imm::B)),
    d("(grp14)", SD, Group(14, Imm::B)),
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    d("emms", SD, NoOps(Imm::None)),
    d("vmread", IN, ModRm(Imm::None)),
    d("vmwrite", IN, ModRm(Imm::None)),
    INV,
    INV,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    // 0x80: long conditional branches
    d("jo", CB, RelZ),
    d("jno", CB, RelZ),
    d("jb", CB, RelZ),
    d("jae", CB, RelZ),
    d("je", CB, RelZ),
    d("jne", CB, RelZ),
    d("jbe", CB, RelZ),
    d("ja", CB, RelZ),
    d("js", CB, RelZ),
    d("jns", CB, RelZ),
    d("jp", CB, RelZ),
    d("jnp", CB, RelZ),
    d("jl", CB, RelZ),
    d("jge", CB, RelZ),
    d("jle", CB, RelZ),
    d("jg", CB, RelZ),
    // 0x90: byte sets
    d("seto", IN, ModRm(Imm::None)),
    d("setno", IN, ModRm(Imm::None)),
    d("setb", IN, ModRm(Imm::None)),
    d("setae", IN, ModRm(Imm::None)),
    d("sete", IN, ModRm(Imm::None)),
    d("setne", IN, ModRm(Imm::None)),
    d("setbe", IN, ModRm(Imm::None)),
    d("seta", IN, ModRm(Imm::None)),
    d("sets", IN, ModRm(Imm::None)),
    d("setns", IN, ModRm(Imm::None)),
    d("setp", IN, ModRm(Imm::None)),
    d("setnp", IN, ModRm(Imm::None)),
    d("setl", IN, ModRm(Imm::None)),
    d("setge", IN, ModRm(Imm::None)),
    d("setle", IN, ModRm(Imm::None)),
    d("setg", IN, ModRm(Imm::None)),
    // 0xA0
    d("push", IN, NoOps(Imm::None)),
    d("pop", IN, NoOps(Imm::None)),
    d("cpuid", IN, NoOps(Imm::None)),
    d("bt", IN, ModRm(Imm::None)),
    d("shld", IN, ModRm(Imm::B)),
    d("shld", IN, ModRm(Imm::None)),
    INV,
    INV,
    d("push", IN, NoOps(Imm::None)),
    d("pop", IN, NoOps(Imm::None)),
    d("rsm", IN, NoOps(Imm::None)),
    d("bts", IN, ModRm(Imm::None)),
    d("shrd", IN, ModRm(Imm::B)),
    d("shrd", IN, ModRm(Imm::None)),
    d("(grp15)", IN, Group(15, Imm::None)),
    d("imul", IN, ModRm(Imm::None)),
    // 0xB0
    d("cmpxchg", IN, ModRm(Imm::None)),
    d("cmpxchg", IN, ModRm(Imm::None)),
    d("lss", IN, ModRm(Imm::None)),
    d("btr", IN, ModRm(Imm::None)),
    d("lfs", IN, ModRm(Imm::None)),
    d("lgs", IN, ModRm(Imm::None)),
    d("movzx", IN, ModRm(Imm::None)),
    d("movzx", IN, ModRm(Imm::None)),
    d("popcnt", IN, ModRm(Imm::None)),
    d("ud1", IN, ModRm(Imm::None)),
    d("(grp8)", IN, Group(8, Imm::B)),
    d("btc", IN, ModRm(Imm::None)),
    d("bsf", IN, ModRm(Imm::None)),
    d("bsr", IN, ModRm(Imm::None)),
    d("movsx", IN, ModRm(Imm::None)),
    d("movsx", IN, ModRm(Imm::None)),
    // 0xC0
    d("xadd", IN, ModRm(Imm::None)),
    d("xadd", IN, ModRm(Imm::None)),
    d("cmpps", SD, ModRm(Imm::B)),
    d("movnti", IN, ModRm(Imm::None)),
    d("pinsrw", SD, ModRm(Imm::B)),
    d("pextrw", SD, ModRm(Imm::B)),
    d("shufps", SD, ModRm(Imm::B)),
    d("(grp9)", IN, Group(9, Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    d("bswap", IN, RegOp(Imm::None)),
    // 0xD0
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    // 0xE0
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    // 0xF0
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    SIMD_RM,
    d("ud0", IN, ModRm(Imm::None)),
];

/// One resolved group entry. `uses_imm` gates the immediate declared
/// on the escape opcode (the `test` forms of group 3 take it, the
/// `not`/`neg`/`mul` forms do not).
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupEntry {
    pub mnemonic: &'static str,
    pub itype: InsnType,
    pub uses_imm: bool,
    /// Set for the indirect `call` entries of group 5.
    pub is_call: bool,
    /// Set for the indirect `call`/`jmp` entries of group 5.
    pub is_indirect_branch: bool,
}

const fn g(mnemonic: &'static str, itype: InsnType, uses_imm: bool) -> GroupEntry {
    GroupEntry {
        mnemonic,
        itype,
        uses_imm,
        is_call: false,
        is_indirect_branch: false,
    }
}

const fn gbr(mnemonic: &'static str, is_call: bool) -> GroupEntry {
    GroupEntry {
        mnemonic,
        itype: InsnType::Branch,
        uses_imm: false,
        is_call,
        is_indirect_branch: true,
    }
}

const GINV: GroupEntry = g("(bad)", UN, false);

/// Looks up a group entry by group id and ModRM `reg` field.
pub(crate) fn group_entry(id: u8, reg: u8) -> GroupEntry {
    let reg = (reg & 7) as usize;
    match id {
        1 => [
            g("add", IN, true),
            g("or", IN, true),
            g("adc", IN, true),
            g("sbb", IN, true),
            g("and", IN, true),
            g("sub", IN, true),
            g("xor", IN, true),
            g("cmp", IN, true),
        ][reg],
        2 => [
            g("rol", IN, true),
            g("ror", IN, true),
            g("rcl", IN, true),
            g("rcr", IN, true),
            g("shl", IN, true),
            g("shr", IN, true),
            g("sal", IN, true),
            g("sar", IN, true),
        ][reg],
        3 => [
            g("test", IN, true),
            g("test", IN, true),
            g("not", IN, false),
            g("neg", IN, false),
            g("mul", IN, false),
            g("imul", IN, false),
            g("div", IN, false),
            g("idiv", IN, false),
        ][reg],
        4 => [
            g("inc", IN, false),
            g("dec", IN, false),
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
        ][reg],
        5 => [
            g("inc", IN, false),
            g("dec", IN, false),
            gbr("call", true),
            gbr("callf", true),
            gbr("jmp", false),
            gbr("jmpf", false),
            g("push", IN, false),
            GINV,
        ][reg],
        6 => [
            g("sldt", IN, false),
            g("str", IN, false),
            g("lldt", IN, false),
            g("ltr", IN, false),
            g("verr", IN, false),
            g("verw", IN, false),
            GINV,
            GINV,
        ][reg],
        7 => [
            g("sgdt", IN, false),
            g("sidt", IN, false),
            g("lgdt", IN, false),
            g("lidt", IN, false),
            g("smsw", IN, false),
            GINV,
            g("lmsw", IN, false),
            g("invlpg", IN, false),
        ][reg],
        8 => [
            GINV,
            GINV,
            GINV,
            GINV,
            g("bt", IN, true),
            g("bts", IN, true),
            g("btr", IN, true),
            g("btc", IN, true),
        ][reg],
        9 => [
            GINV,
            g("cmpxchg8b", IN, false),
            GINV,
            GINV,
            GINV,
            GINV,
            g("vmptrld", IN, false),
            g("vmptrst", IN, false),
        ][reg],
        10 => [
            g("pop", IN, false),
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
        ][reg],
        11 => [
            g("mov", IN, true),
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
            GINV,
        ][reg],
        12 | 13 | 14 => [
            GINV,
            GINV,
            g("psrl", SD, true),
            GINV,
            g("psra", SD, true),
            GINV,
            g("psll", SD, true),
            GINV,
        ][reg],
        15 => [
            g("fxsave", IN, false),
            g("fxrstor", IN, false),
            g("ldmxcsr", IN, false),
            g("stmxcsr", IN, false),
            g("xsave", IN, false),
            g("lfence", IN, false),
            g("mfence", IN, false),
            g("sfence", IN, false),
        ][reg],
        16 => [
            g("prefetchnta", PF, false),
            g("prefetcht0", PF, false),
            g("prefetcht1", PF, false),
            g("prefetcht2", PF, false),
            g("nop", IN, false),
            g("nop", IN, false),
            g("nop", IN, false),
            g("nop", IN, false),
        ][reg],
        _ => GINV,
    }
}

/// One-byte opcodes that are not encodable in 64-bit mode.
pub(crate) fn invalid_in_64(op: u8) -> bool {
    matches!(
        op,
        0x06 | 0x07
            | 0x0E
            | 0x16
            | 0x17
            | 0x1E
            | 0x1F
            | 0x27
            | 0x2F
            | 0x37
            | 0x3F
            | 0x60
            | 0x61
            | 0x62
            | 0x82
            | 0x9A
            | 0xC4
            | 0xC5
            | 0xCE
            | 0xD4
            | 0xD5
            | 0xD6
            | 0xEA
    )
}

/// The x86-64 override for opcode `0x63`: `movsxd`.
pub(crate) static MOVSXD: Desc = d("movsxd", IN, ModRm(Imm::None));
