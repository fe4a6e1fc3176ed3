//! Pure x86/x86-64 instruction builders.
//!
//! Each builder returns a fully encoded [`Instruction`] (raw bytes,
//! length, operand shape) with no virtual address; trampoline layout
//! assigns addresses later. Builders never emit anything whose result
//! depends on prior flags state except the explicit branch builders;
//! callers wrap flag-clobbering sequences with flags save/restore.
//!
//! The 32-bit and 64-bit encoders are separate modules. They share only
//! the ModRM/SIB helpers below.

pub mod x86;
pub mod x86_64;

use crate::insn::{Instruction, MemBase, MemOperand, Operand, Reg, MAX_OPERANDS};

use alloc::vec::Vec;

#[inline]
pub(crate) fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// SIB byte for "no base, no index, disp32" absolute addressing.
pub(crate) const SIB_ABS32: u8 = 0x25;

/// Appends ModRM (+ SIB, + displacement) bytes for `[base + disp]`.
///
/// `base` must be a plain GPR; RSP/R12 take the mandatory SIB byte and
/// RBP/R13 never use the disp-less mod=00 form.
pub(crate) fn encode_base_disp(out: &mut Vec<u8>, reg: u8, base: Reg, disp: i32) {
    let rm = base.0 & 7;
    let needs_sib = rm == 4;
    let small = i8::try_from(disp).is_ok();
    let md = if disp == 0 && rm != 5 {
        0b00
    } else if small {
        0b01
    } else {
        0b10
    };
    out.push(modrm(md, reg, rm));
    if needs_sib {
        // index=100 (none), base in SIB
        out.push(modrm(0b00, 4, rm));
    }
    match md {
        0b01 => out.push(disp as i8 as u8),
        0b10 => out.extend_from_slice(&disp.to_le_bytes()),
        _ => {}
    }
}

pub(crate) fn operands1(a: Operand) -> [Operand; MAX_OPERANDS] {
    [a, Operand::Unused, Operand::Unused]
}

pub(crate) fn operands2(a: Operand, b: Operand) -> [Operand; MAX_OPERANDS] {
    [a, b, Operand::Unused]
}

pub(crate) fn mem_abs(addr: u64) -> Operand {
    Operand::Mem(MemOperand {
        base: MemBase::None,
        index: None,
        scale: 0,
        disp: addr as i64,
        segment: None,
    })
}

pub(crate) fn mem_base_disp(base: Reg, disp: i64) -> Operand {
    Operand::Mem(MemOperand {
        base: MemBase::Gpr(base),
        index: None,
        scale: 0,
        disp,
        segment: None,
    })
}

pub(crate) fn finish(bytes: Vec<u8>, mnemonic: &str, ops: [Operand; MAX_OPERANDS]) -> Instruction {
    Instruction::from_encoding(bytes, mnemonic, ops)
}

/// Rebuilds `insn` with a GS segment-override prefix. Used for the
/// thread-keyed addressing variant, where the runtime points the GS
/// base at the current thread's data block.
pub fn gs_override(insn: Instruction) -> Instruction {
    let mut bytes = Vec::with_capacity(insn.len() as usize + 1);
    bytes.push(0x65);
    bytes.extend_from_slice(insn.bytes());
    Instruction::from_encoding(bytes, insn.mnemonic(), *insn.operands())
}
