//! 64-bit instruction builders.
//!
//! All absolute memory references use the SIB "no base, disp32" form,
//! which addresses the low 2 GiB without a RIP-relative displacement;
//! the reserved data arena is always placed below that boundary.

use super::{
    encode_base_disp, finish, mem_abs, mem_base_disp, modrm, operands1, operands2, SIB_ABS32,
};
use crate::insn::{Instruction, Operand, Reg};

use alloc::vec::Vec;

const REX_W: u8 = 0x48;
const REX_R: u8 = 0x04;
const REX_B: u8 = 0x01;

fn push_rex(out: &mut Vec<u8>, wide: bool, reg: Reg, rm: Reg) {
    let mut r = 0x40u8;
    if wide {
        r |= 0x08;
    }
    if reg.0 >= 8 {
        r |= REX_R;
    }
    if rm.0 >= 8 {
        r |= REX_B;
    }
    if r != 0x40 {
        out.push(r);
    }
}

/// `mov dst, src` between 64-bit GPRs.
pub fn mov_reg_to_reg(src: Reg, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(3);
    b.push(REX_W | if src.0 >= 8 { REX_R } else { 0 } | if dst.0 >= 8 { REX_B } else { 0 });
    b.push(0x89);
    b.push(modrm(0b11, src.0, dst.0));
    finish(b, "mov", operands2(Operand::Reg(dst), Operand::Reg(src)))
}

/// `mov dst, imm`. Emits the sign-extended imm32 form when `imm` fits,
/// otherwise the full 64-bit immediate form.
pub fn mov_imm_to_reg(imm: u64, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(10);
    if i32::try_from(imm as i64).is_ok() {
        b.push(REX_W | if dst.0 >= 8 { REX_B } else { 0 });
        b.push(0xC7);
        b.push(modrm(0b11, 0, dst.0));
        b.extend_from_slice(&(imm as u32).to_le_bytes());
    } else {
        b.push(REX_W | if dst.0 >= 8 { REX_B } else { 0 });
        b.push(0xB8 + (dst.0 & 7));
        b.extend_from_slice(&imm.to_le_bytes());
    }
    finish(
        b,
        "mov",
        operands2(Operand::Reg(dst), Operand::Imm(imm as i64)),
    )
}

/// `mov [addr], src` (64-bit store to an absolute 32-bit address).
pub fn mov_reg_to_mem(src: Reg, addr: u64) -> Instruction {
    debug_assert!(addr < 1 << 31);
    let mut b = Vec::with_capacity(8);
    b.push(REX_W | if src.0 >= 8 { REX_R } else { 0 });
    b.push(0x89);
    b.push(modrm(0b00, src.0, 4));
    b.push(SIB_ABS32);
    b.extend_from_slice(&(addr as u32).to_le_bytes());
    finish(b, "mov", operands2(mem_abs(addr), Operand::Reg(src)))
}

/// `mov dst, [addr]` (64-bit load from an absolute 32-bit address).
pub fn mov_mem_to_reg(addr: u64, dst: Reg) -> Instruction {
    debug_assert!(addr < 1 << 31);
    let mut b = Vec::with_capacity(8);
    b.push(REX_W | if dst.0 >= 8 { REX_R } else { 0 });
    b.push(0x8B);
    b.push(modrm(0b00, dst.0, 4));
    b.push(SIB_ABS32);
    b.extend_from_slice(&(addr as u32).to_le_bytes());
    finish(b, "mov", operands2(Operand::Reg(dst), mem_abs(addr)))
}

/// `mov [base + disp], src`. `wide` selects a 64-bit store, otherwise
/// the low 32 bits of `src` are stored.
pub fn mov_reg_to_regaddr_imm(src: Reg, base: Reg, disp: i32, wide: bool) -> Instruction {
    let mut b = Vec::with_capacity(8);
    push_rex(&mut b, wide, src, base);
    b.push(0x89);
    encode_base_disp(&mut b, src.0, base, disp);
    finish(
        b,
        "mov",
        operands2(mem_base_disp(base, disp as i64), Operand::Reg(src)),
    )
}

/// `mov dst, [base + disp]` (64-bit load).
pub fn mov_regaddr_imm_to_reg(base: Reg, disp: i32, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(8);
    push_rex(&mut b, true, dst, base);
    b.push(0x8B);
    encode_base_disp(&mut b, dst.0, base, disp);
    finish(
        b,
        "mov",
        operands2(Operand::Reg(dst), mem_base_disp(base, disp as i64)),
    )
}

/// `add reg, imm32` (sign-extended).
pub fn reg_add_imm(reg: Reg, imm: u64) -> Instruction {
    let mut b = Vec::with_capacity(7);
    b.push(REX_W | if reg.0 >= 8 { REX_B } else { 0 });
    b.push(0x81);
    b.push(modrm(0b11, 0, reg.0));
    b.extend_from_slice(&(imm as u32).to_le_bytes());
    finish(
        b,
        "add",
        operands2(Operand::Reg(reg), Operand::Imm(imm as i64)),
    )
}

/// `add dst, src` (two-operand form).
pub fn reg_add_reg(src: Reg, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(3);
    b.push(REX_W | if src.0 >= 8 { REX_R } else { 0 } | if dst.0 >= 8 { REX_B } else { 0 });
    b.push(0x01);
    b.push(modrm(0b11, src.0, dst.0));
    finish(b, "add", operands2(Operand::Reg(dst), Operand::Reg(src)))
}

/// `imul dst, src, imm8`.
pub fn reg_imm_mult_reg(src: Reg, imm: u8, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(4);
    b.push(REX_W | if dst.0 >= 8 { REX_R } else { 0 } | if src.0 >= 8 { REX_B } else { 0 });
    b.push(0x6B);
    b.push(modrm(0b11, dst.0, src.0));
    b.push(imm);
    finish(
        b,
        "imul",
        operands2(Operand::Reg(dst), Operand::Imm(imm as i64)),
    )
}

/// `shl reg, imm8`.
pub fn shift_left_logical(amount: u8, reg: Reg) -> Instruction {
    let mut b = Vec::with_capacity(4);
    b.push(REX_W | if reg.0 >= 8 { REX_B } else { 0 });
    b.push(0xC1);
    b.push(modrm(0b11, 4, reg.0));
    b.push(amount);
    finish(
        b,
        "shl",
        operands2(Operand::Reg(reg), Operand::Imm(amount as i64)),
    )
}

/// `shr reg, imm8`.
pub fn shift_right_logical(amount: u8, reg: Reg) -> Instruction {
    let mut b = Vec::with_capacity(4);
    b.push(REX_W | if reg.0 >= 8 { REX_B } else { 0 });
    b.push(0xC1);
    b.push(modrm(0b11, 5, reg.0));
    b.push(amount);
    finish(
        b,
        "shr",
        operands2(Operand::Reg(reg), Operand::Imm(amount as i64)),
    )
}

/// `cmp reg, imm32`.
pub fn compare_imm_reg(imm: u64, reg: Reg) -> Instruction {
    let mut b = Vec::with_capacity(7);
    b.push(REX_W | if reg.0 >= 8 { REX_B } else { 0 });
    b.push(0x81);
    b.push(modrm(0b11, 7, reg.0));
    b.extend_from_slice(&(imm as u32).to_le_bytes());
    finish(
        b,
        "cmp",
        operands2(Operand::Reg(reg), Operand::Imm(imm as i64)),
    )
}

/// `jmp rel32`.
pub fn branch_rel32(rel: i32) -> Instruction {
    let mut b = Vec::with_capacity(5);
    b.push(0xE9);
    b.extend_from_slice(&rel.to_le_bytes());
    finish(b, "jmp", operands1(Operand::Imm(rel as i64)))
}

/// `jl rel32`.
pub fn branch_jl(rel: i32) -> Instruction {
    let mut b = Vec::with_capacity(6);
    b.push(0x0F);
    b.push(0x8C);
    b.extend_from_slice(&rel.to_le_bytes());
    finish(b, "jl", operands1(Operand::Imm(rel as i64)))
}

/// `call [addr]` through an absolute 32-bit address slot.
pub fn call_mem_abs(addr: u64) -> Instruction {
    debug_assert!(addr < 1 << 31);
    let mut b = Vec::with_capacity(7);
    b.push(0xFF);
    b.push(modrm(0b00, 2, 4));
    b.push(SIB_ABS32);
    b.extend_from_slice(&(addr as u32).to_le_bytes());
    finish(b, "call", operands1(mem_abs(addr)))
}

/// `call rel32`.
pub fn call_rel32(rel: i32) -> Instruction {
    let mut b = Vec::with_capacity(5);
    b.push(0xE8);
    b.extend_from_slice(&rel.to_le_bytes());
    finish(b, "call", operands1(Operand::Imm(rel as i64)))
}

/// `ret`.
pub fn ret() -> Instruction {
    finish(alloc::vec![0xC3], "ret", operands1(Operand::Unused))
}

/// `push reg`.
pub fn push_reg(reg: Reg) -> Instruction {
    let mut b = Vec::with_capacity(2);
    if reg.0 >= 8 {
        b.push(0x40 | REX_B);
    }
    b.push(0x50 + (reg.0 & 7));
    finish(b, "push", operands1(Operand::Reg(reg)))
}

/// `pop reg`.
pub fn pop_reg(reg: Reg) -> Instruction {
    let mut b = Vec::with_capacity(2);
    if reg.0 >= 8 {
        b.push(0x40 | REX_B);
    }
    b.push(0x58 + (reg.0 & 7));
    finish(b, "pop", operands1(Operand::Reg(reg)))
}

/// `pushfq`.
pub fn push_flags() -> Instruction {
    finish(alloc::vec![0x9C], "pushf", operands1(Operand::Unused))
}

/// `popfq`.
pub fn pop_flags() -> Instruction {
    finish(alloc::vec![0x9D], "popf", operands1(Operand::Unused))
}

/// `lahf`.
pub fn load_ah_from_flags() -> Instruction {
    finish(alloc::vec![0x9F], "lahf", operands1(Operand::Unused))
}

/// `sahf`.
pub fn store_ah_to_flags() -> Instruction {
    finish(alloc::vec![0x9E], "sahf", operands1(Operand::Unused))
}

/// `mov [addr], ah`. REX-less by necessity: AH is unaddressable under
/// a REX prefix.
pub fn mov_ah_to_mem(addr: u64) -> Instruction {
    debug_assert!(addr < 1 << 31);
    let mut b = Vec::with_capacity(7);
    b.push(0x88);
    b.push(modrm(0b00, 4, 4));
    b.push(SIB_ABS32);
    b.extend_from_slice(&(addr as u32).to_le_bytes());
    finish(b, "mov", operands1(mem_abs(addr)))
}

/// `mov ah, [addr]`.
pub fn mov_mem_to_ah(addr: u64) -> Instruction {
    debug_assert!(addr < 1 << 31);
    let mut b = Vec::with_capacity(7);
    b.push(0x8A);
    b.push(modrm(0b00, 4, 4));
    b.push(SIB_ABS32);
    b.extend_from_slice(&(addr as u32).to_le_bytes());
    finish(b, "mov", operands1(mem_abs(addr)))
}

/// `nop`.
pub fn nop() -> Instruction {
    finish(alloc::vec![0x90], "nop", operands1(Operand::Unused))
}
