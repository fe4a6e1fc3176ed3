//! 32-bit instruction builders.
//!
//! Absolute memory references use the plain `disp32` ModRM form
//! (mod=00, r/m=101), which in 32-bit mode is an absolute address.

use super::{encode_base_disp, finish, mem_abs, mem_base_disp, modrm, operands1, operands2};
use crate::insn::{Instruction, Operand, Reg};

use alloc::vec::Vec;

fn abs32(out: &mut Vec<u8>, reg: u8, addr: u64) {
    out.push(modrm(0b00, reg, 5));
    out.extend_from_slice(&(addr as u32).to_le_bytes());
}

/// `mov dst, src` between 32-bit GPRs.
pub fn mov_reg_to_reg(src: Reg, dst: Reg) -> Instruction {
    let b = alloc::vec![0x89, modrm(0b11, src.0, dst.0)];
    finish(b, "mov", operands2(Operand::Reg(dst), Operand::Reg(src)))
}

/// `mov dst, imm32`.
pub fn mov_imm_to_reg(imm: u64, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(5);
    b.push(0xB8 + dst.0);
    b.extend_from_slice(&(imm as u32).to_le_bytes());
    finish(
        b,
        "mov",
        operands2(Operand::Reg(dst), Operand::Imm(imm as i64)),
    )
}

/// `mov [addr], src`.
pub fn mov_reg_to_mem(src: Reg, addr: u64) -> Instruction {
    let mut b = Vec::with_capacity(6);
    b.push(0x89);
    abs32(&mut b, src.0, addr);
    finish(b, "mov", operands2(mem_abs(addr), Operand::Reg(src)))
}

/// `mov dst, [addr]`.
pub fn mov_mem_to_reg(addr: u64, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(6);
    b.push(0x8B);
    abs32(&mut b, dst.0, addr);
    finish(b, "mov", operands2(Operand::Reg(dst), mem_abs(addr)))
}

/// `mov [base + disp], src`.
pub fn mov_reg_to_regaddr_imm(src: Reg, base: Reg, disp: i32) -> Instruction {
    let mut b = Vec::with_capacity(7);
    b.push(0x89);
    encode_base_disp(&mut b, src.0, base, disp);
    finish(
        b,
        "mov",
        operands2(mem_base_disp(base, disp as i64), Operand::Reg(src)),
    )
}

/// `mov dst, [base + disp]`.
pub fn mov_regaddr_imm_to_reg(base: Reg, disp: i32, dst: Reg) -> Instruction {
    let mut b = Vec::with_capacity(7);
    b.push(0x8B);
    encode_base_disp(&mut b, dst.0, base, disp);
    finish(
        b,
        "mov",
        operands2(Operand::Reg(dst), mem_base_disp(base, disp as i64)),
    )
}

/// `add reg, imm32`.
pub fn reg_add_imm(reg: Reg, imm: u64) -> Instruction {
    let mut b = Vec::with_capacity(6);
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
    let b = alloc::vec![0x01, modrm(0b11, src.0, dst.0)];
    finish(b, "add", operands2(Operand::Reg(dst), Operand::Reg(src)))
}

/// `imul dst, src, imm8`.
pub fn reg_imm_mult_reg(src: Reg, imm: u8, dst: Reg) -> Instruction {
    let b = alloc::vec![0x6B, modrm(0b11, dst.0, src.0), imm];
    finish(
        b,
        "imul",
        operands2(Operand::Reg(dst), Operand::Imm(imm as i64)),
    )
}

/// `shl reg, imm8`.
pub fn shift_left_logical(amount: u8, reg: Reg) -> Instruction {
    let b = alloc::vec![0xC1, modrm(0b11, 4, reg.0), amount];
    finish(
        b,
        "shl",
        operands2(Operand::Reg(reg), Operand::Imm(amount as i64)),
    )
}

/// `shr reg, imm8`.
pub fn shift_right_logical(amount: u8, reg: Reg) -> Instruction {
    let b = alloc::vec![0xC1, modrm(0b11, 5, reg.0), amount];
    finish(
        b,
        "shr",
        operands2(Operand::Reg(reg), Operand::Imm(amount as i64)),
    )
}

/// `cmp reg, imm32`.
pub fn compare_imm_reg(imm: u64, reg: Reg) -> Instruction {
    let mut b = Vec::with_capacity(6);
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

/// `call [addr]` through an absolute address slot.
pub fn call_mem_abs(addr: u64) -> Instruction {
    let mut b = Vec::with_capacity(6);
    b.push(0xFF);
    abs32(&mut b, 2, addr);
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
    finish(
        alloc::vec![0x50 + reg.0],
        "push",
        operands1(Operand::Reg(reg)),
    )
}

/// `pop reg`.
pub fn pop_reg(reg: Reg) -> Instruction {
    finish(
        alloc::vec![0x58 + reg.0],
        "pop",
        operands1(Operand::Reg(reg)),
    )
}

/// `pushfd`.
pub fn push_flags() -> Instruction {
    finish(alloc::vec![0x9C], "pushf", operands1(Operand::Unused))
}

/// `popfd`.
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

/// `mov [addr], ah`.
pub fn mov_ah_to_mem(addr: u64) -> Instruction {
    let mut b = Vec::with_capacity(6);
    b.push(0x88);
    abs32(&mut b, 4, addr);
    finish(b, "mov", operands1(mem_abs(addr)))
}

/// `mov ah, [addr]`.
pub fn mov_mem_to_ah(addr: u64) -> Instruction {
    let mut b = Vec::with_capacity(6);
    b.push(0x8A);
    abs32(&mut b, 4, addr);
    finish(b, "mov", operands1(mem_abs(addr)))
}

/// `nop`.
pub fn nop() -> Instruction {
    finish(alloc::vec![0x90], "nop", operands1(Operand::Unused))
}
