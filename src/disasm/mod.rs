//! x86/x86-64 instruction decoder.
//!
//! The decoder recovers three things the rewriter depends on:
//! instruction *length* (authoritative; layout and displacement math
//! trust it), *operand structure* (memory operands feed the address
//! calculation), and the coarse *classification* used for block
//! formation and point eligibility. Mnemonics are best-effort labels.

mod tables;

use crate::error::{disasm_error, Result};
use crate::insn::{
    DecodeMode, InsnFlags, InsnType, Instruction, MemBase, MemOperand, Operand, Reg, RegSet,
    SegReg, JUMP_TARGET_OPERAND, MAX_OPERANDS, REG_AX, REG_BP, REG_BX, REG_CX, REG_DI, REG_DX,
    REG_SI, REG_SP,
};
use tables::{group_entry, invalid_in_64, Desc, Enc, Imm, MOVSXD, ONE_BYTE, TWO_BYTE};

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

/// Hard ceiling from the architecture; anything longer is a decode bug
/// or garbage bytes.
const MAX_INSN_LEN: usize = 15;

#[derive(Default)]
struct Prefixes {
    osz: bool,
    asz: bool,
    lock: bool,
    rep: bool,
    repne: bool,
    seg: Option<SegReg>,
    rex: u8,
}

impl Prefixes {
    #[inline]
    fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }
    #[inline]
    fn rex_r(&self) -> u8 {
        (self.rex >> 2) & 1
    }
    #[inline]
    fn rex_x(&self) -> u8 {
        (self.rex >> 1) & 1
    }
    #[inline]
    fn rex_b(&self) -> u8 {
        self.rex & 1
    }
}

struct Cursor<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Cursor<'b> {
    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| disasm_error("truncated instruction"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes_le(&mut self, n: usize) -> Result<u64> {
        if self.pos + n > self.bytes.len() {
            return Err(disasm_error("truncated instruction"));
        }
        let mut v = 0u64;
        for i in 0..n {
            v |= (self.bytes[self.pos + i] as u64) << (8 * i);
        }
        self.pos += n;
        Ok(v)
    }

    fn signed_le(&mut self, n: usize) -> Result<i64> {
        let raw = self.bytes_le(n)?;
        let shift = 64 - 8 * n as u32;
        Ok(((raw << shift) as i64) >> shift)
    }
}

/// Decodes the next instruction at virtual address `addr` from `bytes`.
///
/// `bytes` may extend past the end of the containing text object; the
/// caller enforces the object boundary and truncates the tail
/// instruction if the decoder runs long.
pub fn decode_next(mode: DecodeMode, addr: u64, bytes: &[u8]) -> Result<Instruction> {
    let mut cur = Cursor { bytes, pos: 0 };
    let mut pfx = Prefixes::default();

    // Legacy prefixes in any order; REX must immediately precede the
    // opcode, so any later legacy prefix voids a pending REX.
    let op = loop {
        let b = cur.u8()?;
        match b {
            0x26 => pfx.seg = Some(SegReg::Es),
            0x2E => pfx.seg = Some(SegReg::Cs),
            0x36 => pfx.seg = Some(SegReg::Ss),
            0x3E => pfx.seg = Some(SegReg::Ds),
            0x64 => pfx.seg = Some(SegReg::Fs),
            0x65 => pfx.seg = Some(SegReg::Gs),
            0x66 => pfx.osz = true,
            0x67 => pfx.asz = true,
            0xF0 => pfx.lock = true,
            0xF2 => pfx.repne = true,
            0xF3 => pfx.rep = true,
            0x40..=0x4F if mode == DecodeMode::Mode64 => {
                pfx.rex = b;
                continue;
            }
            _ => break b,
        }
        pfx.rex = 0;
        if cur.pos >= MAX_INSN_LEN {
            return Err(disasm_error(format!("prefix run-on at {addr:#x}")));
        }
    };

    let mut mnemonic: &str;
    let mut itype;
    let mut flags = InsnFlags::empty();
    let mut operands = [Operand::Unused; MAX_OPERANDS];
    let mut touched = RegSet::empty();
    let mut byte_op = false;
    let mut group_reg = 0u8;
    let mut pc_disp: Option<usize> = None;

    if pfx.lock {
        flags |= InsnFlags::LOCK;
    }
    if pfx.rep || pfx.repne {
        flags |= InsnFlags::REP;
    }

    let desc: Desc;
    let two_byte;
    let mut op2 = 0u8;
    if op == 0x0F {
        two_byte = true;
        op2 = cur.u8()?;
        match op2 {
            // Three-byte escapes: ModRM follows, 0F 3A adds an imm8.
            0x38 => {
                let _op3 = cur.u8()?;
                let (reg, rm, pc_pos) = decode_modrm(mode, &pfx, &mut cur)?;
                pc_disp = pc_pos;
                group_reg = reg;
                operands[0] = reg_operand(reg, false, &pfx);
                operands[1] = rm;
                finish_mem_flags(&mut flags, &operands, "simd");
                let mut insn =
                    build(addr, cur, "simd", InsnType::Simd, flags, operands, touched)?;
                if let Some(pos) = pc_disp {
                    insn.set_pc_disp_offset(pos as u8);
                }
                return Ok(insn);
            }
            0x3A => {
                let _op3 = cur.u8()?;
                let (reg, rm, pc_pos) = decode_modrm(mode, &pfx, &mut cur)?;
                pc_disp = pc_pos;
                group_reg = reg;
                operands[0] = reg_operand(reg, false, &pfx);
                operands[1] = rm;
                cur.u8()?;
                finish_mem_flags(&mut flags, &operands, "simd");
                let mut insn =
                    build(addr, cur, "simd", InsnType::Simd, flags, operands, touched)?;
                if let Some(pos) = pc_disp {
                    insn.set_pc_disp_offset(pos as u8);
                }
                return Ok(insn);
            }
            _ => {}
        }
        desc = TWO_BYTE[op2 as usize];
        byte_op = matches!(op2, 0x90..=0x9F | 0xB6 | 0xBE | 0xC0);
    } else {
        two_byte = false;
        if mode == DecodeMode::Mode64 && invalid_in_64(op) {
            return Err(disasm_error(format!(
                "opcode {op:#04x} invalid in 64-bit mode at {addr:#x}"
            )));
        }
        desc = if mode == DecodeMode::Mode64 && op == 0x63 {
            MOVSXD
        } else {
            ONE_BYTE[op as usize]
        };
        byte_op = matches!(
            op,
            0x00 | 0x02
                | 0x04
                | 0x08
                | 0x0A
                | 0x0C
                | 0x10
                | 0x12
                | 0x14
                | 0x18
                | 0x1A
                | 0x1C
                | 0x20
                | 0x22
                | 0x24
                | 0x28
                | 0x2A
                | 0x2C
                | 0x30
                | 0x32
                | 0x34
                | 0x38
                | 0x3A
                | 0x3C
                | 0x84
                | 0x86
                | 0x88
                | 0x8A
                | 0xA0
                | 0xA2
                | 0xA8
                | 0xB0..=0xB7
                | 0xC0
                | 0xC6
                | 0xD0
                | 0xD2
                | 0xE4
                | 0xE6
                | 0xF6
                | 0xFE
        );
    }

    mnemonic = desc.mnemonic;
    itype = desc.itype;

    match desc.enc {
        Enc::Invalid => {
            return Err(disasm_error(format!(
                "unclassifiable opcode at {addr:#x}"
            )));
        }
        Enc::Prefix => {
            // Prefix bytes are consumed by the loop above; reaching a
            // Prefix entry here means a prefix with no opcode.
            return Err(disasm_error(format!("dangling prefix at {addr:#x}")));
        }
        Enc::Esc => {
            return Err(disasm_error(format!("nested escape at {addr:#x}")));
        }
        Enc::NoOps(imm) => {
            read_imm(&mut cur, imm, &pfx, &mut operands, 0)?;
        }
        Enc::Acc(imm) => {
            operands[0] = Operand::ImplicitReg(REG_AX);
            touched.insert(REG_AX);
            read_imm(&mut cur, imm, &pfx, &mut operands, 1)?;
        }
        Enc::RegOp(imm) => {
            let base = if two_byte { op2 } else { op };
            let r = Reg((base & 7) | (pfx.rex_b() << 3));
            operands[0] = if byte_op {
                Operand::Reg(byte_reg(r.0, pfx.rex != 0))
            } else {
                Operand::Reg(r)
            };
            read_imm(&mut cur, imm, &pfx, &mut operands, 1)?;
        }
        Enc::ModRm(imm) => {
            let (reg, rm, pc_pos) = decode_modrm(mode, &pfx, &mut cur)?;
            pc_disp = pc_pos;
            group_reg = reg;
            // Direction: the odd "reg, r/m" forms of the ALU/mov rows
            // load into the register; everything else lists r/m first.
            let reg_opnd = reg_operand(reg, byte_op, &pfx);
            let reg_is_dst = if two_byte {
                !matches!(op2, 0x90..=0x9F)
            } else {
                op & 0x02 != 0 && op < 0x40
            };
            if reg_is_dst {
                operands[0] = reg_opnd;
                operands[1] = rm;
            } else {
                operands[0] = rm;
                operands[1] = reg_opnd;
            }
            read_imm_slot2(&mut cur, imm, &pfx, &mut operands)?;
        }
        Enc::Rel8 => {
            let rel = cur.signed_le(1)?;
            let target = (addr as i64 + cur.pos as i64 + rel) as u64;
            operands[JUMP_TARGET_OPERAND] = Operand::ImmRel { target };
        }
        Enc::RelZ => {
            // Near branches keep their 32-bit displacement in 64-bit
            // mode regardless of the operand-size prefix.
            let n = if mode == DecodeMode::Mode32 && pfx.osz {
                2
            } else {
                4
            };
            let rel = cur.signed_le(n)?;
            let target = (addr as i64 + cur.pos as i64 + rel) as u64;
            operands[JUMP_TARGET_OPERAND] = Operand::ImmRel { target };
        }
        Enc::Moffs => {
            let n = match (mode, pfx.asz) {
                (DecodeMode::Mode64, false) => 8,
                (DecodeMode::Mode64, true) => 4,
                (DecodeMode::Mode32, false) => 4,
                (DecodeMode::Mode32, true) => 2,
            };
            let off = cur.bytes_le(n)?;
            let mem = Operand::Mem(MemOperand {
                base: MemBase::None,
                index: None,
                scale: 0,
                disp: off as i64,
                segment: pfx.seg,
            });
            touched.insert(REG_AX);
            if op & 0x02 == 0 {
                operands[0] = Operand::ImplicitReg(REG_AX);
                operands[1] = mem;
                flags |= InsnFlags::READS_MEMORY;
            } else {
                operands[0] = mem;
                operands[1] = Operand::ImplicitReg(REG_AX);
                flags |= InsnFlags::WRITES_MEMORY;
            }
        }
        Enc::Far => {
            let n = 2 + if pfx.osz { 2usize } else { 4 };
            cur.bytes_le(n)?;
            flags |= InsnFlags::INDIRECT;
        }
        Enc::Group(id, imm) => {
            let (reg, rm, pc_pos) = decode_modrm(mode, &pfx, &mut cur)?;
            pc_disp = pc_pos;
            group_reg = reg;
            let entry = group_entry(id, reg);
            if entry.mnemonic == "(bad)" {
                return Err(disasm_error(format!(
                    "unclassifiable group encoding at {addr:#x}"
                )));
            }
            mnemonic = entry.mnemonic;
            itype = entry.itype;
            operands[0] = rm;
            if entry.uses_imm {
                read_imm(&mut cur, imm, &pfx, &mut operands, 1)?;
            }
            if entry.is_call {
                flags |= InsnFlags::CALL;
            }
            if entry.is_indirect_branch {
                flags |= InsnFlags::INDIRECT;
            }
        }
    }

    // Call/return attribution for the direct forms.
    if !two_byte {
        match op {
            0xE8 | 0x9A => flags |= InsnFlags::CALL,
            0xC2 | 0xC3 | 0xCA | 0xCB | 0xCF => flags |= InsnFlags::RETURN,
            _ => {}
        }
    }

    finish_mem_flags(&mut flags, &operands, mnemonic);
    implicit_touched(&mut touched, mode, two_byte, op, op2, group_reg, &pfx);

    let mut insn = build(addr, cur, mnemonic, itype, flags, operands, touched)?;
    if let Some(pos) = pc_disp {
        insn.set_pc_disp_offset(pos as u8);
    }
    Ok(insn)
}

#[allow(clippy::too_many_arguments)]
fn build(
    addr: u64,
    cur: Cursor<'_>,
    mnemonic: &str,
    itype: InsnType,
    mut flags: InsnFlags,
    operands: [Operand; MAX_OPERANDS],
    mut touched: RegSet,
) -> Result<Instruction> {
    if cur.pos > MAX_INSN_LEN {
        return Err(disasm_error(format!(
            "instruction longer than {MAX_INSN_LEN} bytes at {addr:#x}"
        )));
    }
    for opnd in operands.iter() {
        match opnd {
            Operand::Reg(r) | Operand::ImplicitReg(r) => touched.insert(*r),
            Operand::Mem(m) => {
                if let MemBase::Gpr(r) = m.base {
                    touched.insert(r);
                }
                if let Some(r) = m.index {
                    touched.insert(r);
                }
                if m.base == MemBase::Pc {
                    flags |= InsnFlags::PC_RELATIVE;
                }
            }
            _ => {}
        }
    }
    let bytes = cur.bytes[..cur.pos].to_vec();
    Ok(Instruction::new(
        addr,
        bytes,
        itype,
        flags,
        operands,
        String::from(mnemonic),
        touched,
    ))
}

/// Maps a byte-register encoding to the containing GPR. Without REX,
/// encodings 4..=7 name AH/CH/DH/BH, which live in AX/CX/DX/BX.
fn byte_reg(n: u8, has_rex: bool) -> Reg {
    if !has_rex && (4..8).contains(&n) {
        Reg(n - 4)
    } else {
        Reg(n)
    }
}

fn reg_operand(reg: u8, byte_op: bool, pfx: &Prefixes) -> Operand {
    if byte_op {
        Operand::Reg(byte_reg(reg, pfx.rex != 0))
    } else {
        Operand::Reg(Reg(reg))
    }
}

fn read_imm(
    cur: &mut Cursor<'_>,
    imm: Imm,
    pfx: &Prefixes,
    operands: &mut [Operand; MAX_OPERANDS],
    slot: usize,
) -> Result<()> {
    let val = match imm {
        Imm::None => return Ok(()),
        Imm::B => cur.signed_le(1)?,
        Imm::W => cur.signed_le(2)?,
        Imm::Z => {
            let n = if pfx.osz && !pfx.rex_w() { 2 } else { 4 };
            cur.signed_le(n)?
        }
        Imm::V => {
            let n = if pfx.rex_w() {
                8
            } else if pfx.osz {
                2
            } else {
                4
            };
            cur.signed_le(n)?
        }
        Imm::WB => {
            let w = cur.signed_le(2)?;
            cur.u8()?;
            w
        }
    };
    operands[slot] = Operand::Imm(val);
    Ok(())
}

fn read_imm_slot2(
    cur: &mut Cursor<'_>,
    imm: Imm,
    pfx: &Prefixes,
    operands: &mut [Operand; MAX_OPERANDS],
) -> Result<()> {
    // The immediate of a two-register form lands after both register
    // operands; slot 2 is reserved for jump targets, so fold it into
    // slot 1 when slot 1 is occupied by the reg operand.
    if imm == Imm::None {
        return Ok(());
    }
    let slot = if operands[1].is_unused() { 1 } else { 0 };
    let mut scratch = [Operand::Unused; MAX_OPERANDS];
    read_imm(cur, imm, pfx, &mut scratch, 0)?;
    if slot == 1 {
        operands[1] = scratch[0];
    } else {
        // Both slots taken: the immediate replaces nothing; it was
        // consumed for length purposes, which is what matters here.
        let _ = scratch;
    }
    Ok(())
}

fn decode_modrm(
    mode: DecodeMode,
    pfx: &Prefixes,
    cur: &mut Cursor<'_>,
) -> Result<(u8, Operand, Option<usize>)> {
    let modrm = cur.u8()?;
    let md = modrm >> 6;
    let reg = ((modrm >> 3) & 7) | (pfx.rex_r() << 3);
    let rm = modrm & 7;

    if md == 0b11 {
        return Ok((reg, Operand::Reg(Reg(rm | (pfx.rex_b() << 3))), None));
    }

    // 16-bit addressing only exists behind the address-size prefix in
    // 32-bit mode.
    if mode == DecodeMode::Mode32 && pfx.asz {
        return decode_modrm16(md, reg, rm, pfx, cur);
    }

    let base;
    let mut index = None;
    let mut scale = 0u8;

    if rm == 4 {
        let sib = cur.u8()?;
        let ss = sib >> 6;
        let idx = ((sib >> 3) & 7) | (pfx.rex_x() << 3);
        let b = (sib & 7) | (pfx.rex_b() << 3);
        if idx != 4 {
            index = Some(Reg(idx));
            scale = 1 << ss;
        }
        if (sib & 7) == 5 && md == 0b00 {
            base = MemBase::None;
        } else {
            base = MemBase::Gpr(Reg(b));
        }
    } else if rm == 5 && md == 0b00 {
        base = match mode {
            DecodeMode::Mode64 => MemBase::Pc,
            DecodeMode::Mode32 => MemBase::None,
        };
    } else {
        base = MemBase::Gpr(Reg(rm | (pfx.rex_b() << 3)));
    }

    // A SIB with no base and mod=00 carries a disp32 like the plain
    // rm=101 form does.
    let mut pc_disp_pos = None;
    let disp = match md {
        0b00 => {
            if base == MemBase::None || base == MemBase::Pc {
                if base == MemBase::Pc {
                    pc_disp_pos = Some(cur.pos);
                }
                cur.signed_le(4)?
            } else {
                0
            }
        }
        0b01 => cur.signed_le(1)?,
        _ => cur.signed_le(4)?,
    };

    Ok((
        reg,
        Operand::Mem(MemOperand {
            base,
            index,
            scale,
            disp,
            segment: pfx.seg,
        }),
        pc_disp_pos,
    ))
}

fn decode_modrm16(
    md: u8,
    reg: u8,
    rm: u8,
    pfx: &Prefixes,
    cur: &mut Cursor<'_>,
) -> Result<(u8, Operand, Option<usize>)> {
    const BASES: [(MemBase, Option<Reg>); 8] = [
        (MemBase::Gpr(REG_BX), Some(REG_SI)),
        (MemBase::Gpr(REG_BX), Some(REG_DI)),
        (MemBase::Gpr(REG_BP), Some(REG_SI)),
        (MemBase::Gpr(REG_BP), Some(REG_DI)),
        (MemBase::Gpr(REG_SI), None),
        (MemBase::Gpr(REG_DI), None),
        (MemBase::Gpr(REG_BP), None),
        (MemBase::Gpr(REG_BX), None),
    ];
    let (mut base, index) = BASES[rm as usize];
    let disp = match md {
        0b00 => {
            if rm == 6 {
                base = MemBase::None;
                cur.signed_le(2)?
            } else {
                0
            }
        }
        0b01 => cur.signed_le(1)?,
        _ => cur.signed_le(2)?,
    };
    Ok((
        reg,
        Operand::Mem(MemOperand {
            base,
            index,
            scale: 0,
            disp,
            segment: pfx.seg,
        }),
        None,
    ))
}

/// Memory access attribution. Coarse on purpose: the probe records the
/// effective address whether the instruction reads or writes, so the
/// only cases that matter are the non-accessing ones.
fn finish_mem_flags(flags: &mut InsnFlags, operands: &[Operand; MAX_OPERANDS], mnemonic: &str) {
    let has_mem = operands
        .iter()
        .any(|o| matches!(o, Operand::Mem(_)));
    if !has_mem {
        return;
    }
    match mnemonic {
        "lea" | "nop" => {}
        "prefetch" | "prefetchnta" | "prefetcht0" | "prefetcht1" | "prefetcht2" => {
            *flags |= InsnFlags::READS_MEMORY;
        }
        "cmp" | "test" | "bt" | "push" => {
            *flags |= InsnFlags::READS_MEMORY;
        }
        _ => {
            *flags |= InsnFlags::READS_MEMORY | InsnFlags::WRITES_MEMORY;
        }
    }
}

fn implicit_touched(
    touched: &mut RegSet,
    mode: DecodeMode,
    two_byte: bool,
    op: u8,
    op2: u8,
    group_reg: u8,
    pfx: &Prefixes,
) {
    if two_byte {
        match op2 {
            0x31 | 0x33 => {
                touched.insert(REG_AX);
                touched.insert(REG_DX);
            }
            0xA2 => {
                touched.insert(REG_AX);
                touched.insert(REG_BX);
                touched.insert(REG_CX);
                touched.insert(REG_DX);
            }
            0xA5 | 0xAD => touched.insert(REG_CX),
            0xA0 | 0xA1 | 0xA8 | 0xA9 => touched.insert(REG_SP),
            0xB0 | 0xB1 => touched.insert(REG_AX),
            0x05 => {
                touched.insert(REG_AX);
                touched.insert(REG_CX);
                touched.insert(REG_DX);
                if mode == DecodeMode::Mode64 {
                    touched.insert(Reg(11));
                }
            }
            _ => {}
        }
        return;
    }
    match op {
        0x50..=0x5F | 0x68 | 0x6A | 0x9C | 0x9D | 0xC2 | 0xC3 | 0xC8 | 0xC9 | 0xCA | 0xCB
        | 0xE8 => touched.insert(REG_SP),
        0x60 | 0x61 => touched.insert(REG_SP),
        0x6C..=0x6F | 0xA4..=0xA7 | 0xAA..=0xAF => {
            touched.insert(REG_SI);
            touched.insert(REG_DI);
            if pfx.rep || pfx.repne {
                touched.insert(REG_CX);
            }
            touched.insert(REG_AX);
        }
        0x91..=0x97 => touched.insert(REG_AX),
        0x98 => touched.insert(REG_AX),
        0x99 => {
            touched.insert(REG_AX);
            touched.insert(REG_DX);
        }
        0x9E | 0x9F => touched.insert(REG_AX),
        0xD2 | 0xD3 => touched.insert(REG_CX),
        0xD7 => {
            touched.insert(REG_AX);
            touched.insert(REG_BX);
        }
        0xE0..=0xE3 => touched.insert(REG_CX),
        0xE4..=0xE7 | 0xEC..=0xEF => {
            touched.insert(REG_AX);
            touched.insert(REG_DX);
        }
        0xF6 | 0xF7 if group_reg >= 4 => {
            touched.insert(REG_AX);
            touched.insert(REG_DX);
        }
        0xFF if group_reg == 2 || group_reg == 3 || group_reg == 6 => touched.insert(REG_SP),
        _ => {}
    }
}

/// Decodes instructions linearly until `size` bytes are consumed.
///
/// Returns the instructions and the number of bytes actually decoded,
/// which can exceed `size` by the overrun of the final instruction;
/// the caller applies the tail-truncation rule.
pub fn decode_linear(
    mode: DecodeMode,
    base: u64,
    bytes: &[u8],
    size: usize,
) -> Result<(Vec<Instruction>, usize)> {
    let mut insns = Vec::new();
    let mut off = 0usize;
    while off < size {
        let insn = decode_next(mode, base + off as u64, &bytes[off..])?;
        off += insn.len() as usize;
        insns.push(insn);
    }
    Ok((insns, off))
}
