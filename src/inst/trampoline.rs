//! Point planting: site rewriting and trampoline construction.
//!
//! A planted point has two realizations, selected by [`InstMode`]:
//!
//! * `Tramp` replaces the displaced range with `jmp rel32` into
//!   out-of-line code that saves flags, runs the precursors, calls the
//!   tool function through its load-time-resolved slot, restores
//!   state, re-executes the displaced instructions, and jumps back.
//!   The call is unconditional: a trailing buffer-guard branch in the
//!   precursors is dropped.
//! * `TrampInline` overwrites a wider displaced range with the
//!   precursor sequence itself followed by the long jump, so the
//!   buffer-not-full fast path never reaches the call-support block;
//!   the guard branch hops straight over the slow jump. Sites too
//!   narrow to hold the precursors fall back to the out-of-line layout
//!   with the guard skipping the call-support block inside the
//!   trampoline.
//!
//! Displaced instructions are re-emitted with PC-relative material
//! patched for their new location.

use super::{FlagsProtectionMethod, InstMode};
use crate::codegen::{x86, x86_64};
use crate::error::{disasm_error, no_room_for_jump, Result};
use crate::insn::{Instruction, Reg, REG_AX, REG_CX, REG_DI, REG_DX, REG_SI};
use crate::text::Function;

use alloc::vec::Vec;

/// Size of the `jmp rel32` that replaces the displaced range.
pub(crate) const MIN_JUMP_SIZE: u32 = 5;

const CALLER_SAVED_64: [Reg; 9] = [
    REG_AX,
    REG_CX,
    REG_DX,
    REG_SI,
    REG_DI,
    Reg(8),
    Reg(9),
    Reg(10),
    Reg(11),
];
const CALLER_SAVED_32: [Reg; 3] = [REG_AX, REG_CX, REG_DX];

/// First register-save slot used by the call-support block; slots
/// 0..=4 belong to flags protection and the address-calc temporaries.
const SUPPORT_SLOT_BASE: u64 = 5;

/// The call-support block: spill every caller-saved register, call the
/// tool function through its absolute slot, restore.
pub(crate) fn build_call_support(
    is64: bool,
    fn_slot_addr: u64,
    save_base: u64,
) -> Vec<Instruction> {
    let mut out = Vec::new();
    if is64 {
        for (i, r) in CALLER_SAVED_64.iter().enumerate() {
            out.push(x86_64::mov_reg_to_mem(
                *r,
                save_base + (SUPPORT_SLOT_BASE + i as u64) * 8,
            ));
        }
        out.push(x86_64::call_mem_abs(fn_slot_addr));
        for (i, r) in CALLER_SAVED_64.iter().enumerate().rev() {
            out.push(x86_64::mov_mem_to_reg(
                save_base + (SUPPORT_SLOT_BASE + i as u64) * 8,
                *r,
            ));
        }
    } else {
        for (i, r) in CALLER_SAVED_32.iter().enumerate() {
            out.push(x86::mov_reg_to_mem(
                *r,
                save_base + (SUPPORT_SLOT_BASE + i as u64) * 8,
            ));
        }
        out.push(x86::call_mem_abs(fn_slot_addr));
        for (i, r) in CALLER_SAVED_32.iter().enumerate().rev() {
            out.push(x86::mov_mem_to_reg(
                save_base + (SUPPORT_SLOT_BASE + i as u64) * 8,
                *r,
            ));
        }
    }
    out
}

/// Byte size of the call-support block; the `jl` at the end of a
/// precursor list skips exactly this much in the out-of-line layout.
pub(crate) fn call_support_size(is64: bool) -> u32 {
    build_call_support(is64, 0, 0)
        .iter()
        .map(|i| i.len())
        .sum()
}

/// Flags-save sequence. Light protection parks the true AX value in
/// slot 0 and keeps the flags image in AH until restore.
fn flags_save(is64: bool, method: FlagsProtectionMethod, save_base: u64) -> Vec<Instruction> {
    match (is64, method) {
        (true, FlagsProtectionMethod::Full) => alloc::vec![x86_64::push_flags()],
        (true, FlagsProtectionMethod::Light) => alloc::vec![
            x86_64::mov_reg_to_mem(REG_AX, save_base),
            x86_64::load_ah_from_flags(),
        ],
        (false, FlagsProtectionMethod::Full) => alloc::vec![x86::push_flags()],
        (false, FlagsProtectionMethod::Light) => alloc::vec![
            x86::mov_reg_to_mem(REG_AX, save_base),
            x86::load_ah_from_flags(),
        ],
    }
}

fn flags_restore(is64: bool, method: FlagsProtectionMethod, save_base: u64) -> Vec<Instruction> {
    match (is64, method) {
        (true, FlagsProtectionMethod::Full) => alloc::vec![x86_64::pop_flags()],
        (true, FlagsProtectionMethod::Light) => alloc::vec![
            x86_64::store_ah_to_flags(),
            x86_64::mov_mem_to_reg(save_base, REG_AX),
        ],
        (false, FlagsProtectionMethod::Full) => alloc::vec![x86::pop_flags()],
        (false, FlagsProtectionMethod::Light) => alloc::vec![
            x86::store_ah_to_flags(),
            x86::mov_mem_to_reg(save_base, REG_AX),
        ],
    }
}

fn total_len(insns: &[Instruction]) -> u32 {
    insns.iter().map(|i| i.len()).sum()
}

fn extend_with(bytes: &mut Vec<u8>, insns: &[Instruction]) {
    for insn in insns {
        bytes.extend_from_slice(insn.bytes());
    }
}

fn jmp_rel32(is64: bool, from: u64, to: u64) -> Instruction {
    let rel = to as i64 - (from as i64 + MIN_JUMP_SIZE as i64);
    if is64 {
        x86_64::branch_rel32(rel as i32)
    } else {
        x86::branch_rel32(rel as i32)
    }
}

/// True when the precursor list ends with the engine-generated
/// buffer-guard branch.
fn ends_with_guard(precursors: &[Instruction]) -> bool {
    precursors.last().is_some_and(|i| i.mnemonic() == "jl")
}

/// The instructions displaced to make room for the planted code.
#[derive(Debug)]
pub(crate) struct Displaced {
    pub old_addr: u64,
    pub total_len: u32,
    pub insns: Vec<Instruction>,
}

/// Coalesces instructions starting at `addr` until the range covers
/// `required` bytes. A branch landing inside the coalesced range (past
/// its first byte) makes the point unplantable.
pub(crate) fn coalesce_displaced(func: &Function, addr: u64, required: u32) -> Result<Displaced> {
    let graph = func
        .flow_graph()
        .ok_or_else(|| no_room_for_jump("function has no flow graph"))?;

    let mut all: Vec<&Instruction> = graph
        .blocks
        .iter()
        .flat_map(|b| b.instructions().iter())
        .collect();
    all.sort_by_key(|i| i.addr());

    let start = all
        .iter()
        .position(|i| i.addr() == addr)
        .ok_or_else(|| no_room_for_jump("target address does not start an instruction"))?;

    let mut insns: Vec<Instruction> = Vec::new();
    let mut total = 0u32;
    for insn in &all[start..] {
        insns.push((*insn).clone());
        total += insn.len();
        if total >= required {
            break;
        }
    }
    if total < required {
        return Err(no_room_for_jump(alloc::format!(
            "{total} of {required} bytes from {addr:#x} to the end of {}",
            func.name()
        )));
    }

    // Any branch target strictly inside (addr, addr+total) would jump
    // into the overwritten range.
    let end = addr + total as u64;
    for insn in &all {
        if let Some(target) = insn.branch_target() {
            if target > addr && target < end {
                return Err(no_room_for_jump(alloc::format!(
                    "branch target {target:#x} lands inside the displaced range at {addr:#x}"
                )));
            }
        }
    }

    Ok(Displaced {
        old_addr: addr,
        total_len: total,
        insns,
    })
}

/// Re-encodes one displaced instruction for its new location,
/// preserving its architectural effect.
fn relocate_insn(insn: &Instruction, new_addr: u64) -> Result<Vec<u8>> {
    // Direct control transfers are re-encoded with a fresh rel32.
    if let Some(target) = insn.branch_target() {
        let bytes = insn.bytes();
        let op = bytes[0];
        let make = |opc: &[u8]| -> Vec<u8> {
            let total = opc.len() as i64 + 4;
            let rel = target as i64 - (new_addr as i64 + total);
            let mut v = opc.to_vec();
            v.extend_from_slice(&(rel as i32).to_le_bytes());
            v
        };
        return Ok(match op {
            0xEB | 0xE9 => make(&[0xE9]),
            0xE8 => make(&[0xE8]),
            0x70..=0x7F => make(&[0x0F, 0x80 + (op & 0x0F)]),
            0x0F if bytes.len() > 1 && (0x80..=0x8F).contains(&bytes[1]) => {
                make(&[0x0F, bytes[1]])
            }
            // loop/jcxz have no rel32 form.
            0xE0..=0xE3 => {
                return Err(no_room_for_jump(alloc::format!(
                    "cannot relocate short-only branch at {:#x}",
                    insn.addr()
                )));
            }
            _ => {
                return Err(disasm_error(alloc::format!(
                    "unrecognized branch encoding at {:#x}",
                    insn.addr()
                )));
            }
        });
    }

    let mut bytes = insn.bytes().to_vec();
    // PC-relative memory operands keep their absolute target.
    if let Some(off) = insn.pc_disp_offset() {
        let off = off as usize;
        let mut disp = [0u8; 4];
        disp.copy_from_slice(&bytes[off..off + 4]);
        let old_disp = i32::from_le_bytes(disp) as i64;
        let target = insn.addr() as i64 + insn.len() as i64 + old_disp;
        let new_disp = target - (new_addr as i64 + insn.len() as i64);
        let new_disp = i32::try_from(new_disp).map_err(|_| {
            disasm_error(alloc::format!(
                "PC-relative displacement at {:#x} does not reach from the trampoline",
                insn.addr()
            ))
        })?;
        bytes[off..off + 4].copy_from_slice(&new_disp.to_le_bytes());
    }
    Ok(bytes)
}

/// One realized point: the bytes written over the displaced range and
/// the out-of-line bytes placed at `tramp_base`.
#[derive(Debug)]
pub(crate) struct PlantedPoint {
    pub displaced_addr: u64,
    pub displaced_len: u32,
    pub site_bytes: Vec<u8>,
    pub tramp_bytes: Vec<u8>,
    /// Old address → new address for each displaced instruction.
    pub insn_map: Vec<(u64, u64, u32)>,
}

/// Realizes one point at `tramp_base`, in the layout its mode asks
/// for.
#[allow(clippy::too_many_arguments)]
pub(crate) fn plant_point(
    is64: bool,
    flags_method: FlagsProtectionMethod,
    mode: InstMode,
    precursors: &[Instruction],
    fn_slot_addr: u64,
    save_base: u64,
    func: &Function,
    target_addr: u64,
    tramp_base: u64,
) -> Result<PlantedPoint> {
    let save = flags_save(is64, flags_method, save_base);
    let restore = flags_restore(is64, flags_method, save_base);

    match mode {
        InstMode::TrampInline => {
            let inline_len = total_len(&save)
                + total_len(precursors)
                + MIN_JUMP_SIZE
                + total_len(&restore)
                + MIN_JUMP_SIZE;
            if let Ok(displaced) = coalesce_displaced(func, target_addr, inline_len) {
                return plant_inline(
                    is64,
                    &save,
                    &restore,
                    precursors,
                    fn_slot_addr,
                    save_base,
                    displaced,
                    tramp_base,
                );
            }
            // The site cannot hold the precursors; fall back to the
            // out-of-line layout with the guard skipping the
            // call-support block inside the trampoline.
            let displaced = coalesce_displaced(func, target_addr, MIN_JUMP_SIZE)?;
            plant_out_of_line(
                is64,
                &save,
                &restore,
                precursors,
                fn_slot_addr,
                save_base,
                displaced,
                tramp_base,
            )
        }
        InstMode::Tramp => {
            let displaced = coalesce_displaced(func, target_addr, MIN_JUMP_SIZE)?;
            // Tramp points call unconditionally; drop the buffer-guard
            // branch so nothing skips the call-support block.
            let precursors = if ends_with_guard(precursors) {
                &precursors[..precursors.len() - 1]
            } else {
                precursors
            };
            plant_out_of_line(
                is64,
                &save,
                &restore,
                precursors,
                fn_slot_addr,
                save_base,
                displaced,
                tramp_base,
            )
        }
    }
}

/// Out-of-line layout: the site is a long jump, the trampoline runs
/// everything.
#[allow(clippy::too_many_arguments)]
fn plant_out_of_line(
    is64: bool,
    save: &[Instruction],
    restore: &[Instruction],
    precursors: &[Instruction],
    fn_slot_addr: u64,
    save_base: u64,
    displaced: Displaced,
    tramp_base: u64,
) -> Result<PlantedPoint> {
    let mut site_bytes = Vec::with_capacity(displaced.total_len as usize);
    site_bytes.extend_from_slice(jmp_rel32(is64, displaced.old_addr, tramp_base).bytes());
    site_bytes.resize(displaced.total_len as usize, 0x90);

    let mut bytes: Vec<u8> = Vec::new();
    extend_with(&mut bytes, save);
    // The guard at the end of a precursor list skips exactly the
    // call-support block that follows.
    extend_with(&mut bytes, precursors);
    extend_with(&mut bytes, &build_call_support(is64, fn_slot_addr, save_base));
    // Restore flags ahead of the displaced copies; their behavior may
    // depend on them.
    extend_with(&mut bytes, restore);

    let mut insn_map = Vec::with_capacity(displaced.insns.len());
    for insn in &displaced.insns {
        let new_addr = tramp_base + bytes.len() as u64;
        let encoded = relocate_insn(insn, new_addr)?;
        insn_map.push((insn.addr(), new_addr, insn.len()));
        bytes.extend_from_slice(&encoded);
    }

    // Back to the fall-through of the displaced range.
    let fall_through = displaced.old_addr + displaced.total_len as u64;
    let jmp_addr = tramp_base + bytes.len() as u64;
    bytes.extend_from_slice(jmp_rel32(is64, jmp_addr, fall_through).bytes());

    Ok(PlantedPoint {
        displaced_addr: displaced.old_addr,
        displaced_len: displaced.total_len,
        site_bytes,
        tramp_bytes: bytes,
        insn_map,
    })
}

/// Inline layout: the displaced range holds the precursors themselves
/// followed by the slow-path jump, so the fast path never visits the
/// call-support block.
///
/// Site:       `[flags save][precursors, guard hops the slow jump]`
///             `[jmp → call support][flags restore][jmp → copies]`
/// Trampoline: `[call support][jmp → flags restore]`
///             `[displaced copies][jmp → fall-through]`
#[allow(clippy::too_many_arguments)]
fn plant_inline(
    is64: bool,
    save: &[Instruction],
    restore: &[Instruction],
    precursors: &[Instruction],
    fn_slot_addr: u64,
    save_base: u64,
    displaced: Displaced,
    tramp_base: u64,
) -> Result<PlantedPoint> {
    let site_addr = displaced.old_addr;
    let support = build_call_support(is64, fn_slot_addr, save_base);
    let copies_base = tramp_base + total_len(&support) as u64 + MIN_JUMP_SIZE as u64;

    let mut site_bytes = Vec::with_capacity(displaced.total_len as usize);
    extend_with(&mut site_bytes, save);
    // The guard only has to hop the slow jump here; re-encode it with
    // the short distance. `branch_jl` is fixed-size, so the layout
    // arithmetic is unaffected.
    for (i, insn) in precursors.iter().enumerate() {
        if i + 1 == precursors.len() && insn.mnemonic() == "jl" {
            let guard = if is64 {
                x86_64::branch_jl(MIN_JUMP_SIZE as i32)
            } else {
                x86::branch_jl(MIN_JUMP_SIZE as i32)
            };
            site_bytes.extend_from_slice(guard.bytes());
        } else {
            site_bytes.extend_from_slice(insn.bytes());
        }
    }
    // Slow path: buffer full, call the tool.
    let slow_jmp_addr = site_addr + site_bytes.len() as u64;
    site_bytes.extend_from_slice(jmp_rel32(is64, slow_jmp_addr, tramp_base).bytes());
    // Both paths converge here.
    let resume_addr = site_addr + site_bytes.len() as u64;
    extend_with(&mut site_bytes, restore);
    let hop_addr = site_addr + site_bytes.len() as u64;
    site_bytes.extend_from_slice(jmp_rel32(is64, hop_addr, copies_base).bytes());
    site_bytes.resize(displaced.total_len as usize, 0x90);

    let mut bytes: Vec<u8> = Vec::new();
    extend_with(&mut bytes, &support);
    let back_addr = tramp_base + bytes.len() as u64;
    bytes.extend_from_slice(jmp_rel32(is64, back_addr, resume_addr).bytes());

    debug_assert_eq!(tramp_base + bytes.len() as u64, copies_base);
    let mut insn_map = Vec::with_capacity(displaced.insns.len());
    for insn in &displaced.insns {
        let new_addr = tramp_base + bytes.len() as u64;
        let encoded = relocate_insn(insn, new_addr)?;
        insn_map.push((insn.addr(), new_addr, insn.len()));
        bytes.extend_from_slice(&encoded);
    }
    let fall_through = displaced.old_addr + displaced.total_len as u64;
    let jmp_addr = tramp_base + bytes.len() as u64;
    bytes.extend_from_slice(jmp_rel32(is64, jmp_addr, fall_through).bytes());

    Ok(PlantedPoint {
        displaced_addr: displaced.old_addr,
        displaced_len: displaced.total_len,
        site_bytes,
        tramp_bytes: bytes,
        insn_map,
    })
}
