//! Buffered address-calculation codegen.
//!
//! For a probed memory operand `[base + index*scale + disp]` the engine
//! generates a precursor sequence that computes the effective address,
//! appends a 16-byte entry to the circular buffer, and skips the tool
//! call while the buffer has room. The entry layout (ids at 0 and 4,
//! address at 8) and the `shl`/`shr` idiom around the cursor-add are
//! contracts the simulator runtime consumes directly.

use super::trampoline::call_support_size;
use super::{FlagsProtectionMethod, Instrumentor, BUFFER_ENTRY_SIZE};
use crate::codegen::{gs_override, x86, x86_64};
use crate::error::{logic_error, no_free_registers, Result};
use crate::insn::{DecodeMode, Instruction, MemBase, Reg, REG_AX, REG_SP};

use alloc::vec::Vec;

/// Where a probe's buffer lives in the arena.
#[derive(Debug, Clone, Copy)]
pub struct BufferSpec {
    /// Arena offset of the buffer itself.
    pub buffer_store: u64,
    /// Arena offset of the write cursor (an 8-byte slot; the low four
    /// bytes are the cursor value, initialized to 1 because 0 marks an
    /// empty thread-hash slot).
    pub cursor_store: u64,
    /// Buffer length in entries; a power of two.
    pub entries: u32,
}

/// The cursor-wrap contract the simulator applies when draining: a
/// logical shift pair over the 32-bit cursor.
#[inline]
pub fn wrap_cursor(cursor: u32, entries: u32) -> u32 {
    let k = 32 - entries.trailing_zeros();
    (cursor << k) >> k
}

impl Instrumentor {
    /// Generates the precursor list for a memory-op probe on `insn`.
    ///
    /// The sequence spills three temporaries to their fixed save
    /// slots, materializes the effective address, writes the buffer
    /// entry, advances and checks the cursor, restores the
    /// temporaries, and ends with a `jl` that skips the call-support
    /// block while the buffer has room.
    pub fn buffered_address_calc(
        &self,
        insn: &Instruction,
        block_id: u32,
        memop_id: u32,
        buffers: &BufferSpec,
    ) -> Result<Vec<Instruction>> {
        if !buffers.entries.is_power_of_two() {
            return Err(logic_error("buffer length must be a power of two"));
        }
        match self.image.decode_mode() {
            DecodeMode::Mode64 => self.address_calc_64(insn, block_id, memop_id, buffers),
            DecodeMode::Mode32 => self.address_calc_32(insn, block_id, memop_id, buffers),
        }
    }

    /// Picks three scratch registers the target instruction does not
    /// touch, highest register first. AX is never picked: under light
    /// flags protection it holds the flags image.
    fn pick_temps(&self, insn: &Instruction, pool: u8) -> Result<(Reg, Reg, Reg)> {
        let touched = insn.touched_registers();
        let mut picked = [REG_AX; 3];
        let mut n = 0;
        for r in (1..pool).rev() {
            let reg = Reg(r);
            if !touched.contains(reg) {
                picked[n] = reg;
                n += 1;
                if n == 3 {
                    return Ok((picked[0], picked[1], picked[2]));
                }
            }
        }
        Err(no_free_registers(alloc::format!(
            "instruction at {:#x} leaves fewer than three scratch registers",
            insn.addr()
        )))
    }

    fn address_calc_64(
        &self,
        insn: &Instruction,
        block_id: u32,
        memop_id: u32,
        buffers: &BufferSpec,
    ) -> Result<Vec<Instruction>> {
        let (t1, t2, t3) = self.pick_temps(insn, 16)?;
        let data = self.data_base;
        let save = data + self.reg_save_offset;
        let light = self.ctx.flags_protection == FlagsProtectionMethod::Light;
        let log2_entry = BUFFER_ENTRY_SIZE.trailing_zeros() as u8;
        let mem = insn.memory_operand().copied();

        let mut out = Vec::with_capacity(32);

        // Spill the temporaries to their fixed slots.
        out.push(x86_64::mov_reg_to_mem(t1, save + 2 * 8));
        out.push(x86_64::mov_reg_to_mem(t2, save + 3 * 8));
        out.push(x86_64::mov_reg_to_mem(t3, save + 4 * 8));

        match mem {
            Some(m) => {
                match m.base {
                    MemBase::Gpr(base) => {
                        out.push(x86_64::mov_reg_to_reg(base, t1));
                        // Under LAHF/SAHF, AX holds the flags image and
                        // its true value sits in the save area.
                        if base == REG_AX && light {
                            out.push(x86_64::mov_mem_to_reg(save, t1));
                        }
                        out.push(x86_64::reg_add_imm(t1, m.disp as u64));
                    }
                    MemBase::Pc => {
                        out.push(x86_64::mov_imm_to_reg(insn.next_addr(), t1));
                        out.push(x86_64::reg_add_imm(t1, m.disp as u64));
                    }
                    MemBase::None => {
                        out.push(x86_64::mov_imm_to_reg(m.disp as u64, t1));
                    }
                }
                if let Some(index) = m.index {
                    out.push(x86_64::mov_reg_to_reg(index, t2));
                    if index == REG_AX && light {
                        out.push(x86_64::mov_mem_to_reg(save, t2));
                    }
                    out.push(x86_64::reg_imm_mult_reg(t2, m.effective_scale(), t2));
                    out.push(x86_64::reg_add_reg(t2, t1));
                }
            }
            // No explicit operand: a stack-implicit access.
            None => out.push(x86_64::mov_reg_to_reg(REG_SP, t1)),
        }

        // Buffer base and cursor; thread-keyed probes read both
        // through the GS-based per-thread block.
        if self.ctx.thread_keyed {
            out.push(gs_override(x86_64::mov_mem_to_reg(buffers.buffer_store, t2)));
            out.push(gs_override(x86_64::mov_mem_to_reg(buffers.cursor_store, t3)));
        } else {
            out.push(x86_64::mov_imm_to_reg(data + buffers.buffer_store, t2));
            out.push(x86_64::mov_mem_to_reg(data + buffers.cursor_store, t3));
        }

        // Entry address: t2 += t3 << log2(entrySize), t3 restored.
        out.push(x86_64::shift_left_logical(log2_entry, t3));
        out.push(x86_64::reg_add_reg(t3, t2));
        out.push(x86_64::shift_right_logical(log2_entry, t3));

        // Fill the entry: address at 8, blockId at 0, memopId at 4.
        out.push(x86_64::mov_reg_to_regaddr_imm(t1, t2, 2 * 4, true));
        out.push(x86_64::mov_imm_to_reg(block_id as u64, t1));
        out.push(x86_64::mov_reg_to_regaddr_imm(t1, t2, 0, false));
        out.push(x86_64::mov_imm_to_reg(memop_id as u64, t1));
        out.push(x86_64::mov_reg_to_regaddr_imm(t1, t2, 4, false));

        // Advance the cursor and test for a full buffer.
        out.push(x86_64::reg_add_imm(t3, 1));
        if self.ctx.thread_keyed {
            out.push(gs_override(x86_64::mov_reg_to_mem(t3, buffers.cursor_store)));
        } else {
            out.push(x86_64::mov_reg_to_mem(t3, data + buffers.cursor_store));
        }
        out.push(x86_64::compare_imm_reg(buffers.entries as u64, t3));

        // Restore the temporaries.
        out.push(x86_64::mov_mem_to_reg(save + 4 * 8, t3));
        out.push(x86_64::mov_mem_to_reg(save + 3 * 8, t2));
        out.push(x86_64::mov_mem_to_reg(save + 2 * 8, t1));

        // Buffer not full: skip the tool call.
        out.push(x86_64::branch_jl(call_support_size(true) as i32));

        Ok(out)
    }

    fn address_calc_32(
        &self,
        insn: &Instruction,
        block_id: u32,
        memop_id: u32,
        buffers: &BufferSpec,
    ) -> Result<Vec<Instruction>> {
        let (t1, t2, t3) = self.pick_temps(insn, 8)?;
        let data = self.data_base;
        let save = data + self.reg_save_offset;
        let light = self.ctx.flags_protection == FlagsProtectionMethod::Light;
        let log2_entry = BUFFER_ENTRY_SIZE.trailing_zeros() as u8;
        let mem = insn.memory_operand().copied();

        let mut out = Vec::with_capacity(32);

        out.push(x86::mov_reg_to_mem(t1, save + 2 * 8));
        out.push(x86::mov_reg_to_mem(t2, save + 3 * 8));
        out.push(x86::mov_reg_to_mem(t3, save + 4 * 8));

        match mem {
            Some(m) => {
                match m.base {
                    MemBase::Gpr(base) => {
                        out.push(x86::mov_reg_to_reg(base, t1));
                        // The AX reload is configurable here: 32-bit
                        // tools may run with LAHF/SAHF disabled.
                        if base == REG_AX && light && self.ctx.reload_ax_32 {
                            out.push(x86::mov_mem_to_reg(save, t1));
                        }
                        out.push(x86::reg_add_imm(t1, m.disp as u64));
                    }
                    MemBase::Pc => {
                        out.push(x86::mov_imm_to_reg(insn.next_addr(), t1));
                        out.push(x86::reg_add_imm(t1, m.disp as u64));
                    }
                    MemBase::None => {
                        out.push(x86::mov_imm_to_reg(m.disp as u64, t1));
                    }
                }
                if let Some(index) = m.index {
                    out.push(x86::mov_reg_to_reg(index, t2));
                    if index == REG_AX && light && self.ctx.reload_ax_32 {
                        out.push(x86::mov_mem_to_reg(save, t2));
                    }
                    out.push(x86::reg_imm_mult_reg(t2, m.effective_scale(), t2));
                    out.push(x86::reg_add_reg(t2, t1));
                }
            }
            None => out.push(x86::mov_reg_to_reg(REG_SP, t1)),
        }

        if self.ctx.thread_keyed {
            out.push(gs_override(x86::mov_mem_to_reg(buffers.buffer_store, t2)));
            out.push(gs_override(x86::mov_mem_to_reg(buffers.cursor_store, t3)));
        } else {
            out.push(x86::mov_imm_to_reg(data + buffers.buffer_store, t2));
            out.push(x86::mov_mem_to_reg(data + buffers.cursor_store, t3));
        }

        out.push(x86::shift_left_logical(log2_entry, t3));
        out.push(x86::reg_add_reg(t3, t2));
        out.push(x86::shift_right_logical(log2_entry, t3));

        // The address field holds the 32-bit effective address in its
        // low half; ids land at their fixed offsets.
        out.push(x86::mov_reg_to_regaddr_imm(t1, t2, 2 * 4));
        out.push(x86::mov_imm_to_reg(block_id as u64, t1));
        out.push(x86::mov_reg_to_regaddr_imm(t1, t2, 0));
        out.push(x86::mov_imm_to_reg(memop_id as u64, t1));
        out.push(x86::mov_reg_to_regaddr_imm(t1, t2, 4));

        out.push(x86::reg_add_imm(t3, 1));
        if self.ctx.thread_keyed {
            out.push(gs_override(x86::mov_reg_to_mem(t3, buffers.cursor_store)));
        } else {
            out.push(x86::mov_reg_to_mem(t3, data + buffers.cursor_store));
        }
        out.push(x86::compare_imm_reg(buffers.entries as u64, t3));

        out.push(x86::mov_mem_to_reg(save + 4 * 8, t3));
        out.push(x86::mov_mem_to_reg(save + 3 * 8, t2));
        out.push(x86::mov_mem_to_reg(save + 2 * 8, t1));

        out.push(x86::branch_jl(call_support_size(false) as i32));

        Ok(out)
    }
}
