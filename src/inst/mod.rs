//! The instrumentation engine.
//!
//! Rewriting is phased: `Declare` (tool libraries and functions) →
//! `UserReserve` (instrumentation points and reserved-data layout) →
//! `Emit` (trampoline layout and final ELF emission). Operations are
//! gated on their phase and fail with [`crate::Error::WrongPhase`]
//! outside it; phase misuse is a bug in the calling tool, never in
//! the input binary.

mod addrcalc;
mod emit;
pub mod thread;
mod trampoline;

pub use addrcalc::{wrap_cursor, BufferSpec};

use crate::error::{
    logic_error, reserved_exhausted, symbol_resolve_error, wrong_phase, Result,
};
use crate::image::ElfImage;
use crate::insn::Instruction;
use crate::text::{TextObject, TextSection};

use alloc::string::String;
use alloc::vec::Vec;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

/// Hard cap on the reserved data arena.
pub const RESERVED_DATA_CAP: u64 = 16 * 1024 * 1024;

/// Bytes per buffer entry: `blockId:u32`, `memopId:u32`, `address:u64`.
pub const BUFFER_ENTRY_SIZE: u32 = 16;

/// Default circular-buffer length; must stay a power of two.
pub const DEFAULT_BUFFER_ENTRIES: u32 = 0x0001_0000;

/// Register-save slots at the base of the arena. Slot 0 is the AX home
/// under light flags protection; slots 2..=4 hold the address-calc
/// temporaries; the tail is used by the call-support block.
pub(crate) const REG_SAVE_SLOTS: u64 = 16;

/// Engine phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Declare,
    UserReserve,
    Emit,
}

/// How a point is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstMode {
    /// Replace the target with a long jump to a trampoline that always
    /// calls the tool function. A trailing buffer-guard branch in the
    /// precursor list is dropped: nothing skips the call.
    Tramp,
    /// Overwrite the displaced range with the precursors themselves
    /// followed by the long jump, so the buffer-not-full fast path
    /// never reaches the call-support block. Sites too narrow to hold
    /// the precursors fall back to running them at the head of the
    /// trampoline, with the guard branch skipping the call-support
    /// block there.
    TrampInline,
}

/// How trampolines preserve the flags register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsProtectionMethod {
    /// `pushf`/`popf`.
    Full,
    /// `lahf`/`sahf` with AX spilled to its fixed slot.
    Light,
}

/// Explicit per-rewrite configuration; captured at entry and passed
/// through instead of process globals.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub task_id: u32,
    pub app_name: String,
    pub phase_id: u32,
    pub flags_protection: FlagsProtectionMethod,
    /// Key buffer and cursor accesses through the GS-based per-thread
    /// block instead of the global slots.
    pub thread_keyed: bool,
    /// Emit the AX reload in the 32-bit address-calculation path under
    /// light flags protection.
    pub reload_ax_32: bool,
    pub buffer_entries: u32,
}

impl Default for RewriteContext {
    fn default() -> Self {
        RewriteContext {
            task_id: 0,
            app_name: String::new(),
            phase_id: 0,
            flags_protection: FlagsProtectionMethod::Full,
            thread_keyed: false,
            reload_ax_32: false,
            buffer_entries: DEFAULT_BUFFER_ENTRIES,
        }
    }
}

/// Handle to a declared tool function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolFunction(pub(crate) usize);

#[derive(Debug)]
pub(crate) struct ToolFunctionInfo {
    pub(crate) name: String,
    /// Arena offset of the 8-byte address slot the dynamic linker
    /// fills at load time.
    pub(crate) slot_offset: u64,
}

/// One instrumentation point, frozen at the end of the user-reserve
/// phase and consumed by the emitter.
#[derive(Debug)]
pub struct InstPoint {
    pub target_addr: u64,
    pub tool_fn: ToolFunction,
    pub mode: InstMode,
    pub(crate) precursors: Vec<Instruction>,
    /// Trampoline base; assigned during emit layout.
    pub inst_base_addr: u64,
}

impl InstPoint {
    /// Appends an engine-generated precursor instruction.
    pub fn add_precursor(&mut self, insn: Instruction) {
        self.precursors.push(insn);
    }

    pub fn add_precursors(&mut self, insns: impl IntoIterator<Item = Instruction>) {
        self.precursors.extend(insns);
    }

    #[inline]
    pub fn precursor_count(&self) -> usize {
        self.precursors.len()
    }
}

/// A probe-eligible memory operation, with the ids the buffer entry
/// will carry.
#[derive(Debug, Clone, Copy)]
pub struct ExposedMemOp {
    pub block_id: u32,
    pub memop_id: u32,
    pub addr: u64,
}

/// The instrumentation engine over one parsed image.
pub struct Instrumentor {
    pub(crate) image: ElfImage,
    pub(crate) texts: Vec<TextSection>,
    pub(crate) ctx: RewriteContext,
    phase: Phase,
    pub(crate) libraries: Vec<String>,
    pub(crate) tool_fns: Vec<ToolFunctionInfo>,
    pub(crate) points: Vec<InstPoint>,
    reserved_cursor: u64,
    pub(crate) reserved_inits: Vec<(u64, Vec<u8>)>,
    pub(crate) reg_save_offset: u64,
    thread_table_offset: Option<u64>,
    /// Base virtual address of the reserved data segment.
    pub(crate) data_base: u64,
    /// Base virtual address of the trampoline code segment.
    pub(crate) code_base: u64,
}

impl Instrumentor {
    /// Builds the engine: discovers and digests every text section and
    /// places the reserved code/data regions above the image.
    pub fn new(image: ElfImage, ctx: RewriteContext) -> Result<Self> {
        if image.ehdr.is_dylib() {
            return Err(logic_error(
                "position-independent executables cannot take absolute-address probes",
            ));
        }
        if !ctx.buffer_entries.is_power_of_two() {
            return Err(logic_error("buffer length must be a power of two"));
        }

        let mut texts = Vec::new();
        for idx in image.text_section_indices() {
            let mut section = TextSection::discover(&image, idx)?;
            section.digest(&image)?;
            texts.push(section);
        }

        let data_base = (image.max_load_vaddr() + PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let code_base = data_base + RESERVED_DATA_CAP;
        // Absolute-address encodings (disp32, sign-extended in 64-bit
        // mode) must reach the arena.
        if code_base + RESERVED_DATA_CAP >= 1 << 31 {
            return Err(reserved_exhausted(
                "image too large to place reserved data below 2 GiB",
            ));
        }

        let mut engine = Instrumentor {
            image,
            texts,
            ctx,
            phase: Phase::Declare,
            libraries: Vec::new(),
            tool_fns: Vec::new(),
            points: Vec::new(),
            reserved_cursor: 0,
            reserved_inits: Vec::new(),
            reg_save_offset: 0,
            thread_table_offset: None,
            data_base,
            code_base,
        };
        engine.reg_save_offset = engine.reserve_raw(REG_SAVE_SLOTS * 8)?;
        if engine.ctx.thread_keyed {
            let table = engine
                .reserve_raw(thread::THREAD_TABLE_SLOTS * thread::THREAD_SLOT_SIZE)?;
            engine.thread_table_offset = Some(table);
        }
        Ok(engine)
    }

    fn gate(&self, want: Phase, what: &str) -> Result<()> {
        if self.phase == want {
            Ok(())
        } else {
            Err(wrong_phase(alloc::format!(
                "{what} is a {want:?}-phase operation, current phase is {:?}",
                self.phase
            )))
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn image(&self) -> &ElfImage {
        &self.image
    }

    #[inline]
    pub fn text_sections(&self) -> &[TextSection] {
        &self.texts
    }

    /// Base virtual address of the reserved data arena.
    #[inline]
    pub fn inst_data_address(&self) -> u64 {
        self.data_base
    }

    /// Arena offset of the register-save area.
    #[inline]
    pub fn reg_storage_offset(&self) -> u64 {
        self.reg_save_offset
    }

    /// Arena offset of the per-thread slot table, when thread keying
    /// is on.
    #[inline]
    pub fn thread_table_offset(&self) -> Option<u64> {
        self.thread_table_offset
    }

    /// Registers a shared library the instrumented binary must load.
    pub fn declare_library(&mut self, name: &str) -> Result<()> {
        self.gate(Phase::Declare, "declare_library")?;
        if self.image.dynamic().is_none() {
            return Err(symbol_resolve_error(
                "cannot add a needed library to a static binary",
            ));
        }
        self.libraries.push(String::from(name));
        Ok(())
    }

    /// Declares a tool-exported function and reserves the address slot
    /// the host dynamic linker will fill at load time.
    pub fn declare_function(&mut self, name: &str) -> Result<ToolFunction> {
        self.gate(Phase::Declare, "declare_function")?;
        if self.image.dynamic().is_none() {
            return Err(symbol_resolve_error(
                "cannot import a tool function into a static binary",
            ));
        }
        let slot_offset = self.reserve_raw(8)?;
        self.tool_fns.push(ToolFunctionInfo {
            name: String::from(name),
            slot_offset,
        });
        Ok(ToolFunction(self.tool_fns.len() - 1))
    }

    /// Closes the declare phase.
    pub fn finish_declare(&mut self) -> Result<()> {
        self.gate(Phase::Declare, "finish_declare")?;
        self.phase = Phase::UserReserve;
        Ok(())
    }

    /// Grows the reserved data arena by `n` bytes, returning the
    /// stable offset of the new region. Offsets are never reused;
    /// `inst_data_address() + offset` is the absolute address after
    /// layout.
    pub fn reserve_data_offset(&mut self, n: u64) -> Result<u64> {
        self.gate(Phase::UserReserve, "reserve_data_offset")?;
        self.reserve_raw(n)
    }

    fn reserve_raw(&mut self, n: u64) -> Result<u64> {
        let offset = self.reserved_cursor;
        let end = offset
            .checked_add(n)
            .ok_or_else(|| reserved_exhausted("reservation size overflows"))?;
        if end > RESERVED_DATA_CAP {
            return Err(reserved_exhausted(alloc::format!(
                "reserving {n} bytes at offset {offset:#x} exceeds the arena cap"
            )));
        }
        // 8-byte slot granularity keeps every handed-out offset
        // naturally aligned.
        self.reserved_cursor = end.next_multiple_of(8);
        Ok(offset)
    }

    /// Records initial bytes for a reserved region; everything not
    /// initialized is zero at load time.
    pub fn initialize_reserved_data(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.gate(Phase::UserReserve, "initialize_reserved_data")?;
        if offset + bytes.len() as u64 > self.reserved_cursor {
            return Err(logic_error(
                "initializing reserved data outside any reservation",
            ));
        }
        self.reserved_inits.push((offset, bytes.to_vec()));
        Ok(())
    }

    /// Total bytes reserved so far.
    #[inline]
    pub fn reserved_extent(&self) -> u64 {
        self.reserved_cursor
    }

    /// Writes the comment record tools use to find their output:
    /// `"<appName> <phaseId> <extension> <exposedBlockCount> <dumpCode>"`.
    pub fn write_comment_block(&mut self, extension: &str, dump_code: u32) -> Result<u64> {
        self.gate(Phase::UserReserve, "write_comment_block")?;
        let comment = alloc::format!(
            "{} {} {} {} {}",
            self.ctx.app_name,
            self.ctx.phase_id,
            extension,
            self.exposed_basic_block_count(),
            dump_code
        );
        let mut bytes = comment.into_bytes();
        bytes.push(0);
        let offset = self.reserve_raw(bytes.len() as u64)?;
        self.reserved_inits.push((offset, bytes));
        Ok(offset)
    }

    /// Number of blocks eligible for instrumentation.
    pub fn exposed_basic_block_count(&self) -> usize {
        self.exposed_blocks_impl().count()
    }

    fn exposed_blocks_impl(&self) -> impl Iterator<Item = &crate::cfg::BasicBlock> {
        self.texts
            .iter()
            .flat_map(|t| t.objects.iter())
            .filter_map(|o| match o {
                TextObject::Function(f) => f.flow_graph(),
                _ => None,
            })
            .flat_map(|g| g.blocks.iter())
            .filter(|b| !b.non_instrumentable)
    }

    /// Every probe-eligible memory operation, with block and memop ids
    /// assigned in block order.
    pub fn exposed_memory_ops(&self) -> Vec<ExposedMemOp> {
        let mut ops = Vec::new();
        let mut memop_id = 0u32;
        for (block_id, block) in self.exposed_blocks_impl().enumerate() {
            for insn in block.instructions() {
                if insn.is_memory_operation() {
                    ops.push(ExposedMemOp {
                        block_id: block_id as u32,
                        memop_id,
                        addr: insn.addr(),
                    });
                    memop_id += 1;
                }
            }
        }
        ops
    }

    /// The decoded instruction at `addr`, if the address starts one.
    pub fn instruction_at_addr(&self, addr: u64) -> Option<&Instruction> {
        self.texts.iter().find_map(|t| t.instruction_at_addr(addr))
    }

    /// Appends an instrumentation point at `addr`.
    pub fn add_point(
        &mut self,
        addr: u64,
        tool_fn: ToolFunction,
        mode: InstMode,
    ) -> Result<usize> {
        self.gate(Phase::UserReserve, "add_point")?;
        if tool_fn.0 >= self.tool_fns.len() {
            return Err(symbol_resolve_error("unknown tool function"));
        }
        let eligible = self.texts.iter().any(|t| match t.object_at_addr(addr) {
            Some(TextObject::Function(f)) => f
                .flow_graph()
                .and_then(|g| g.block_at_addr(addr))
                .map(|b| !b.non_instrumentable)
                .unwrap_or(false),
            _ => false,
        });
        if !eligible {
            return Err(logic_error(alloc::format!(
                "address {addr:#x} is not instrumentable"
            )));
        }
        if self.instruction_at_addr(addr).is_none() {
            return Err(logic_error(alloc::format!(
                "address {addr:#x} does not start an instruction"
            )));
        }
        self.points.push(InstPoint {
            target_addr: addr,
            tool_fn,
            mode,
            precursors: Vec::new(),
            inst_base_addr: 0,
        });
        #[cfg(feature = "log")]
        log::trace!("[Inst] point at {addr:#x}, mode: {mode:?}");
        Ok(self.points.len() - 1)
    }

    /// Mutable access to a point for precursor attachment.
    pub fn point_mut(&mut self, idx: usize) -> Option<&mut InstPoint> {
        self.points.get_mut(idx)
    }

    #[inline]
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Freezes the point table and emits the rewritten ELF.
    ///
    /// With nothing declared and no points, the output is the input,
    /// byte for byte.
    pub fn emit(mut self) -> Result<Vec<u8>> {
        self.gate(Phase::UserReserve, "emit")?;
        self.phase = Phase::Emit;
        emit::emit(self)
    }
}
