//! Static instrumentation for x86/x86-64 ELF executables.
//!
//! The crate rewrites binaries offline: it parses an ELF image, rebuilds
//! functions and control-flow graphs from the machine code, lets a tool
//! plant instrumentation points (e.g. a cache-simulation probe at every
//! memory-referencing instruction), and emits a new ELF whose original
//! code jumps out to generated trampolines and back. The original file
//! is never modified; an image rewritten with nothing planted is
//! byte-identical to its input.
//!
//! The pipeline is strictly layered:
//!
//! 1. [`ElfImage`]: sections, symbols, relocations, dynamic entries,
//!    with bit-exact re-serialization.
//! 2. [`disasm`]: length-true decoding into [`insn::Instruction`]s.
//! 3. [`text`]: partitioning executable sections into functions and
//!    free-text regions.
//! 4. [`cfg`]: basic blocks and natural loops.
//! 5. [`inst`]: the instrumentation engine (declare, user-reserve,
//!    emit).
//! 6. [`codegen`]: the instruction builders the engine plants.
//!
//! # Example
//!
//! ```no_run
//! use elf_rewriter::{ElfImage, InstMode, Instrumentor, RewriteContext};
//!
//! # fn main() -> elf_rewriter::Result<()> {
//! let image = ElfImage::from_path("a.out")?;
//! let mut engine = Instrumentor::new(image, RewriteContext::default())?;
//! engine.declare_library("libsimulator.so")?;
//! let probe = engine.declare_function("sim_buffer_full")?;
//! engine.finish_declare()?;
//! for op in engine.exposed_memory_ops() {
//!     engine.add_point(op.addr, probe, InstMode::TrampInline)?;
//! }
//! let rewritten = engine.emit()?;
//! std::fs::write("a.inst", rewritten)?;
//! # Ok(())
//! # }
//! ```

extern crate alloc;

pub mod cfg;
pub mod codegen;
pub mod disasm;
mod dynamic;
mod ehdr;
mod error;
mod image;
pub mod insn;
pub mod inst;
mod macros;
mod relocation;
mod section;
mod segment;
mod symbol;
pub mod text;

pub use dynamic::{DynEntry, DynamicTable};
pub use ehdr::{ElfClass, FileHeader};
pub use error::{Error, Result};
pub use image::{ElfImage, RawSection};
pub use inst::{
    BufferSpec, ExposedMemOp, FlagsProtectionMethod, InstMode, InstPoint, Instrumentor, Phase,
    RewriteContext, ToolFunction, BUFFER_ENTRY_SIZE, DEFAULT_BUFFER_ENTRIES, RESERVED_DATA_CAP,
};
pub use relocation::{RelocEntry, RelocationTable};
pub use section::SectionHeader;
pub use segment::ProgramHeader;
pub use symbol::{StringTable, Symbol, SymbolTable};
