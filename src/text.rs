//! Text-object discovery.
//!
//! Each executable section is partitioned into *text objects*: the
//! functions and free-text regions delimited by the symbols that point
//! into it. Symbol sizes under-report routinely, so an object's size is
//! the larger of the symbol's declared size and the gap to the next
//! text symbol.

use crate::cfg::{self, CodeBlock, FlowGraph};
use crate::error::{cfg_error, Result};
use crate::image::ElfImage;
use crate::insn::Instruction;
use delegate::delegate;

use alloc::string::String;
use alloc::vec::Vec;

/// State shared by both text-object variants.
#[derive(Debug, Clone)]
pub struct TextObjectCore {
    /// Owning text section.
    pub section_index: usize,
    /// Position within the section's sorted object list.
    pub index: usize,
    /// Name of the defining symbol, if the object has one.
    pub symbol_name: Option<String>,
    base: u64,
    size: u64,
}

impl TextObjectCore {
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn size_in_bytes(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn in_range(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    pub fn name(&self) -> &str {
        self.symbol_name.as_deref().unwrap_or("<anonymous>")
    }
}

/// A function: a symbol-defined region that gets a flow graph.
#[derive(Debug)]
pub struct Function {
    core: TextObjectCore,
    cfg: Option<FlowGraph>,
}

impl Function {
    delegate! {
        to self.core {
            pub fn base_addr(&self) -> u64;
            pub fn size_in_bytes(&self) -> u64;
            pub fn in_range(&self, addr: u64) -> bool;
            pub fn name(&self) -> &str;
        }
    }

    /// The flow graph; present once the section has been digested.
    pub fn flow_graph(&self) -> Option<&FlowGraph> {
        self.cfg.as_ref()
    }
}

/// A free-text region: either decodable instructions with no CFG (a
/// `.plt`, typically) or opaque raw bytes (data islands in text).
#[derive(Debug)]
pub struct FreeText {
    core: TextObjectCore,
    /// Whether the region holds instructions at all.
    pub uses_instructions: bool,
    block: Option<CodeBlock>,
}

impl FreeText {
    delegate! {
        to self.core {
            pub fn base_addr(&self) -> u64;
            pub fn size_in_bytes(&self) -> u64;
            pub fn in_range(&self, addr: u64) -> bool;
            pub fn name(&self) -> &str;
        }
    }

    /// The decoded block, when `uses_instructions` and digestion
    /// succeeded.
    pub fn code_block(&self) -> Option<&CodeBlock> {
        self.block.as_ref()
    }
}

/// A text object is a function or a free-text region.
#[derive(Debug)]
pub enum TextObject {
    Function(Function),
    FreeText(FreeText),
}

impl TextObject {
    fn core(&self) -> &TextObjectCore {
        match self {
            TextObject::Function(f) => &f.core,
            TextObject::FreeText(t) => &t.core,
        }
    }

    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.core().base_addr()
    }

    #[inline]
    pub fn size_in_bytes(&self) -> u64 {
        self.core().size_in_bytes()
    }

    #[inline]
    pub fn in_range(&self, addr: u64) -> bool {
        self.core().in_range(addr)
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.core().name()
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(self, TextObject::Function(_))
    }

    pub fn instruction_count(&self) -> usize {
        match self {
            TextObject::Function(f) => f.cfg.as_ref().map(|g| g.instruction_count()).unwrap_or(0),
            TextObject::FreeText(t) => {
                t.block.as_ref().map(|b| b.instruction_count()).unwrap_or(0)
            }
        }
    }
}

/// The text objects of one executable section, sorted by base address.
#[derive(Debug)]
pub struct TextSection {
    pub section_index: usize,
    pub objects: Vec<TextObject>,
}

/// A symbol picked up by the discovery sweep.
#[derive(Debug, Clone)]
struct TextSymbol {
    name: String,
    value: u64,
    size: u64,
    is_function: bool,
}

impl TextSection {
    /// Discovers the text objects of section `section_index`.
    ///
    /// Symbols come from every non-dynamic symbol table. Symbols at
    /// equal values collapse to the first; a section with no text
    /// symbols (typical for `.plt`) becomes one instruction-bearing
    /// free-text object spanning the section.
    pub fn discover(image: &ElfImage, section_index: usize) -> Result<TextSection> {
        let shdr = &image.shdrs[section_index];

        let mut text_symbols: Vec<TextSymbol> = Vec::new();
        for table in image.symtabs() {
            for sym in &table.symbols {
                if sym.is_function_symbol_of(shdr) || sym.is_text_object_symbol_of(shdr) {
                    text_symbols.push(TextSymbol {
                        name: sym.name.clone(),
                        value: sym.value,
                        size: sym.size,
                        is_function: sym.is_function(),
                    });
                }
            }
        }
        text_symbols.sort_by_key(|s| s.value);
        text_symbols.dedup_by_key(|s| s.value);

        let mut objects: Vec<TextObject> = Vec::new();
        if text_symbols.is_empty() {
            objects.push(TextObject::FreeText(FreeText {
                core: TextObjectCore {
                    section_index,
                    index: 0,
                    symbol_name: None,
                    base: shdr.addr,
                    size: shdr.size,
                },
                uses_instructions: true,
                block: None,
            }));
        } else {
            for (i, sym) in text_symbols.iter().enumerate() {
                // The larger of the declared size and the gap to the
                // next symbol (section end for the last); declared
                // sizes beyond the whole section are garbage.
                let gap = match text_symbols.get(i + 1) {
                    Some(next) => next.value - sym.value,
                    None => shdr.end_addr() - sym.value,
                };
                let mut size = gap;
                if sym.size > size && sym.size <= shdr.size {
                    size = sym.size;
                }
                let core = TextObjectCore {
                    section_index,
                    index: i,
                    symbol_name: Some(sym.name.clone()),
                    base: sym.value,
                    size,
                };
                objects.push(if sym.is_function {
                    TextObject::Function(Function { core, cfg: None })
                } else {
                    TextObject::FreeText(FreeText {
                        core,
                        uses_instructions: false,
                        block: None,
                    })
                });
            }
        }

        let section = TextSection {
            section_index,
            objects,
        };
        section.verify(image)?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Section] {}: {} text objects",
            shdr.name,
            section.objects.len()
        );
        Ok(section)
    }

    /// Decodes every object: functions get flow graphs, free text gets
    /// a single code block (or stays raw when it does not decode).
    pub fn digest(&mut self, image: &ElfImage) -> Result<()> {
        let mode = image.decode_mode();
        let shdr = &image.shdrs[self.section_index];
        let data = image.section_data(self.section_index)?;
        for object in self.objects.iter_mut() {
            let start = (object.base_addr() - shdr.addr) as usize;
            let size = object.size_in_bytes() as usize;
            let bytes = &data[start..];
            match object {
                TextObject::Function(f) => {
                    let base = f.core.base;
                    f.cfg = Some(cfg::build_flow_graph(mode, base, bytes, size)?);
                }
                TextObject::FreeText(t) if t.uses_instructions => {
                    let base = t.core.base;
                    match cfg::digest_linear(mode, base, bytes, size) {
                        Ok((insns, _overrun)) => {
                            t.block = Some(CodeBlock::new(base, insns));
                        }
                        Err(_err) => {
                            // Free text that does not decode stays raw.
                            #[cfg(feature = "log")]
                            log::warn!(
                                "[Disasm] free text at {base:#x} does not decode ({_err}), keeping raw"
                            );
                            t.uses_instructions = false;
                        }
                    }
                }
                TextObject::FreeText(_) => {}
            }
        }
        Ok(())
    }

    /// Post-discovery invariants: objects sorted by base, contained in
    /// the section (the last may end exactly at the section end), and
    /// the first starting at the section base.
    pub fn verify(&self, image: &ElfImage) -> Result<()> {
        let shdr = &image.shdrs[self.section_index];
        for object in &self.objects {
            let entry = object.base_addr();
            let exit = entry + object.size_in_bytes();
            if !shdr.in_range(entry) {
                return Err(cfg_error(alloc::format!(
                    "text object entry {entry:#x} outside section {}",
                    self.section_index
                )));
            }
            if !shdr.in_range(exit) && exit != shdr.end_addr() {
                return Err(cfg_error(alloc::format!(
                    "text object exit {exit:#x} outside section {}",
                    self.section_index
                )));
            }
        }
        for pair in self.objects.windows(2) {
            if pair[0].base_addr() > pair[1].base_addr() {
                return Err(cfg_error("text objects not sorted by base address"));
            }
        }
        if let Some(first) = self.objects.first() {
            if first.base_addr() != shdr.addr {
                return Err(cfg_error(
                    "first text object does not start at the section base",
                ));
            }
        }
        Ok(())
    }

    pub fn object_at_addr(&self, addr: u64) -> Option<&TextObject> {
        self.objects.iter().find(|o| o.in_range(addr))
    }

    /// The decoded instruction starting at `addr`, if any.
    pub fn instruction_at_addr(&self, addr: u64) -> Option<&Instruction> {
        match self.object_at_addr(addr)? {
            TextObject::Function(f) => f.flow_graph()?.instruction_at_addr(addr),
            TextObject::FreeText(t) => t
                .code_block()?
                .instructions()
                .iter()
                .find(|i| i.addr() == addr),
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.objects.iter().map(|o| o.instruction_count()).sum()
    }

    pub fn basic_block_count(&self) -> usize {
        self.objects
            .iter()
            .filter_map(|o| match o {
                TextObject::Function(f) => f.flow_graph().map(|g| g.basic_block_count()),
                _ => None,
            })
            .sum()
    }

    pub fn memory_op_count(&self) -> usize {
        self.objects
            .iter()
            .filter_map(|o| match o {
                TextObject::Function(f) => f.flow_graph().map(|g| g.memory_op_count()),
                _ => None,
            })
            .sum()
    }
}
