//! The parsed ELF image.
//!
//! An [`ElfImage`] owns the input byte buffer and every typed view
//! built over it. Views reference each other by section index, never by
//! address or borrowed pointer; resolution always goes back through the
//! image. The image is constructed once from a file and mutated only by
//! the instrumentation engine's emit pass.

use crate::dynamic::DynamicTable;
use crate::ehdr::{ElfClass, FileHeader};
use crate::error::{elf_malformed, Result};
use crate::insn::DecodeMode;
use crate::relocation::RelocationTable;
use crate::section::SectionHeader;
use crate::segment::ProgramHeader;
use crate::symbol::{StringTable, SymbolTable};
use elf::abi::{SHT_DYNAMIC, SHT_DYNSYM, SHT_NOBITS, SHT_NOTE, SHT_NULL, SHT_REL, SHT_RELA,
               SHT_STRTAB, SHT_SYMTAB};

use alloc::string::String;
use alloc::vec::Vec;

/// The typed view over one section's bytes.
#[derive(Debug)]
pub enum RawSection {
    Null,
    /// Executable progbits; decoded further by the text-object builder.
    Text,
    SymTab(SymbolTable),
    StrTab(StringTable),
    Reloc(RelocationTable),
    Dynamic(DynamicTable),
    Note,
    NoBits,
    /// Anything else is carried opaquely and round-tripped verbatim.
    Other,
}

/// A parsed ELF image.
pub struct ElfImage {
    name: String,
    buffer: Vec<u8>,
    pub ehdr: FileHeader,
    pub shdrs: Vec<SectionHeader>,
    pub phdrs: Vec<ProgramHeader>,
    pub sections: Vec<RawSection>,
}

impl ElfImage {
    /// Reads and parses an ELF file.
    pub fn from_path(path: impl AsRef<str>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::parse(path.as_ref(), bytes)
    }

    /// Parses an image from an owned byte buffer.
    pub fn parse(name: &str, buffer: Vec<u8>) -> Result<Self> {
        let ehdr = FileHeader::parse(&buffer)?;
        let class = ehdr.class();

        let phdrs = Self::parse_phdrs(&ehdr, class, &buffer)?;
        let mut shdrs = Self::parse_shdrs(&ehdr, class, &buffer)?;

        // Resolve section names through the section-header string
        // table before building typed views.
        if !shdrs.is_empty() {
            let shstrndx = ehdr.e_shstrndx as usize;
            if shstrndx >= shdrs.len() {
                return Err(elf_malformed("section-header string-table index out of range"));
            }
            let shstr = section_bytes(&buffer, &shdrs[shstrndx])?.to_vec();
            let shstr = StringTable::new(shstr);
            for shdr in shdrs.iter_mut() {
                shdr.name = String::from(shstr.get(shdr.name_idx as usize)?);
            }
        }

        let sections = Self::build_views(class, &buffer, &shdrs)?;

        let image = ElfImage {
            name: String::from(name),
            buffer,
            ehdr,
            shdrs,
            phdrs,
            sections,
        };
        image.validate()?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Image] parsed {}: class: {:?}, sections: {}, segments: {}",
            image.name,
            image.ehdr.class(),
            image.shdrs.len(),
            image.phdrs.len()
        );
        Ok(image)
    }

    fn parse_phdrs(
        ehdr: &FileHeader,
        class: ElfClass,
        buffer: &[u8],
    ) -> Result<Vec<ProgramHeader>> {
        let count = ehdr.e_phnum as usize;
        let esz = ehdr.e_phentsize as usize;
        if count > 0 && esz < class.phdr_size() {
            return Err(elf_malformed("program-header entry size too small"));
        }
        let start = ehdr.e_phoff as usize;
        let end = start + count * esz;
        if end > buffer.len() {
            return Err(elf_malformed("program-header table outside file bounds"));
        }
        let mut phdrs = Vec::with_capacity(count);
        for i in 0..count {
            phdrs.push(ProgramHeader::parse(
                class,
                &buffer[start + i * esz..],
                i,
            ));
        }
        Ok(phdrs)
    }

    fn parse_shdrs(
        ehdr: &FileHeader,
        class: ElfClass,
        buffer: &[u8],
    ) -> Result<Vec<SectionHeader>> {
        let count = ehdr.e_shnum as usize;
        let esz = ehdr.e_shentsize as usize;
        if count > 0 && esz < class.shdr_size() {
            return Err(elf_malformed("section-header entry size too small"));
        }
        let start = ehdr.e_shoff as usize;
        let end = start + count * esz;
        if end > buffer.len() {
            return Err(elf_malformed("section-header table outside file bounds"));
        }
        let mut shdrs = Vec::with_capacity(count);
        for i in 0..count {
            shdrs.push(SectionHeader::parse(
                class,
                &buffer[start + i * esz..],
                i,
            ));
        }
        Ok(shdrs)
    }

    fn build_views(
        class: ElfClass,
        buffer: &[u8],
        shdrs: &[SectionHeader],
    ) -> Result<Vec<RawSection>> {
        let mut sections = Vec::with_capacity(shdrs.len());
        for shdr in shdrs {
            let view = match shdr.sh_type {
                SHT_NULL => RawSection::Null,
                SHT_NOBITS => RawSection::NoBits,
                SHT_NOTE => RawSection::Note,
                SHT_STRTAB => {
                    RawSection::StrTab(StringTable::new(section_bytes(buffer, shdr)?.to_vec()))
                }
                SHT_SYMTAB | SHT_DYNSYM => {
                    let link = shdr.link as usize;
                    let str_shdr = shdrs
                        .get(link)
                        .filter(|s| s.sh_type == SHT_STRTAB)
                        .ok_or_else(|| {
                            elf_malformed("symbol table does not link to a string table")
                        })?;
                    let strtab = StringTable::new(section_bytes(buffer, str_shdr)?.to_vec());
                    RawSection::SymTab(SymbolTable::parse(
                        class,
                        shdr.index,
                        link,
                        shdr.sh_type == SHT_DYNSYM,
                        section_bytes(buffer, shdr)?,
                        if shdr.entsize != 0 {
                            shdr.entsize as usize
                        } else {
                            class.sym_size()
                        },
                        &strtab,
                    )?)
                }
                SHT_REL | SHT_RELA => {
                    let link = shdr.link as usize;
                    let target = shdr.info as usize;
                    if link >= shdrs.len() {
                        return Err(elf_malformed("relocation table links to a missing section"));
                    }
                    if target >= shdrs.len() {
                        return Err(elf_malformed(
                            "relocation table targets a missing section",
                        ));
                    }
                    RawSection::Reloc(RelocationTable::parse(
                        class,
                        shdr.index,
                        link,
                        target,
                        shdr.sh_type == SHT_RELA,
                        section_bytes(buffer, shdr)?,
                    )?)
                }
                SHT_DYNAMIC => RawSection::Dynamic(DynamicTable::parse(
                    class,
                    shdr.index,
                    shdr.link as usize,
                    section_bytes(buffer, shdr)?,
                )?),
                _ if shdr.is_text() => RawSection::Text,
                _ => RawSection::Other,
            };
            sections.push(view);
        }
        Ok(sections)
    }

    fn validate(&self) -> Result<()> {
        for shdr in &self.shdrs {
            if shdr.is_nobits() || shdr.is_null() {
                continue;
            }
            match shdr.offset.checked_add(shdr.size) {
                Some(end) if end as usize <= self.buffer.len() => {}
                _ => return Err(elf_malformed("section extends past the end of the file")),
            }
        }
        for section in &self.sections {
            if let RawSection::Reloc(table) = section {
                if !matches!(
                    self.sections.get(table.symtab_link),
                    Some(RawSection::SymTab(_)) | Some(RawSection::Null)
                ) {
                    return Err(elf_malformed(
                        "relocation table does not link to a symbol table",
                    ));
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn class(&self) -> ElfClass {
        self.ehdr.class()
    }

    /// The decode mode matching the image's class.
    #[inline]
    pub fn decode_mode(&self) -> DecodeMode {
        match self.class() {
            ElfClass::Elf32 => DecodeMode::Mode32,
            ElfClass::Elf64 => DecodeMode::Mode64,
        }
    }

    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// The raw bytes of section `idx`.
    pub fn section_data(&self, idx: usize) -> Result<&[u8]> {
        let shdr = self
            .shdrs
            .get(idx)
            .ok_or_else(|| elf_malformed("section index out of range"))?;
        section_bytes(&self.buffer, shdr)
    }

    /// Indices of all executable progbits sections.
    pub fn text_section_indices(&self) -> Vec<usize> {
        self.shdrs
            .iter()
            .filter(|s| s.is_text())
            .map(|s| s.index)
            .collect()
    }

    /// All non-dynamic symbol tables.
    pub fn symtabs(&self) -> impl Iterator<Item = &SymbolTable> {
        self.sections.iter().filter_map(|s| match s {
            RawSection::SymTab(t) if !t.is_dynamic => Some(t),
            _ => None,
        })
    }

    /// The dynamic symbol table, if any.
    pub fn dynsym(&self) -> Option<&SymbolTable> {
        self.sections.iter().find_map(|s| match s {
            RawSection::SymTab(t) if t.is_dynamic => Some(t),
            _ => None,
        })
    }

    /// The dynamic table, if any.
    pub fn dynamic(&self) -> Option<&DynamicTable> {
        self.sections.iter().find_map(|s| match s {
            RawSection::Dynamic(t) => Some(t),
            _ => None,
        })
    }

    /// Section index of the dynamic table, if any.
    pub fn dynamic_section_index(&self) -> Option<usize> {
        self.sections.iter().position(|s| matches!(s, RawSection::Dynamic(_)))
    }

    /// Highest end address of any load segment.
    pub fn max_load_vaddr(&self) -> u64 {
        self.phdrs
            .iter()
            .filter(|p| p.is_load())
            .map(|p| p.end_vaddr())
            .max()
            .unwrap_or(0)
    }

    /// Re-emits the image.
    ///
    /// The untouched regions come straight from the input buffer; the
    /// parsed headers are re-serialized over their recorded offsets, so
    /// an unmodified image dumps byte-identical to its input.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = self.buffer.clone();
        self.ehdr.dump(&mut out);
        let esz = self.ehdr.e_phentsize as usize;
        for (i, phdr) in self.phdrs.iter().enumerate() {
            let off = self.ehdr.e_phoff as usize + i * esz;
            phdr.dump(&mut out[off..]);
        }
        let esz = self.ehdr.e_shentsize as usize;
        for (i, shdr) in self.shdrs.iter().enumerate() {
            let off = self.ehdr.e_shoff as usize + i * esz;
            shdr.dump(&mut out[off..]);
        }
        out
    }
}

fn section_bytes<'b>(buffer: &'b [u8], shdr: &SectionHeader) -> Result<&'b [u8]> {
    if shdr.is_nobits() || shdr.is_null() {
        return Ok(&[]);
    }
    let start = shdr.offset as usize;
    let end = start
        .checked_add(shdr.size as usize)
        .ok_or_else(|| elf_malformed("section size overflows"))?;
    buffer
        .get(start..end)
        .ok_or_else(|| elf_malformed("section extends past the end of the file"))
}
