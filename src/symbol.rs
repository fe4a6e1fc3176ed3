//! Symbol tables and string tables.

use crate::ehdr::ElfClass;
use crate::error::{elf_malformed, Result};
use crate::section::SectionHeader;
use byteorder::{ByteOrder, LittleEndian};
use elf::abi::{STT_FUNC, STT_OBJECT};

use alloc::string::String;
use alloc::vec::Vec;

/// An owned string table. The rewrite appends tool-library names and
/// tool-function names, so the bytes are owned rather than borrowed
/// from the image buffer.
#[derive(Debug, Clone)]
pub struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        StringTable { bytes }
    }

    /// Resolves the NUL-terminated string at `offset`.
    pub fn get(&self, offset: usize) -> Result<&str> {
        let tail = self
            .bytes
            .get(offset..)
            .ok_or_else(|| elf_malformed("string-table offset out of bounds"))?;
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| elf_malformed("unterminated string-table entry"))?;
        core::str::from_utf8(&tail[..end])
            .map_err(|_| elf_malformed("non-UTF-8 string-table entry"))
    }

    /// Appends a string, returning its offset. Offsets already handed
    /// out remain valid.
    pub fn add(&mut self, s: &str) -> u32 {
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        off
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// One symbol, with its name resolved eagerly.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name_idx: u32,
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    /// Index within the owning table.
    pub index: usize,
}

impl Symbol {
    #[inline]
    pub fn st_type(&self) -> u8 {
        self.info & 0xf
    }

    #[inline]
    pub fn st_bind(&self) -> u8 {
        self.info >> 4
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        self.st_type() == STT_FUNC
    }

    /// True iff this is a function symbol whose value lies in `shdr`.
    pub fn is_function_symbol_of(&self, shdr: &SectionHeader) -> bool {
        self.is_function() && shdr.in_range(self.value)
    }

    /// True iff this is a non-function object symbol pointing into
    /// `shdr` (data embedded in text, jump-table islands, ...).
    pub fn is_text_object_symbol_of(&self, shdr: &SectionHeader) -> bool {
        self.st_type() == STT_OBJECT && shdr.in_range(self.value)
    }
}

/// A parsed symbol table (`.symtab` or `.dynsym`).
#[derive(Debug, Clone)]
pub struct SymbolTable {
    /// Section index of the table itself.
    pub section_index: usize,
    /// Section index of the associated string table.
    pub link: usize,
    pub symbols: Vec<Symbol>,
    pub is_dynamic: bool,
    class: ElfClass,
}

impl SymbolTable {
    pub(crate) fn parse(
        class: ElfClass,
        section_index: usize,
        link: usize,
        is_dynamic: bool,
        data: &[u8],
        entsize: usize,
        strtab: &StringTable,
    ) -> Result<Self> {
        if entsize < class.sym_size() {
            return Err(elf_malformed("symbol-table entry size too small"));
        }
        let count = data.len() / entsize;
        let mut symbols = Vec::with_capacity(count);
        for i in 0..count {
            let e = &data[i * entsize..];
            let sym = match class {
                ElfClass::Elf32 => Symbol {
                    name_idx: LittleEndian::read_u32(&e[0..]),
                    name: String::new(),
                    value: LittleEndian::read_u32(&e[4..]) as u64,
                    size: LittleEndian::read_u32(&e[8..]) as u64,
                    info: e[12],
                    other: e[13],
                    shndx: LittleEndian::read_u16(&e[14..]),
                    index: i,
                },
                ElfClass::Elf64 => Symbol {
                    name_idx: LittleEndian::read_u32(&e[0..]),
                    name: String::new(),
                    info: e[4],
                    other: e[5],
                    shndx: LittleEndian::read_u16(&e[6..]),
                    value: LittleEndian::read_u64(&e[8..]),
                    size: LittleEndian::read_u64(&e[16..]),
                    index: i,
                },
            };
            symbols.push(sym);
        }
        for sym in symbols.iter_mut() {
            sym.name = String::from(strtab.get(sym.name_idx as usize)?);
        }
        Ok(SymbolTable {
            section_index,
            link,
            symbols,
            is_dynamic,
            class,
        })
    }

    /// Serializes every entry back to native layout.
    pub fn serialize(&self) -> Vec<u8> {
        let esz = self.class.sym_size();
        let mut out = alloc::vec![0u8; esz * self.symbols.len()];
        for (i, sym) in self.symbols.iter().enumerate() {
            let e = &mut out[i * esz..];
            match self.class {
                ElfClass::Elf32 => {
                    LittleEndian::write_u32(&mut e[0..], sym.name_idx);
                    LittleEndian::write_u32(&mut e[4..], sym.value as u32);
                    LittleEndian::write_u32(&mut e[8..], sym.size as u32);
                    e[12] = sym.info;
                    e[13] = sym.other;
                    LittleEndian::write_u16(&mut e[14..], sym.shndx);
                }
                ElfClass::Elf64 => {
                    LittleEndian::write_u32(&mut e[0..], sym.name_idx);
                    e[4] = sym.info;
                    e[5] = sym.other;
                    LittleEndian::write_u16(&mut e[6..], sym.shndx);
                    LittleEndian::write_u64(&mut e[8..], sym.value);
                    LittleEndian::write_u64(&mut e[16..], sym.size);
                }
            }
        }
        out
    }

    /// Looks a symbol up by name.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    #[inline]
    pub fn count_syms(&self) -> usize {
        self.symbols.len()
    }
}
