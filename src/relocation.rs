//! Relocation entries and tables.
//!
//! The four wire formats ({REL,RELA} × {32,64}) are one tagged variant
//! with a uniform accessor surface; nothing downstream branches on the
//! format except the serializer.

use crate::ehdr::ElfClass;
use crate::error::{elf_malformed, Result};
use byteorder::{ByteOrder, LittleEndian};

use alloc::vec::Vec;

/// One relocation in its native width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocEntry {
    Rel32 { offset: u32, info: u32 },
    Rela32 { offset: u32, info: u32, addend: i32 },
    Rel64 { offset: u64, info: u64 },
    Rela64 { offset: u64, info: u64, addend: i64 },
}

impl RelocEntry {
    /// The location the relocation patches.
    #[inline]
    pub fn r_offset(&self) -> u64 {
        match self {
            RelocEntry::Rel32 { offset, .. } | RelocEntry::Rela32 { offset, .. } => *offset as u64,
            RelocEntry::Rel64 { offset, .. } | RelocEntry::Rela64 { offset, .. } => *offset,
        }
    }

    /// The symbol-table index extracted from the packed info field.
    #[inline]
    pub fn r_sym(&self) -> u32 {
        match self {
            RelocEntry::Rel32 { info, .. } | RelocEntry::Rela32 { info, .. } => info >> 8,
            RelocEntry::Rel64 { info, .. } | RelocEntry::Rela64 { info, .. } => (info >> 32) as u32,
        }
    }

    /// The relocation type extracted from the packed info field.
    #[inline]
    pub fn r_type(&self) -> u32 {
        match self {
            RelocEntry::Rel32 { info, .. } | RelocEntry::Rela32 { info, .. } => info & 0xff,
            RelocEntry::Rel64 { info, .. } | RelocEntry::Rela64 { info, .. } => {
                (info & 0xffff_ffff) as u32
            }
        }
    }

    /// The addend; zero for the REL variants.
    #[inline]
    pub fn r_addend(&self) -> i64 {
        match self {
            RelocEntry::Rela32 { addend, .. } => *addend as i64,
            RelocEntry::Rela64 { addend, .. } => *addend,
            _ => 0,
        }
    }

    /// Moves the patched location, preserving symbol and type.
    pub fn set_offset(&mut self, new_offset: u64) {
        match self {
            RelocEntry::Rel32 { offset, .. } | RelocEntry::Rela32 { offset, .. } => {
                *offset = new_offset as u32;
            }
            RelocEntry::Rel64 { offset, .. } | RelocEntry::Rela64 { offset, .. } => {
                *offset = new_offset;
            }
        }
    }

    /// Builds a RELA entry in the image's native width.
    pub fn new_rela(class: ElfClass, offset: u64, sym: u32, rtype: u32, addend: i64) -> Self {
        match class {
            ElfClass::Elf32 => RelocEntry::Rela32 {
                offset: offset as u32,
                info: (sym << 8) | (rtype & 0xff),
                addend: addend as i32,
            },
            ElfClass::Elf64 => RelocEntry::Rela64 {
                offset,
                info: ((sym as u64) << 32) | rtype as u64,
                addend,
            },
        }
    }

    /// Builds a REL entry in the image's native width.
    pub fn new_rel(class: ElfClass, offset: u64, sym: u32, rtype: u32) -> Self {
        match class {
            ElfClass::Elf32 => RelocEntry::Rel32 {
                offset: offset as u32,
                info: (sym << 8) | (rtype & 0xff),
            },
            ElfClass::Elf64 => RelocEntry::Rel64 {
                offset,
                info: ((sym as u64) << 32) | rtype as u64,
            },
        }
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        match self {
            RelocEntry::Rel32 { .. } => 8,
            RelocEntry::Rela32 { .. } => 12,
            RelocEntry::Rel64 { .. } => 16,
            RelocEntry::Rela64 { .. } => 24,
        }
    }

    /// Writes exactly `size_in_bytes` at the start of `buf`.
    pub fn dump(&self, buf: &mut [u8]) {
        match self {
            RelocEntry::Rel32 { offset, info } => {
                LittleEndian::write_u32(&mut buf[0..], *offset);
                LittleEndian::write_u32(&mut buf[4..], *info);
            }
            RelocEntry::Rela32 {
                offset,
                info,
                addend,
            } => {
                LittleEndian::write_u32(&mut buf[0..], *offset);
                LittleEndian::write_u32(&mut buf[4..], *info);
                LittleEndian::write_i32(&mut buf[8..], *addend);
            }
            RelocEntry::Rel64 { offset, info } => {
                LittleEndian::write_u64(&mut buf[0..], *offset);
                LittleEndian::write_u64(&mut buf[8..], *info);
            }
            RelocEntry::Rela64 {
                offset,
                info,
                addend,
            } => {
                LittleEndian::write_u64(&mut buf[0..], *offset);
                LittleEndian::write_u64(&mut buf[8..], *info);
                LittleEndian::write_i64(&mut buf[16..], *addend);
            }
        }
    }
}

/// A parsed relocation section.
#[derive(Debug, Clone)]
pub struct RelocationTable {
    /// Section index of the table itself.
    pub section_index: usize,
    /// Section index of the associated symbol table.
    pub symtab_link: usize,
    /// Section index the relocations apply to (0 for dynamic tables).
    pub target_section: usize,
    pub entries: Vec<RelocEntry>,
    pub is_rela: bool,
    class: ElfClass,
}

impl RelocationTable {
    pub(crate) fn parse(
        class: ElfClass,
        section_index: usize,
        symtab_link: usize,
        target_section: usize,
        is_rela: bool,
        data: &[u8],
    ) -> Result<Self> {
        let esz = match (class, is_rela) {
            (ElfClass::Elf32, false) => 8,
            (ElfClass::Elf32, true) => 12,
            (ElfClass::Elf64, false) => 16,
            (ElfClass::Elf64, true) => 24,
        };
        if data.len() % esz != 0 {
            return Err(elf_malformed("relocation section size not a multiple of its entry size"));
        }
        let mut entries = Vec::with_capacity(data.len() / esz);
        for chunk in data.chunks_exact(esz) {
            let entry = match (class, is_rela) {
                (ElfClass::Elf32, false) => RelocEntry::Rel32 {
                    offset: LittleEndian::read_u32(&chunk[0..]),
                    info: LittleEndian::read_u32(&chunk[4..]),
                },
                (ElfClass::Elf32, true) => RelocEntry::Rela32 {
                    offset: LittleEndian::read_u32(&chunk[0..]),
                    info: LittleEndian::read_u32(&chunk[4..]),
                    addend: LittleEndian::read_i32(&chunk[8..]),
                },
                (ElfClass::Elf64, false) => RelocEntry::Rel64 {
                    offset: LittleEndian::read_u64(&chunk[0..]),
                    info: LittleEndian::read_u64(&chunk[8..]),
                },
                (ElfClass::Elf64, true) => RelocEntry::Rela64 {
                    offset: LittleEndian::read_u64(&chunk[0..]),
                    info: LittleEndian::read_u64(&chunk[8..]),
                    addend: LittleEndian::read_i64(&chunk[16..]),
                },
            };
            entries.push(entry);
        }
        Ok(RelocationTable {
            section_index,
            symtab_link,
            target_section,
            entries,
            is_rela,
            class,
        })
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        match (self.class, self.is_rela) {
            (ElfClass::Elf32, false) => 8,
            (ElfClass::Elf32, true) => 12,
            (ElfClass::Elf64, false) => 16,
            (ElfClass::Elf64, true) => 24,
        }
    }

    /// Serializes every entry back to native layout.
    pub fn serialize(&self) -> Vec<u8> {
        let esz = self.entry_size();
        let mut out = alloc::vec![0u8; esz * self.entries.len()];
        for (i, entry) in self.entries.iter().enumerate() {
            entry.dump(&mut out[i * esz..]);
        }
        out
    }
}
