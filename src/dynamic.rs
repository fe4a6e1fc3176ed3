//! The `.dynamic` section.
//!
//! The table is parsed slot-for-slot (including everything after the
//! first `DT_NULL`) so that an unmodified table re-serializes to the
//! exact input bytes. The rewrite appends `DT_NEEDED` entries for tool
//! libraries ahead of the terminator.

use crate::ehdr::ElfClass;
use crate::error::{elf_malformed, Result};
use byteorder::{ByteOrder, LittleEndian};
use elf::abi::{DT_NEEDED, DT_NULL, DT_STRSZ, DT_STRTAB, DT_SYMTAB};

use alloc::vec::Vec;

/// One dynamic slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynEntry {
    pub tag: i64,
    pub val: u64,
}

/// A parsed `.dynamic` section.
#[derive(Debug, Clone)]
pub struct DynamicTable {
    /// Section index of the table itself.
    pub section_index: usize,
    /// Section index of the associated string table.
    pub link: usize,
    pub entries: Vec<DynEntry>,
    class: ElfClass,
}

impl DynamicTable {
    pub(crate) fn parse(
        class: ElfClass,
        section_index: usize,
        link: usize,
        data: &[u8],
    ) -> Result<Self> {
        let esz = class.dyn_size();
        if data.len() % esz != 0 {
            return Err(elf_malformed("dynamic section size not a multiple of its entry size"));
        }
        let mut entries = Vec::with_capacity(data.len() / esz);
        for chunk in data.chunks_exact(esz) {
            let entry = match class {
                ElfClass::Elf32 => DynEntry {
                    tag: LittleEndian::read_i32(&chunk[0..]) as i64,
                    val: LittleEndian::read_u32(&chunk[4..]) as u64,
                },
                ElfClass::Elf64 => DynEntry {
                    tag: LittleEndian::read_i64(&chunk[0..]),
                    val: LittleEndian::read_u64(&chunk[8..]),
                },
            };
            entries.push(entry);
        }
        Ok(DynamicTable {
            section_index,
            link,
            entries,
            class,
        })
    }

    /// Value of the first entry with `tag`, if present before the
    /// terminator.
    pub fn value_of(&self, tag: i64) -> Option<u64> {
        for e in &self.entries {
            if e.tag == DT_NULL {
                break;
            }
            if e.tag == tag {
                return Some(e.val);
            }
        }
        None
    }

    /// Overwrites the value of the first entry with `tag`.
    pub fn set_value(&mut self, tag: i64, val: u64) -> bool {
        for e in self.entries.iter_mut() {
            if e.tag == DT_NULL {
                break;
            }
            if e.tag == tag {
                e.val = val;
                return true;
            }
        }
        false
    }

    /// String-table offsets of every `DT_NEEDED` entry.
    pub fn needed_offsets(&self) -> Vec<u64> {
        let mut v = Vec::new();
        for e in &self.entries {
            if e.tag == DT_NULL {
                break;
            }
            if e.tag == DT_NEEDED {
                v.push(e.val);
            }
        }
        v
    }

    /// Inserts a `DT_NEEDED` entry ahead of the terminator. The table
    /// grows by one slot; callers relocate it when re-emitting.
    pub fn push_needed(&mut self, strtab_offset: u64) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.tag == DT_NULL)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            pos,
            DynEntry {
                tag: DT_NEEDED,
                val: strtab_offset,
            },
        );
    }

    #[inline]
    pub fn strtab_addr(&self) -> Option<u64> {
        self.value_of(DT_STRTAB)
    }

    #[inline]
    pub fn symtab_addr(&self) -> Option<u64> {
        self.value_of(DT_SYMTAB)
    }

    #[inline]
    pub fn strtab_size(&self) -> Option<u64> {
        self.value_of(DT_STRSZ)
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.entries.len() * self.class.dyn_size()
    }

    /// Serializes every slot back to native layout.
    pub fn serialize(&self) -> Vec<u8> {
        let esz = self.class.dyn_size();
        let mut out = alloc::vec![0u8; esz * self.entries.len()];
        for (i, e) in self.entries.iter().enumerate() {
            let chunk = &mut out[i * esz..];
            match self.class {
                ElfClass::Elf32 => {
                    LittleEndian::write_i32(&mut chunk[0..], e.tag as i32);
                    LittleEndian::write_u32(&mut chunk[4..], e.val as u32);
                }
                ElfClass::Elf64 => {
                    LittleEndian::write_i64(&mut chunk[0..], e.tag);
                    LittleEndian::write_u64(&mut chunk[8..], e.val);
                }
            }
        }
        out
    }
}
