//! Section headers with class-erased accessors.

use crate::ehdr::ElfClass;
use byteorder::{ByteOrder, LittleEndian};
use elf::abi::{SHF_EXECINSTR, SHT_NOBITS, SHT_NULL, SHT_PROGBITS};

use alloc::string::String;

/// One section header, widened to 64-bit fields. The owning class is
/// recorded so `dump` re-emits the native layout.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name_idx: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
    /// Stable section index within the image.
    pub index: usize,
    /// Resolved name, filled once the section-header string table is
    /// available.
    pub name: String,
    class: ElfClass,
}

impl SectionHeader {
    pub(crate) fn parse(class: ElfClass, data: &[u8], index: usize) -> Self {
        match class {
            ElfClass::Elf32 => SectionHeader {
                name_idx: LittleEndian::read_u32(&data[0..]),
                sh_type: LittleEndian::read_u32(&data[4..]),
                flags: LittleEndian::read_u32(&data[8..]) as u64,
                addr: LittleEndian::read_u32(&data[12..]) as u64,
                offset: LittleEndian::read_u32(&data[16..]) as u64,
                size: LittleEndian::read_u32(&data[20..]) as u64,
                link: LittleEndian::read_u32(&data[24..]),
                info: LittleEndian::read_u32(&data[28..]),
                addralign: LittleEndian::read_u32(&data[32..]) as u64,
                entsize: LittleEndian::read_u32(&data[36..]) as u64,
                index,
                name: String::new(),
                class,
            },
            ElfClass::Elf64 => SectionHeader {
                name_idx: LittleEndian::read_u32(&data[0..]),
                sh_type: LittleEndian::read_u32(&data[4..]),
                flags: LittleEndian::read_u64(&data[8..]),
                addr: LittleEndian::read_u64(&data[16..]),
                offset: LittleEndian::read_u64(&data[24..]),
                size: LittleEndian::read_u64(&data[32..]),
                link: LittleEndian::read_u32(&data[40..]),
                info: LittleEndian::read_u32(&data[44..]),
                addralign: LittleEndian::read_u64(&data[48..]),
                entsize: LittleEndian::read_u64(&data[56..]),
                index,
                name: String::new(),
                class,
            },
        }
    }

    /// Writes exactly one header at the start of `buf`.
    pub fn dump(&self, buf: &mut [u8]) {
        match self.class {
            ElfClass::Elf32 => {
                LittleEndian::write_u32(&mut buf[0..], self.name_idx);
                LittleEndian::write_u32(&mut buf[4..], self.sh_type);
                LittleEndian::write_u32(&mut buf[8..], self.flags as u32);
                LittleEndian::write_u32(&mut buf[12..], self.addr as u32);
                LittleEndian::write_u32(&mut buf[16..], self.offset as u32);
                LittleEndian::write_u32(&mut buf[20..], self.size as u32);
                LittleEndian::write_u32(&mut buf[24..], self.link);
                LittleEndian::write_u32(&mut buf[28..], self.info);
                LittleEndian::write_u32(&mut buf[32..], self.addralign as u32);
                LittleEndian::write_u32(&mut buf[36..], self.entsize as u32);
            }
            ElfClass::Elf64 => {
                LittleEndian::write_u32(&mut buf[0..], self.name_idx);
                LittleEndian::write_u32(&mut buf[4..], self.sh_type);
                LittleEndian::write_u64(&mut buf[8..], self.flags);
                LittleEndian::write_u64(&mut buf[16..], self.addr);
                LittleEndian::write_u64(&mut buf[24..], self.offset);
                LittleEndian::write_u64(&mut buf[32..], self.size);
                LittleEndian::write_u32(&mut buf[40..], self.link);
                LittleEndian::write_u32(&mut buf[44..], self.info);
                LittleEndian::write_u64(&mut buf[48..], self.addralign);
                LittleEndian::write_u64(&mut buf[56..], self.entsize);
            }
        }
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.class.shdr_size()
    }

    /// True iff `addr` lies inside `[sh_addr, sh_addr + sh_size)`.
    #[inline]
    pub fn in_range(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr + self.size
    }

    /// True for executable progbits sections.
    #[inline]
    pub fn is_text(&self) -> bool {
        self.sh_type == SHT_PROGBITS && self.flags & SHF_EXECINSTR as u64 != 0
    }

    #[inline]
    pub fn is_nobits(&self) -> bool {
        self.sh_type == SHT_NOBITS
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.sh_type == SHT_NULL
    }

    /// End of the section's address range.
    #[inline]
    pub fn end_addr(&self) -> u64 {
        self.addr + self.size
    }
}
