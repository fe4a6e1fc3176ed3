//! Program (segment) headers.

use crate::ehdr::ElfClass;
use byteorder::{ByteOrder, LittleEndian};
use elf::abi::PT_LOAD;

/// One program header, widened to 64-bit fields.
#[derive(Debug, Clone)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
    pub index: usize,
    class: ElfClass,
}

impl ProgramHeader {
    pub(crate) fn parse(class: ElfClass, data: &[u8], index: usize) -> Self {
        match class {
            // The 32-bit layout stores p_flags at the tail, the 64-bit
            // layout right after p_type.
            ElfClass::Elf32 => ProgramHeader {
                p_type: LittleEndian::read_u32(&data[0..]),
                offset: LittleEndian::read_u32(&data[4..]) as u64,
                vaddr: LittleEndian::read_u32(&data[8..]) as u64,
                paddr: LittleEndian::read_u32(&data[12..]) as u64,
                filesz: LittleEndian::read_u32(&data[16..]) as u64,
                memsz: LittleEndian::read_u32(&data[20..]) as u64,
                flags: LittleEndian::read_u32(&data[24..]),
                align: LittleEndian::read_u32(&data[28..]) as u64,
                index,
                class,
            },
            ElfClass::Elf64 => ProgramHeader {
                p_type: LittleEndian::read_u32(&data[0..]),
                flags: LittleEndian::read_u32(&data[4..]),
                offset: LittleEndian::read_u64(&data[8..]),
                vaddr: LittleEndian::read_u64(&data[16..]),
                paddr: LittleEndian::read_u64(&data[24..]),
                filesz: LittleEndian::read_u64(&data[32..]),
                memsz: LittleEndian::read_u64(&data[40..]),
                align: LittleEndian::read_u64(&data[48..]),
                index,
                class,
            },
        }
    }

    /// Builds a fresh header, used for the segments the rewrite adds.
    pub(crate) fn new_load(
        class: ElfClass,
        flags: u32,
        offset: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
        align: u64,
    ) -> Self {
        ProgramHeader {
            p_type: PT_LOAD,
            flags,
            offset,
            vaddr,
            paddr: vaddr,
            filesz,
            memsz,
            align,
            index: usize::MAX,
            class,
        }
    }

    /// Writes exactly one header at the start of `buf`.
    pub fn dump(&self, buf: &mut [u8]) {
        match self.class {
            ElfClass::Elf32 => {
                LittleEndian::write_u32(&mut buf[0..], self.p_type);
                LittleEndian::write_u32(&mut buf[4..], self.offset as u32);
                LittleEndian::write_u32(&mut buf[8..], self.vaddr as u32);
                LittleEndian::write_u32(&mut buf[12..], self.paddr as u32);
                LittleEndian::write_u32(&mut buf[16..], self.filesz as u32);
                LittleEndian::write_u32(&mut buf[20..], self.memsz as u32);
                LittleEndian::write_u32(&mut buf[24..], self.flags);
                LittleEndian::write_u32(&mut buf[28..], self.align as u32);
            }
            ElfClass::Elf64 => {
                LittleEndian::write_u32(&mut buf[0..], self.p_type);
                LittleEndian::write_u32(&mut buf[4..], self.flags);
                LittleEndian::write_u64(&mut buf[8..], self.offset);
                LittleEndian::write_u64(&mut buf[16..], self.vaddr);
                LittleEndian::write_u64(&mut buf[24..], self.paddr);
                LittleEndian::write_u64(&mut buf[32..], self.filesz);
                LittleEndian::write_u64(&mut buf[40..], self.memsz);
                LittleEndian::write_u64(&mut buf[48..], self.align);
            }
        }
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.class.phdr_size()
    }

    #[inline]
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// End of the segment's memory image.
    #[inline]
    pub fn end_vaddr(&self) -> u64 {
        self.vaddr + self.memsz
    }
}
