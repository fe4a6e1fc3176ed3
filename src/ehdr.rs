//! ELF file-header parsing and re-emission.

use crate::error::{elf_malformed, Result};
use byteorder::{ByteOrder, LittleEndian};
use elf::abi::{
    EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFMAGIC, EM_386,
    EM_X86_64, ET_DYN, ET_EXEC, EV_CURRENT,
};

/// The file class, fixed for the lifetime of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    #[inline]
    pub fn is_64(&self) -> bool {
        matches!(self, ElfClass::Elf64)
    }

    /// Size of a file header of this class.
    #[inline]
    pub fn ehdr_size(&self) -> usize {
        match self {
            ElfClass::Elf32 => 52,
            ElfClass::Elf64 => 64,
        }
    }

    /// Size of a section header of this class.
    #[inline]
    pub fn shdr_size(&self) -> usize {
        match self {
            ElfClass::Elf32 => 40,
            ElfClass::Elf64 => 64,
        }
    }

    /// Size of a program header of this class.
    #[inline]
    pub fn phdr_size(&self) -> usize {
        match self {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 56,
        }
    }

    /// Size of a symbol-table entry of this class.
    #[inline]
    pub fn sym_size(&self) -> usize {
        match self {
            ElfClass::Elf32 => 16,
            ElfClass::Elf64 => 24,
        }
    }

    /// Size of a dynamic entry of this class.
    #[inline]
    pub fn dyn_size(&self) -> usize {
        match self {
            ElfClass::Elf32 => 8,
            ElfClass::Elf64 => 16,
        }
    }
}

/// The parsed file header, widened to 64-bit fields so that callers
/// never branch on the class for a field read.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
    class: ElfClass,
}

impl FileHeader {
    /// Parses and validates the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(elf_malformed("file shorter than the ELF identification"));
        }
        let mut ident = [0u8; 16];
        ident.copy_from_slice(&data[..16]);
        if ident[0..4] != ELFMAGIC {
            return Err(elf_malformed("invalid ELF magic"));
        }
        let class = match ident[EI_CLASS] {
            ELFCLASS32 => ElfClass::Elf32,
            ELFCLASS64 => ElfClass::Elf64,
            _ => return Err(elf_malformed("unsupported ELF class")),
        };
        if ident[EI_DATA] != ELFDATA2LSB {
            return Err(elf_malformed("unsupported data encoding (big-endian)"));
        }
        if ident[EI_VERSION] != EV_CURRENT {
            return Err(elf_malformed("invalid ELF version"));
        }
        if data.len() < class.ehdr_size() {
            return Err(elf_malformed("file shorter than its file header"));
        }

        let hdr = match class {
            ElfClass::Elf32 => FileHeader {
                ident,
                e_type: LittleEndian::read_u16(&data[16..]),
                e_machine: LittleEndian::read_u16(&data[18..]),
                e_version: LittleEndian::read_u32(&data[20..]),
                e_entry: LittleEndian::read_u32(&data[24..]) as u64,
                e_phoff: LittleEndian::read_u32(&data[28..]) as u64,
                e_shoff: LittleEndian::read_u32(&data[32..]) as u64,
                e_flags: LittleEndian::read_u32(&data[36..]),
                e_ehsize: LittleEndian::read_u16(&data[40..]),
                e_phentsize: LittleEndian::read_u16(&data[42..]),
                e_phnum: LittleEndian::read_u16(&data[44..]),
                e_shentsize: LittleEndian::read_u16(&data[46..]),
                e_shnum: LittleEndian::read_u16(&data[48..]),
                e_shstrndx: LittleEndian::read_u16(&data[50..]),
                class,
            },
            ElfClass::Elf64 => FileHeader {
                ident,
                e_type: LittleEndian::read_u16(&data[16..]),
                e_machine: LittleEndian::read_u16(&data[18..]),
                e_version: LittleEndian::read_u32(&data[20..]),
                e_entry: LittleEndian::read_u64(&data[24..]),
                e_phoff: LittleEndian::read_u64(&data[32..]),
                e_shoff: LittleEndian::read_u64(&data[40..]),
                e_flags: LittleEndian::read_u32(&data[48..]),
                e_ehsize: LittleEndian::read_u16(&data[52..]),
                e_phentsize: LittleEndian::read_u16(&data[54..]),
                e_phnum: LittleEndian::read_u16(&data[56..]),
                e_shentsize: LittleEndian::read_u16(&data[58..]),
                e_shnum: LittleEndian::read_u16(&data[60..]),
                e_shstrndx: LittleEndian::read_u16(&data[62..]),
                class,
            },
        };
        hdr.validate()?;
        Ok(hdr)
    }

    fn validate(&self) -> Result<()> {
        let machine_ok = match self.class {
            ElfClass::Elf32 => self.e_machine == EM_386,
            ElfClass::Elf64 => self.e_machine == EM_X86_64,
        };
        if !machine_ok {
            return Err(elf_malformed("machine does not match file class"));
        }
        Ok(())
    }

    #[inline]
    pub fn class(&self) -> ElfClass {
        self.class
    }

    #[inline]
    pub fn is_exec(&self) -> bool {
        self.e_type == ET_EXEC
    }

    #[inline]
    pub fn is_dylib(&self) -> bool {
        self.e_type == ET_DYN
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.class.ehdr_size()
    }

    /// Writes exactly `size_in_bytes` at the start of `buf`.
    pub fn dump(&self, buf: &mut [u8]) {
        buf[..16].copy_from_slice(&self.ident);
        match self.class {
            ElfClass::Elf32 => {
                LittleEndian::write_u16(&mut buf[16..], self.e_type);
                LittleEndian::write_u16(&mut buf[18..], self.e_machine);
                LittleEndian::write_u32(&mut buf[20..], self.e_version);
                LittleEndian::write_u32(&mut buf[24..], self.e_entry as u32);
                LittleEndian::write_u32(&mut buf[28..], self.e_phoff as u32);
                LittleEndian::write_u32(&mut buf[32..], self.e_shoff as u32);
                LittleEndian::write_u32(&mut buf[36..], self.e_flags);
                LittleEndian::write_u16(&mut buf[40..], self.e_ehsize);
                LittleEndian::write_u16(&mut buf[42..], self.e_phentsize);
                LittleEndian::write_u16(&mut buf[44..], self.e_phnum);
                LittleEndian::write_u16(&mut buf[46..], self.e_shentsize);
                LittleEndian::write_u16(&mut buf[48..], self.e_shnum);
                LittleEndian::write_u16(&mut buf[50..], self.e_shstrndx);
            }
            ElfClass::Elf64 => {
                LittleEndian::write_u16(&mut buf[16..], self.e_type);
                LittleEndian::write_u16(&mut buf[18..], self.e_machine);
                LittleEndian::write_u32(&mut buf[20..], self.e_version);
                LittleEndian::write_u64(&mut buf[24..], self.e_entry);
                LittleEndian::write_u64(&mut buf[32..], self.e_phoff);
                LittleEndian::write_u64(&mut buf[40..], self.e_shoff);
                LittleEndian::write_u32(&mut buf[48..], self.e_flags);
                LittleEndian::write_u16(&mut buf[52..], self.e_ehsize);
                LittleEndian::write_u16(&mut buf[54..], self.e_phentsize);
                LittleEndian::write_u16(&mut buf[56..], self.e_phnum);
                LittleEndian::write_u16(&mut buf[58..], self.e_shentsize);
                LittleEndian::write_u16(&mut buf[60..], self.e_shnum);
                LittleEndian::write_u16(&mut buf[62..], self.e_shstrndx);
            }
        }
    }
}
