//! Handcrafted ELF fixtures.
//!
//! The builders lay sections out at fixed, generously padded offsets so
//! tests stay readable; every assert here is a layout capacity check,
//! not a behavior check.

#![allow(dead_code)]

use byteorder::{ByteOrder, LittleEndian as LE};

pub const BASE_64: u64 = 0x400000;
pub const BASE_32: u64 = 0x08048000;

pub const TEXT_OFF: u64 = 0x200;
pub const PLT_OFF: u64 = 0x300;
pub const DYNSYM_OFF: u64 = 0x340;
pub const DYNSTR_OFF: u64 = 0x370;
pub const RELA_OFF: u64 = 0x390;
pub const DYNAMIC_OFF: u64 = 0x3c0;
pub const SYMTAB_OFF: u64 = 0x480;
pub const STRTAB_OFF: u64 = 0x580;
pub const SHSTRTAB_OFF: u64 = 0x600;
pub const SHDR_OFF: u64 = 0x680;

/// One static symbol to place in `.symtab`.
pub struct Sym {
    pub name: &'static str,
    /// Offset within `.text`.
    pub text_off: u64,
    pub size: u64,
    pub is_func: bool,
}

pub struct Fixture {
    pub text: Vec<u8>,
    pub plt: Vec<u8>,
    pub syms: Vec<Sym>,
    /// Include `.dynsym`/`.dynstr`/`.rela.dyn`/`.dynamic`.
    pub dynamic: bool,
}

impl Fixture {
    pub fn new(text: Vec<u8>, syms: Vec<Sym>) -> Self {
        Fixture {
            text,
            plt: Vec::new(),
            syms,
            dynamic: false,
        }
    }

    pub fn with_dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn with_plt(mut self, plt: Vec<u8>) -> Self {
        self.plt = plt;
        self
    }

    pub fn text_vaddr(&self) -> u64 {
        BASE_64 + TEXT_OFF
    }

    pub fn plt_vaddr(&self) -> u64 {
        BASE_64 + PLT_OFF
    }

    /// Builds a 64-bit `ET_EXEC` image.
    pub fn build64(&self) -> Vec<u8> {
        assert!(self.text.len() <= 0x100, "text overflows its slot");
        assert!(self.plt.len() <= 0x40, "plt overflows its slot");

        // Section name table.
        let names = [
            "", ".text", ".plt", ".dynsym", ".dynstr", ".rela.dyn", ".dynamic", ".symtab",
            ".strtab", ".shstrtab",
        ];
        let (shstrtab, name_off) = strtab(&names);

        // Static string/symbol tables.
        let mut strtab_names: Vec<&str> = vec![""];
        strtab_names.extend(self.syms.iter().map(|s| s.name));
        let (strtab_bytes, sym_name_off) = strtab(&strtab_names);
        let mut symtab = vec![0u8; 24];
        for (i, s) in self.syms.iter().enumerate() {
            let mut e = [0u8; 24];
            LE::write_u32(&mut e[0..], sym_name_off[i + 1]);
            e[4] = if s.is_func { 0x12 } else { 0x11 }; // GLOBAL FUNC / GLOBAL OBJECT
            LE::write_u16(&mut e[6..], 1); // .text
            LE::write_u64(&mut e[8..], BASE_64 + TEXT_OFF + s.text_off);
            LE::write_u64(&mut e[16..], s.size);
            symtab.extend_from_slice(&e);
        }
        assert!(symtab.len() <= 0x100, "symtab overflows its slot");
        assert!(strtab_bytes.len() <= 0x80, "strtab overflows its slot");

        // Dynamic tables: a lone null symbol, one needed library, one
        // empty relocation slot.
        let (dynstr_bytes, dynstr_off) = strtab(&["", "libc.so.6"]);
        let dynsym = vec![0u8; 24];
        let rela = vec![0u8; 24];
        let mut dynamic = Vec::new();
        if self.dynamic {
            let mut dt = |tag: i64, val: u64| {
                let mut e = [0u8; 16];
                LE::write_i64(&mut e[0..], tag);
                LE::write_u64(&mut e[8..], val);
                dynamic.extend_from_slice(&e);
            };
            dt(1, dynstr_off[1] as u64); // DT_NEEDED: libc.so.6
            dt(5, BASE_64 + DYNSTR_OFF); // DT_STRTAB
            dt(10, dynstr_bytes.len() as u64); // DT_STRSZ
            dt(6, BASE_64 + DYNSYM_OFF); // DT_SYMTAB
            dt(11, 24); // DT_SYMENT
            dt(7, BASE_64 + RELA_OFF); // DT_RELA
            dt(8, rela.len() as u64); // DT_RELASZ
            dt(9, 24); // DT_RELAENT
            dt(0, 0); // DT_NULL
        }
        assert!(dynamic.len() <= 0xc0, "dynamic overflows its slot");

        let file_len = SHDR_OFF + 10 * 64;
        let mut out = vec![0u8; file_len as usize];

        // File header.
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little-endian
        out[6] = 1; // EV_CURRENT
        LE::write_u16(&mut out[16..], 2); // ET_EXEC
        LE::write_u16(&mut out[18..], 62); // EM_X86_64
        LE::write_u32(&mut out[20..], 1);
        LE::write_u64(&mut out[24..], BASE_64 + TEXT_OFF); // entry
        LE::write_u64(&mut out[32..], 64); // e_phoff
        LE::write_u64(&mut out[40..], SHDR_OFF); // e_shoff
        LE::write_u16(&mut out[52..], 64); // e_ehsize
        LE::write_u16(&mut out[54..], 56); // e_phentsize
        let phnum = if self.dynamic { 2 } else { 1 };
        LE::write_u16(&mut out[56..], phnum);
        LE::write_u16(&mut out[58..], 64); // e_shentsize
        LE::write_u16(&mut out[60..], 10); // e_shnum
        LE::write_u16(&mut out[62..], 9); // e_shstrndx

        // Program headers: one LOAD covering the file, plus DYNAMIC.
        {
            let p = &mut out[64..];
            LE::write_u32(&mut p[0..], 1); // PT_LOAD
            LE::write_u32(&mut p[4..], 5); // R+X
            LE::write_u64(&mut p[8..], 0);
            LE::write_u64(&mut p[16..], BASE_64);
            LE::write_u64(&mut p[24..], BASE_64);
            LE::write_u64(&mut p[32..], file_len);
            LE::write_u64(&mut p[40..], file_len);
            LE::write_u64(&mut p[48..], 0x1000);
        }
        if self.dynamic {
            let p = &mut out[64 + 56..];
            LE::write_u32(&mut p[0..], 2); // PT_DYNAMIC
            LE::write_u32(&mut p[4..], 6); // R+W
            LE::write_u64(&mut p[8..], DYNAMIC_OFF);
            LE::write_u64(&mut p[16..], BASE_64 + DYNAMIC_OFF);
            LE::write_u64(&mut p[24..], BASE_64 + DYNAMIC_OFF);
            LE::write_u64(&mut p[32..], dynamic.len() as u64);
            LE::write_u64(&mut p[40..], dynamic.len() as u64);
            LE::write_u64(&mut p[48..], 8);
        }

        // Section contents.
        let put = |out: &mut Vec<u8>, off: u64, bytes: &[u8]| {
            out[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
        };
        put(&mut out, TEXT_OFF, &self.text);
        put(&mut out, PLT_OFF, &self.plt);
        put(&mut out, SYMTAB_OFF, &symtab);
        put(&mut out, STRTAB_OFF, &strtab_bytes);
        put(&mut out, SHSTRTAB_OFF, &shstrtab);
        if self.dynamic {
            put(&mut out, DYNSYM_OFF, &dynsym);
            put(&mut out, DYNSTR_OFF, &dynstr_bytes);
            put(&mut out, RELA_OFF, &rela);
            put(&mut out, DYNAMIC_OFF, &dynamic);
        }

        // Section headers.
        let mut shdr = |idx: usize,
                        name: u32,
                        sh_type: u32,
                        flags: u64,
                        addr: u64,
                        off: u64,
                        size: u64,
                        link: u32,
                        info: u32,
                        entsize: u64| {
            let at = (SHDR_OFF as usize) + idx * 64;
            let s = &mut out[at..at + 64];
            LE::write_u32(&mut s[0..], name);
            LE::write_u32(&mut s[4..], sh_type);
            LE::write_u64(&mut s[8..], flags);
            LE::write_u64(&mut s[16..], addr);
            LE::write_u64(&mut s[24..], off);
            LE::write_u64(&mut s[32..], size);
            LE::write_u32(&mut s[40..], link);
            LE::write_u32(&mut s[44..], info);
            LE::write_u64(&mut s[48..], 8);
            LE::write_u64(&mut s[56..], entsize);
        };
        let n = |i: usize| name_off[i];
        shdr(1, n(1), 1, 6, BASE_64 + TEXT_OFF, TEXT_OFF, self.text.len() as u64, 0, 0, 0);
        if !self.plt.is_empty() {
            shdr(2, n(2), 1, 6, BASE_64 + PLT_OFF, PLT_OFF, self.plt.len() as u64, 0, 0, 16);
        }
        if self.dynamic {
            shdr(3, n(3), 11, 2, BASE_64 + DYNSYM_OFF, DYNSYM_OFF, dynsym.len() as u64, 4, 1, 24);
            shdr(4, n(4), 3, 2, BASE_64 + DYNSTR_OFF, DYNSTR_OFF, dynstr_bytes.len() as u64, 0, 0, 0);
            shdr(5, n(5), 4, 2, BASE_64 + RELA_OFF, RELA_OFF, rela.len() as u64, 3, 0, 24);
            shdr(6, n(6), 6, 3, BASE_64 + DYNAMIC_OFF, DYNAMIC_OFF, dynamic.len() as u64, 4, 0, 16);
        }
        shdr(7, n(7), 2, 0, 0, SYMTAB_OFF, symtab.len() as u64, 8, 1, 24);
        shdr(8, n(8), 3, 0, 0, STRTAB_OFF, strtab_bytes.len() as u64, 0, 0, 0);
        shdr(9, n(9), 3, 0, 0, SHSTRTAB_OFF, shstrtab.len() as u64, 0, 0, 0);

        out
    }
}

/// Builds a minimal 32-bit `ET_EXEC` image with one text section and
/// one function symbol covering it.
pub fn build32(text: &[u8], func_name: &str) -> Vec<u8> {
    const TEXT_OFF32: u64 = 0x100;
    const SYMTAB_OFF32: u64 = 0x200;
    const STRTAB_OFF32: u64 = 0x280;
    const SHSTR_OFF32: u64 = 0x2c0;
    const SHDR_OFF32: u64 = 0x300;
    assert!(text.len() <= 0x80);

    let names = ["", ".text", ".symtab", ".strtab", ".shstrtab"];
    let (shstrtab, name_off) = strtab(&names);
    let (strtab_bytes, sym_off) = strtab(&["", func_name]);

    let mut symtab = vec![0u8; 16];
    let mut e = [0u8; 16];
    LE::write_u32(&mut e[0..], sym_off[1]);
    LE::write_u32(&mut e[4..], (BASE_32 + TEXT_OFF32) as u32);
    LE::write_u32(&mut e[8..], text.len() as u32);
    e[12] = 0x12; // GLOBAL FUNC
    LE::write_u16(&mut e[14..], 1);
    symtab.extend_from_slice(&e);

    let file_len = SHDR_OFF32 + 5 * 40;
    let mut out = vec![0u8; file_len as usize];

    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 1; // ELFCLASS32
    out[5] = 1;
    out[6] = 1;
    LE::write_u16(&mut out[16..], 2); // ET_EXEC
    LE::write_u16(&mut out[18..], 3); // EM_386
    LE::write_u32(&mut out[20..], 1);
    LE::write_u32(&mut out[24..], (BASE_32 + TEXT_OFF32) as u32);
    LE::write_u32(&mut out[28..], 52); // e_phoff
    LE::write_u32(&mut out[32..], SHDR_OFF32 as u32);
    LE::write_u16(&mut out[40..], 52);
    LE::write_u16(&mut out[42..], 32);
    LE::write_u16(&mut out[44..], 1);
    LE::write_u16(&mut out[46..], 40);
    LE::write_u16(&mut out[48..], 5);
    LE::write_u16(&mut out[50..], 4);

    {
        let p = &mut out[52..];
        LE::write_u32(&mut p[0..], 1); // PT_LOAD
        LE::write_u32(&mut p[4..], 0);
        LE::write_u32(&mut p[8..], (BASE_32) as u32);
        LE::write_u32(&mut p[12..], (BASE_32) as u32);
        LE::write_u32(&mut p[16..], file_len as u32);
        LE::write_u32(&mut p[20..], file_len as u32);
        LE::write_u32(&mut p[24..], 5);
        LE::write_u32(&mut p[28..], 0x1000);
    }

    out[TEXT_OFF32 as usize..TEXT_OFF32 as usize + text.len()].copy_from_slice(text);
    out[SYMTAB_OFF32 as usize..SYMTAB_OFF32 as usize + symtab.len()].copy_from_slice(&symtab);
    out[STRTAB_OFF32 as usize..STRTAB_OFF32 as usize + strtab_bytes.len()]
        .copy_from_slice(&strtab_bytes);
    out[SHSTR_OFF32 as usize..SHSTR_OFF32 as usize + shstrtab.len()].copy_from_slice(&shstrtab);

    let mut shdr = |idx: usize,
                    name: u32,
                    sh_type: u32,
                    flags: u32,
                    addr: u32,
                    off: u32,
                    size: u32,
                    link: u32,
                    info: u32,
                    entsize: u32| {
        let at = (SHDR_OFF32 as usize) + idx * 40;
        let s = &mut out[at..at + 40];
        LE::write_u32(&mut s[0..], name);
        LE::write_u32(&mut s[4..], sh_type);
        LE::write_u32(&mut s[8..], flags);
        LE::write_u32(&mut s[12..], addr);
        LE::write_u32(&mut s[16..], off);
        LE::write_u32(&mut s[20..], size);
        LE::write_u32(&mut s[24..], link);
        LE::write_u32(&mut s[28..], info);
        LE::write_u32(&mut s[32..], 4);
        LE::write_u32(&mut s[36..], entsize);
    };
    shdr(
        1,
        name_off[1],
        1,
        6,
        (BASE_32 + TEXT_OFF32) as u32,
        TEXT_OFF32 as u32,
        text.len() as u32,
        0,
        0,
        0,
    );
    shdr(2, name_off[2], 2, 0, 0, SYMTAB_OFF32 as u32, symtab.len() as u32, 3, 1, 16);
    shdr(3, name_off[3], 3, 0, 0, STRTAB_OFF32 as u32, strtab_bytes.len() as u32, 0, 0, 0);
    shdr(4, name_off[4], 3, 0, 0, SHSTR_OFF32 as u32, shstrtab.len() as u32, 0, 0, 0);

    out
}

/// Builds a NUL-separated string table, returning the offset of each
/// input string.
pub fn strtab(strings: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut bytes = Vec::new();
    let mut offsets = Vec::with_capacity(strings.len());
    for s in strings {
        offsets.push(bytes.len() as u32);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
    }
    (bytes, offsets)
}

/// `mov rax, [rbx + rcx*4 + 0x10]; ret`, the canonical memory-op
/// function used across the engine tests.
pub fn memop_function() -> Vec<u8> {
    vec![0x48, 0x8B, 0x44, 0x8B, 0x10, 0xC3]
}

/// A small counted loop:
/// `xor eax,eax; inc eax; cmp eax,10; jl .inc; ret`.
pub fn loop_function() -> Vec<u8> {
    vec![
        0x31, 0xC0, // xor eax, eax
        0xFF, 0xC0, // inc eax
        0x83, 0xF8, 0x0A, // cmp eax, 10
        0x7C, 0xF9, // jl back to inc
        0xC3, // ret
    ]
}
