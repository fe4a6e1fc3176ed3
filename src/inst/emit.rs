//! The emit pass: point planting, layout, and final ELF assembly.
//!
//! The rewritten file keeps every original byte at its original offset.
//! Each point's displaced range is overwritten in place with the site
//! bytes its mode asks for (a long jump, or the inlined precursor
//! sequence followed by one); all new material lands in two appended
//! `PT_LOAD` segments: executable trampoline code (which also hosts
//! the relocated program-header table) and the writable reserved-data
//! arena. Dynamic tables that must grow (`.dynstr`, `.dynsym`, the
//! dynamic relocations, and `.dynamic` itself) are copied into the
//! data segment and the section and program headers re-pointed at the
//! copies.

use super::trampoline::plant_point;
use super::{Instrumentor, PAGE_SIZE, RESERVED_DATA_CAP};
use crate::dynamic::DynamicTable;
use crate::ehdr::ElfClass;
use crate::error::{logic_error, reserved_exhausted, symbol_resolve_error, Result};
use crate::image::RawSection;
use crate::relocation::{RelocEntry, RelocationTable};
use crate::section::SectionHeader;
use crate::segment::ProgramHeader;
use crate::symbol::{StringTable, Symbol, SymbolTable};
use crate::text::TextObject;
use elf::abi::{
    DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ, DT_STRSZ, DT_STRTAB, DT_SYMTAB, PF_R, PF_W, PF_X,
    PT_DYNAMIC, PT_PHDR, R_X86_64_GLOB_DAT, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_PROGBITS,
    STB_GLOBAL, STT_FUNC,
};

use alloc::string::String;
use alloc::vec::Vec;

/// `R_386_GLOB_DAT`; the `elf` crate exposes only the x86-64 set.
const R_386_GLOB_DAT: u32 = 6;

/// Mapping of one displaced instruction into its trampoline copy.
struct MovedInsn {
    old_addr: u64,
    new_addr: u64,
    len: u32,
}

pub(crate) fn emit(engine: Instrumentor) -> Result<Vec<u8>> {
    // Nothing declared, nothing planted: the output is the input.
    if engine.points.is_empty() && engine.libraries.is_empty() && engine.tool_fns.is_empty() {
        return Ok(engine.image.dump());
    }

    let class = engine.image.class();
    let is64 = class.is_64();
    let save_base = engine.data_base + engine.reg_save_offset;

    // ----- Trampoline layout ------------------------------------------------

    let phdr_total = ((engine.image.phdrs.len() + 2) * class.phdr_size()) as u64;
    let mut code_cursor = (engine.code_base + phdr_total).next_multiple_of(16);
    let mut trampolines: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut moved: Vec<MovedInsn> = Vec::new();
    let mut text_patches: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut displaced_ranges: Vec<(u64, u64)> = Vec::new();

    let mut engine = engine;
    let mut points = core::mem::take(&mut engine.points);
    for point in points.iter_mut() {
        let func = engine
            .texts
            .iter()
            .find_map(|t| match t.object_at_addr(point.target_addr) {
                Some(TextObject::Function(f)) => Some(f),
                _ => None,
            })
            .ok_or_else(|| logic_error("point target left the function map"))?;
        let fn_slot_addr = engine.data_base + engine.tool_fns[point.tool_fn.0].slot_offset;
        let planted = plant_point(
            is64,
            engine.ctx.flags_protection,
            point.mode,
            &point.precursors,
            fn_slot_addr,
            save_base,
            func,
            point.target_addr,
            code_cursor,
        )?;
        point.inst_base_addr = code_cursor;

        text_patches.push((planted.displaced_addr, planted.site_bytes));
        displaced_ranges.push((
            planted.displaced_addr,
            planted.displaced_addr + planted.displaced_len as u64,
        ));

        for (old_addr, new_addr, len) in &planted.insn_map {
            moved.push(MovedInsn {
                old_addr: *old_addr,
                new_addr: *new_addr,
                len: *len,
            });
        }
        code_cursor = (code_cursor + planted.tramp_bytes.len() as u64).next_multiple_of(16);
        trampolines.push((point.inst_base_addr, planted.tramp_bytes));
        #[cfg(feature = "log")]
        log::trace!(
            "[Inst] {:?} point at {:#x} planted at {:#x}",
            point.mode,
            point.target_addr,
            point.inst_base_addr
        );
    }

    displaced_ranges.sort_unstable();
    for pair in displaced_ranges.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(logic_error(alloc::format!(
                "instrumentation points at {:#x} and {:#x} displace overlapping ranges",
                pair[0].0,
                pair[1].0
            )));
        }
    }

    let code_size = code_cursor - engine.code_base;

    // ----- Grown dynamic tables --------------------------------------------

    let mut grown = grow_dynamic_tables(
        &engine.image,
        &engine.libraries,
        &engine.tool_fns,
        class,
        engine.data_base,
    )?;

    // ----- Data region layout ----------------------------------------------

    let mut data_cursor = engine.reserved_extent().next_multiple_of(16);
    let dyn_offsets = {
        let mut place = |len: u64| {
            let at = data_cursor;
            data_cursor = (data_cursor + len).next_multiple_of(16);
            at
        };
        grown.as_ref().map(|g| {
            (
                place(g.dynstr.size_in_bytes() as u64),
                place((g.dynsym.count_syms() * class.sym_size()) as u64),
                place((g.dynrel.entries.len() * g.dynrel.entry_size()) as u64),
                place(g.dynamic.size_in_bytes() as u64),
            )
        })
    };
    let data_size = data_cursor;
    if data_size > RESERVED_DATA_CAP {
        return Err(reserved_exhausted(
            "reserved data plus relocated dynamic tables exceed the arena cap",
        ));
    }

    // ----- Clone and fix headers -------------------------------------------

    let mut ehdr = engine.image.ehdr.clone();
    let mut shdrs = engine.image.shdrs.clone();
    let mut phdrs = engine.image.phdrs.clone();

    let orig_len = engine.image.buffer().len() as u64;
    let code_file_off = orig_len.next_multiple_of(PAGE_SIZE);
    let data_file_off = (code_file_off + code_size).next_multiple_of(PAGE_SIZE);

    if let (Some(g), Some((dynstr_off, dynsym_off, dynrel_off, dynamic_off))) =
        (grown.as_ref(), dyn_offsets)
    {
        let to_file = |off: u64| data_file_off + off;
        let to_vaddr = |off: u64| engine.data_base + off;
        let fix = |shdr: &mut SectionHeader, off: u64, size: u64| {
            shdr.addr = to_vaddr(off);
            shdr.offset = to_file(off);
            shdr.size = size;
        };
        fix(
            &mut shdrs[g.dynstr_section],
            dynstr_off,
            g.dynstr.size_in_bytes() as u64,
        );
        fix(
            &mut shdrs[g.dynsym_section],
            dynsym_off,
            (g.dynsym.count_syms() * class.sym_size()) as u64,
        );
        fix(
            &mut shdrs[g.dynrel_section],
            dynrel_off,
            (g.dynrel.entries.len() * g.dynrel.entry_size()) as u64,
        );
        fix(
            &mut shdrs[g.dynamic_section],
            dynamic_off,
            g.dynamic.size_in_bytes() as u64,
        );
        for phdr in phdrs.iter_mut() {
            if phdr.p_type == PT_DYNAMIC {
                phdr.vaddr = to_vaddr(dynamic_off);
                phdr.paddr = phdr.vaddr;
                phdr.offset = to_file(dynamic_off);
                phdr.filesz = g.dynamic.size_in_bytes() as u64;
                phdr.memsz = phdr.filesz;
            }
        }
    }

    for phdr in phdrs.iter_mut() {
        if phdr.p_type == PT_PHDR {
            phdr.vaddr = engine.code_base;
            phdr.paddr = engine.code_base;
            phdr.offset = code_file_off;
            phdr.filesz = phdr_total;
            phdr.memsz = phdr_total;
        }
    }
    phdrs.push(ProgramHeader::new_load(
        class,
        PF_R | PF_X,
        code_file_off,
        engine.code_base,
        code_size,
        code_size,
        PAGE_SIZE,
    ));
    phdrs.push(ProgramHeader::new_load(
        class,
        PF_R | PF_W,
        data_file_off,
        engine.data_base,
        data_size,
        data_size,
        PAGE_SIZE,
    ));

    // ----- Relocation offsets and symbol values over moved code ------------

    let remap = |addr: u64| -> Option<u64> {
        moved
            .iter()
            .find(|m| addr >= m.old_addr && addr < m.old_addr + m.len as u64)
            .map(|m| m.new_addr + (addr - m.old_addr))
    };

    if let Some(g) = grown.as_mut() {
        for sym in g.dynsym.symbols.iter_mut() {
            if let Some(new) = remap(sym.value) {
                sym.value = new;
            }
        }
    }

    let mut inplace_writes: Vec<(u64, Vec<u8>)> = Vec::new();
    for (idx, section) in engine.image.sections.iter().enumerate() {
        match section {
            RawSection::Reloc(table) => {
                if grown
                    .as_ref()
                    .is_some_and(|g| g.dynrel_section == idx)
                {
                    continue;
                }
                let mut table = table.clone();
                let mut changed = false;
                for entry in table.entries.iter_mut() {
                    if let Some(new) = remap(entry.r_offset()) {
                        entry.set_offset(new);
                        changed = true;
                    }
                }
                if changed {
                    inplace_writes.push((engine.image.shdrs[idx].offset, table.serialize()));
                }
            }
            RawSection::SymTab(table) => {
                if grown
                    .as_ref()
                    .is_some_and(|g| g.dynsym_section == idx)
                {
                    continue;
                }
                let mut table = table.clone();
                let mut changed = false;
                for sym in table.symbols.iter_mut() {
                    if let Some(new) = remap(sym.value) {
                        sym.value = new;
                        changed = true;
                    }
                }
                if changed {
                    inplace_writes.push((engine.image.shdrs[idx].offset, table.serialize()));
                }
            }
            _ => {}
        }
    }

    // ----- Section additions ------------------------------------------------

    let shstrndx = ehdr.e_shstrndx as usize;
    let mut shstr = match &engine.image.sections[shstrndx] {
        RawSection::StrTab(t) => t.clone(),
        _ => StringTable::new(engine.image.section_data(shstrndx)?.to_vec()),
    };
    let code_name = shstr.add(".instcode");
    let data_name = shstr.add(".instdata");

    let mut code_shdr = SectionHeader::parse(class, &alloc::vec![0u8; class.shdr_size()], shdrs.len());
    code_shdr.name_idx = code_name;
    code_shdr.name = String::from(".instcode");
    code_shdr.sh_type = SHT_PROGBITS;
    code_shdr.flags = (SHF_ALLOC | SHF_EXECINSTR) as u64;
    code_shdr.addr = engine.code_base;
    code_shdr.offset = code_file_off;
    code_shdr.size = code_size;
    code_shdr.addralign = 16;

    let mut data_shdr = SectionHeader::parse(class, &alloc::vec![0u8; class.shdr_size()], shdrs.len() + 1);
    data_shdr.name_idx = data_name;
    data_shdr.name = String::from(".instdata");
    data_shdr.sh_type = SHT_PROGBITS;
    data_shdr.flags = (SHF_ALLOC | SHF_WRITE) as u64;
    data_shdr.addr = engine.data_base;
    data_shdr.offset = data_file_off;
    data_shdr.size = data_size;
    data_shdr.addralign = 8;

    shdrs.push(code_shdr);
    shdrs.push(data_shdr);

    let shstr_file_off = data_file_off + data_size;
    shdrs[shstrndx].offset = shstr_file_off;
    shdrs[shstrndx].size = shstr.size_in_bytes() as u64;

    let shoff = (shstr_file_off + shstr.size_in_bytes() as u64).next_multiple_of(8);
    ehdr.e_shoff = shoff;
    ehdr.e_shnum = shdrs.len() as u16;
    ehdr.e_shentsize = class.shdr_size() as u16;
    ehdr.e_phoff = code_file_off;
    ehdr.e_phnum = phdrs.len() as u16;
    ehdr.e_phentsize = class.phdr_size() as u16;

    // ----- Assembly ---------------------------------------------------------

    let mut out = engine.image.buffer().to_vec();

    for (addr, bytes) in &text_patches {
        let off = vaddr_to_file_off(&engine.image.shdrs, *addr)
            .ok_or_else(|| logic_error("displaced range outside any section"))?;
        out[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
    }
    for (off, bytes) in &inplace_writes {
        out[*off as usize..*off as usize + bytes.len()].copy_from_slice(bytes);
    }
    ehdr.dump(&mut out);

    // Code region: program headers, then trampolines.
    out.resize(code_file_off as usize, 0);
    let mut code_region = alloc::vec![0u8; code_size as usize];
    for (i, phdr) in phdrs.iter().enumerate() {
        phdr.dump(&mut code_region[i * class.phdr_size()..]);
    }
    for (base, bytes) in &trampolines {
        let off = (*base - engine.code_base) as usize;
        code_region[off..off + bytes.len()].copy_from_slice(bytes);
    }
    out.extend_from_slice(&code_region);

    // Data region: arena initializers, then the relocated tables.
    out.resize(data_file_off as usize, 0);
    let mut data_region = alloc::vec![0u8; data_size as usize];
    for (off, bytes) in &engine.reserved_inits {
        data_region[*off as usize..*off as usize + bytes.len()].copy_from_slice(bytes);
    }
    if let (Some(g), Some((dynstr_off, dynsym_off, dynrel_off, dynamic_off))) =
        (grown.as_ref(), dyn_offsets)
    {
        let write_at = |region: &mut [u8], off: u64, bytes: &[u8]| {
            region[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
        };
        write_at(&mut data_region, dynstr_off, g.dynstr.bytes());
        write_at(&mut data_region, dynsym_off, &g.dynsym.serialize());
        write_at(&mut data_region, dynrel_off, &g.dynrel.serialize());
        let mut dynamic = g.dynamic.clone();
        dynamic.set_value(DT_STRTAB, engine.data_base + dynstr_off);
        dynamic.set_value(DT_STRSZ, g.dynstr.size_in_bytes() as u64);
        dynamic.set_value(DT_SYMTAB, engine.data_base + dynsym_off);
        let (rel_tag, relsz_tag) = if g.dynrel.is_rela {
            (DT_RELA, DT_RELASZ)
        } else {
            (DT_REL, DT_RELSZ)
        };
        dynamic.set_value(rel_tag, engine.data_base + dynrel_off);
        dynamic.set_value(
            relsz_tag,
            (g.dynrel.entries.len() * g.dynrel.entry_size()) as u64,
        );
        write_at(&mut data_region, dynamic_off, &dynamic.serialize());
    }
    out.extend_from_slice(&data_region);

    // Tail: relocated section-name table and the section headers.
    out.extend_from_slice(shstr.bytes());
    out.resize(shoff as usize, 0);
    let shdr_size = class.shdr_size();
    let mut shdr_table = alloc::vec![0u8; shdr_size * shdrs.len()];
    for (i, shdr) in shdrs.iter().enumerate() {
        shdr.dump(&mut shdr_table[i * shdr_size..]);
    }
    out.extend_from_slice(&shdr_table);

    #[cfg(feature = "log")]
    log::trace!(
        "[Emit] {} points, code: {code_size:#x} bytes at {:#x}, data: {data_size:#x} bytes at {:#x}",
        points.len(),
        engine.code_base,
        engine.data_base
    );
    Ok(out)
}

fn vaddr_to_file_off(shdrs: &[SectionHeader], addr: u64) -> Option<u64> {
    shdrs
        .iter()
        .filter(|s| !s.is_nobits() && !s.is_null() && s.in_range(addr))
        .map(|s| s.offset + (addr - s.addr))
        .next()
}

/// The dynamic tables, grown with the declared libraries and tool
/// functions, plus the section indices they came from.
struct GrownDynamic {
    dynstr: StringTable,
    dynsym: SymbolTable,
    dynrel: RelocationTable,
    dynamic: DynamicTable,
    dynstr_section: usize,
    dynsym_section: usize,
    dynrel_section: usize,
    dynamic_section: usize,
}

fn grow_dynamic_tables(
    image: &crate::image::ElfImage,
    libraries: &[String],
    tool_fns: &[super::ToolFunctionInfo],
    class: ElfClass,
    data_base: u64,
) -> Result<Option<GrownDynamic>> {
    if libraries.is_empty() && tool_fns.is_empty() {
        return Ok(None);
    }
    let dynamic_section = image
        .dynamic_section_index()
        .ok_or_else(|| symbol_resolve_error("binary has no dynamic section"))?;
    let dynsym = image
        .dynsym()
        .ok_or_else(|| symbol_resolve_error("binary has no dynamic symbol table"))?;
    let dynsym_section = dynsym.section_index;
    let dynstr_section = dynsym.link;
    let dynstr = match &image.sections[dynstr_section] {
        RawSection::StrTab(t) => t.clone(),
        _ => return Err(symbol_resolve_error("dynamic string table missing")),
    };
    let (dynrel_section, dynrel) = image
        .sections
        .iter()
        .enumerate()
        .find_map(|(i, s)| match s {
            RawSection::Reloc(t) if t.symtab_link == dynsym_section && t.target_section == 0 => {
                Some((i, t.clone()))
            }
            _ => None,
        })
        .ok_or_else(|| {
            symbol_resolve_error("binary has no dynamic relocation table to extend")
        })?;
    let dynamic = match &image.sections[dynamic_section] {
        RawSection::Dynamic(t) => t.clone(),
        _ => return Err(symbol_resolve_error("binary has no dynamic section")),
    };

    let mut g = GrownDynamic {
        dynstr,
        dynsym: dynsym.clone(),
        dynrel,
        dynamic,
        dynstr_section,
        dynsym_section,
        dynrel_section,
        dynamic_section,
    };

    for lib in libraries {
        let off = g.dynstr.add(lib);
        g.dynamic.push_needed(off as u64);
    }

    let glob_dat = if class.is_64() {
        R_X86_64_GLOB_DAT
    } else {
        R_386_GLOB_DAT
    };
    let data_base_slot = |slot_offset: u64| data_base + slot_offset;
    for f in tool_fns {
        let name_idx = g.dynstr.add(&f.name);
        let sym_index = g.dynsym.symbols.len();
        g.dynsym.symbols.push(Symbol {
            name_idx,
            name: f.name.clone(),
            value: 0,
            size: 0,
            info: (STB_GLOBAL << 4) | STT_FUNC,
            other: 0,
            shndx: 0,
            index: sym_index,
        });
        let entry = if g.dynrel.is_rela {
            RelocEntry::new_rela(
                class,
                data_base_slot(f.slot_offset),
                sym_index as u32,
                glob_dat,
                0,
            )
        } else {
            RelocEntry::new_rel(class, data_base_slot(f.slot_offset), sym_index as u32, glob_dat)
        };
        g.dynrel.entries.push(entry);
    }
    Ok(Some(g))
}
