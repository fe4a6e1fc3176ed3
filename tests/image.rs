mod common;

use common::{Fixture, Sym};
use elf_rewriter::{ElfClass, ElfImage, Error, RawSection};

fn memop_fixture() -> Fixture {
    Fixture::new(
        common::memop_function(),
        vec![Sym {
            name: "load_elem",
            text_off: 0,
            size: 6,
            is_func: true,
        }],
    )
}

#[test]
fn parses_the_fixture_headers() {
    let bytes = memop_fixture().build64();
    let image = ElfImage::parse("fixture", bytes).unwrap();
    assert_eq!(image.class(), ElfClass::Elf64);
    assert!(image.ehdr.is_exec());
    assert_eq!(image.shdrs.len(), 10);
    assert_eq!(image.phdrs.len(), 1);
    assert_eq!(image.text_section_indices(), vec![1]);
    assert_eq!(image.shdrs[1].name, ".text");
    assert!(image.shdrs[1].in_range(common::BASE_64 + common::TEXT_OFF));
    assert!(!image.shdrs[1].in_range(common::BASE_64));
}

#[test]
fn resolves_symbols_through_the_string_table() {
    let bytes = memop_fixture().build64();
    let image = ElfImage::parse("fixture", bytes).unwrap();
    let symtab = image.symtabs().next().unwrap();
    let sym = symtab.lookup("load_elem").unwrap();
    assert_eq!(sym.value, common::BASE_64 + common::TEXT_OFF);
    assert_eq!(sym.size, 6);
    assert!(sym.is_function());
    assert!(sym.is_function_symbol_of(&image.shdrs[1]));
    assert!(!sym.is_text_object_symbol_of(&image.shdrs[1]));
}

#[test]
fn round_trips_byte_identical() {
    let bytes = memop_fixture().build64();
    let image = ElfImage::parse("fixture", bytes.clone()).unwrap();
    assert_eq!(image.dump(), bytes);
}

#[test]
fn round_trips_a_dynamic_image() {
    let bytes = memop_fixture().with_dynamic().build64();
    let image = ElfImage::parse("fixture", bytes.clone()).unwrap();
    let dynamic = image.dynamic().unwrap();
    assert_eq!(dynamic.needed_offsets().len(), 1);
    let dynsym = image.dynsym().unwrap();
    assert_eq!(dynsym.count_syms(), 1);
    assert_eq!(image.dump(), bytes);
}

#[test]
fn rejects_bad_magic() {
    let mut bytes = memop_fixture().build64();
    bytes[0] = b'F';
    assert!(matches!(
        ElfImage::parse("fixture", bytes),
        Err(Error::ElfMalformed { .. })
    ));
}

#[test]
fn rejects_machine_class_mismatch() {
    let mut bytes = memop_fixture().build64();
    // EM_386 in a 64-bit file.
    bytes[18] = 3;
    assert!(matches!(
        ElfImage::parse("fixture", bytes),
        Err(Error::ElfMalformed { .. })
    ));
}

#[test]
fn rejects_section_past_the_end_of_file() {
    let mut bytes = memop_fixture().build64();
    // Blow up .text's sh_size.
    let at = (common::SHDR_OFF + 64 + 32) as usize;
    bytes[at..at + 8].copy_from_slice(&u64::MAX.to_le_bytes()[..8]);
    assert!(matches!(
        ElfImage::parse("fixture", bytes),
        Err(Error::ElfMalformed { .. })
    ));
}

#[test]
fn rejects_big_endian_input() {
    let mut bytes = memop_fixture().build64();
    bytes[5] = 2;
    assert!(matches!(
        ElfImage::parse("fixture", bytes),
        Err(Error::ElfMalformed { .. })
    ));
}

#[test]
fn parses_a_compiler_generated_object() {
    use object::write::{Object, StandardSection, Symbol, SymbolSection};
    use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let code = common::memop_function();
    let off = obj.append_section_data(text, &code, 16);
    obj.add_symbol(Symbol {
        name: b"load_elem".to_vec(),
        value: off,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    let bytes = obj.write().unwrap();

    let image = ElfImage::parse("generated", bytes.clone()).unwrap();
    assert_eq!(image.class(), ElfClass::Elf64);
    let symtab = image.symtabs().next().expect("object files carry a symtab");
    assert!(symtab.lookup("load_elem").is_some());
    assert!(image
        .sections
        .iter()
        .any(|s| matches!(s, RawSection::Text)));
    assert_eq!(image.dump(), bytes);
}

#[test]
fn parses_a_32_bit_image() {
    let bytes = common::build32(&common::loop_function(), "spin");
    let image = ElfImage::parse("fixture32", bytes.clone()).unwrap();
    assert_eq!(image.class(), ElfClass::Elf32);
    let symtab = image.symtabs().next().unwrap();
    assert_eq!(
        symtab.lookup("spin").unwrap().value,
        common::BASE_32 + 0x100
    );
    assert_eq!(image.dump(), bytes);
}
