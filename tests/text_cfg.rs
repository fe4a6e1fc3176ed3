mod common;

use common::{Fixture, Sym};
use elf_rewriter::text::{TextObject, TextSection};
use elf_rewriter::ElfImage;

fn two_function_fixture() -> Fixture {
    let mut text = common::memop_function();
    text.extend_from_slice(&common::loop_function());
    Fixture::new(
        text,
        vec![
            Sym {
                name: "load_elem",
                text_off: 0,
                size: 6,
                is_func: true,
            },
            Sym {
                name: "spin",
                text_off: 6,
                size: 10,
                is_func: true,
            },
        ],
    )
}

fn discover_and_digest(image: &ElfImage, section: usize) -> TextSection {
    let mut text = TextSection::discover(image, section).unwrap();
    text.digest(image).unwrap();
    text
}

#[test]
fn partitions_text_into_sorted_functions() {
    let image = ElfImage::parse("f", two_function_fixture().build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    assert_eq!(text.objects.len(), 2);
    assert!(text.objects.iter().all(|o| o.is_function()));
    assert_eq!(text.objects[0].name(), "load_elem");
    assert_eq!(text.objects[1].name(), "spin");
    assert_eq!(text.objects[0].size_in_bytes(), 6);
    assert_eq!(text.objects[1].size_in_bytes(), 10);
    assert!(text.objects[0].base_addr() < text.objects[1].base_addr());
    text.verify(&image).unwrap();
}

#[test]
fn disassembly_is_total_over_each_function() {
    let image = ElfImage::parse("f", two_function_fixture().build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    for object in &text.objects {
        let TextObject::Function(f) = object else {
            panic!("expected functions only");
        };
        let graph = f.flow_graph().unwrap();
        let total: u64 = graph
            .blocks
            .iter()
            .flat_map(|b| b.instructions())
            .map(|i| i.len() as u64)
            .sum();
        assert_eq!(total, f.size_in_bytes());
    }
}

#[test]
fn every_instruction_belongs_to_exactly_one_block() {
    let image = ElfImage::parse("f", two_function_fixture().build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    let TextObject::Function(spin) = &text.objects[1] else {
        panic!();
    };
    let graph = spin.flow_graph().unwrap();
    let mut addrs: Vec<u64> = graph
        .blocks
        .iter()
        .flat_map(|b| b.instructions())
        .map(|i| i.addr())
        .collect();
    assert_eq!(addrs.len(), 5);
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), 5, "an instruction appeared in two blocks");
    // Every block keeps control transfers at its end only.
    for block in &graph.blocks {
        let insns = block.instructions();
        for insn in &insns[..insns.len() - 1] {
            assert!(!insn.is_control());
        }
    }
}

#[test]
fn detects_the_natural_loop() {
    let image = ElfImage::parse("f", two_function_fixture().build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    let TextObject::Function(spin) = &text.objects[1] else {
        panic!();
    };
    let graph = spin.flow_graph().unwrap();
    // xor | inc;cmp;jl | ret
    assert_eq!(graph.basic_block_count(), 3);
    assert_eq!(graph.loops.len(), 1);
    let l = &graph.loops[0];
    assert_eq!(l.members, vec![l.head]);
    assert_eq!(graph.blocks[l.head].depth, 1);
    assert_eq!(graph.blocks[0].depth, 0);
    // The loop body branches both to itself and to the exit block.
    let body = &graph.blocks[l.head];
    assert!(body.succs.contains(&l.head));
    assert_eq!(body.succs.len(), 2);
}

#[test]
fn plt_without_symbols_becomes_one_free_text() {
    let plt = {
        let mut v = vec![0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];
        v.resize(16, 0x90);
        v
    };
    let fixture = two_function_fixture().with_plt(plt);
    let image = ElfImage::parse("f", fixture.build64()).unwrap();
    let text = discover_and_digest(&image, 2);
    assert_eq!(text.objects.len(), 1);
    let TextObject::FreeText(ft) = &text.objects[0] else {
        panic!("a symbol-less section must become free text");
    };
    assert!(ft.uses_instructions);
    assert_eq!(ft.base_addr(), fixture.plt_vaddr());
    assert_eq!(ft.size_in_bytes(), 16);
    let block = ft.code_block().unwrap();
    assert_eq!(block.instructions()[0].len(), 6);
    assert_eq!(block.instruction_count(), 11);
    text.verify(&image).unwrap();
}

#[test]
fn stripped_text_degrades_to_free_text() {
    let fixture = Fixture::new(common::memop_function(), vec![]);
    let image = ElfImage::parse("f", fixture.build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    assert_eq!(text.objects.len(), 1);
    assert!(matches!(text.objects[0], TextObject::FreeText(_)));
}

#[test]
fn truncates_the_tail_instruction_of_a_short_symbol() {
    // The first symbol claims three bytes of a five-byte instruction;
    // the overrun is cut and treated as raw bytes downstream.
    let fixture = Fixture::new(
        common::memop_function(),
        vec![
            Sym {
                name: "head",
                text_off: 0,
                size: 3,
                is_func: true,
            },
            Sym {
                name: "tail",
                text_off: 3,
                size: 3,
                is_func: true,
            },
        ],
    );
    let image = ElfImage::parse("f", fixture.build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    let TextObject::Function(head) = &text.objects[0] else {
        panic!();
    };
    let graph = head.flow_graph().unwrap();
    let total: u64 = graph
        .blocks
        .iter()
        .flat_map(|b| b.instructions())
        .map(|i| i.len() as u64)
        .sum();
    assert_eq!(total, 3);
}

#[test]
fn duplicate_symbol_values_collapse() {
    let fixture = Fixture::new(
        common::memop_function(),
        vec![
            Sym {
                name: "load_elem",
                text_off: 0,
                size: 6,
                is_func: true,
            },
            Sym {
                name: "load_elem_alias",
                text_off: 0,
                size: 6,
                is_func: true,
            },
        ],
    );
    let image = ElfImage::parse("f", fixture.build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    assert_eq!(text.objects.len(), 1);
}

#[test]
fn looks_instructions_up_by_address() {
    let image = ElfImage::parse("f", two_function_fixture().build64()).unwrap();
    let text = discover_and_digest(&image, 1);
    let base = common::BASE_64 + common::TEXT_OFF;
    assert!(text.object_at_addr(base).is_some());
    assert!(text.object_at_addr(base + 6).is_some());
    assert!(text.object_at_addr(base + 16).is_none());
    let insn = text.instruction_at_addr(base).unwrap();
    assert_eq!(insn.len(), 5);
    // Mid-instruction addresses do not resolve.
    assert!(text.instruction_at_addr(base + 1).is_none());
    assert_eq!(text.instruction_count(), 2 + 5);
    assert_eq!(text.basic_block_count(), 1 + 3);
    assert_eq!(text.memory_op_count(), 1);
}
