mod common;

use common::{Fixture, Sym};
use elf_rewriter::inst::{wrap_cursor, thread};
use elf_rewriter::insn::{MemBase, MemOperand, Operand, Instruction, JUMP_TARGET_OPERAND};
use elf_rewriter::{
    BufferSpec, ElfImage, Error, InstMode, Instrumentor, RewriteContext, BUFFER_ENTRY_SIZE,
    DEFAULT_BUFFER_ENTRIES,
};
use rstest::rstest;

const SIM_FUNCTION: &str = "MetaSim_simulFuncCall_Simu";
const EXIT_FUNCTION: &str = "MetaSim_endFuncCall_Simu";
const INST_LIB_NAME: &str = "libsimulator.so";

fn dynamic_fixture() -> Vec<u8> {
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
    .with_dynamic()
    .build64()
}

fn engine(ctx: RewriteContext) -> Instrumentor {
    let image = ElfImage::parse("app", dynamic_fixture()).unwrap();
    Instrumentor::new(image, ctx).unwrap()
}

fn named_ctx() -> RewriteContext {
    RewriteContext {
        app_name: "app".into(),
        ..RewriteContext::default()
    }
}

#[test]
fn phases_gate_the_api() {
    let mut engine = engine(RewriteContext::default());
    // Reserve operations are not declare-phase operations.
    assert!(matches!(
        engine.reserve_data_offset(8),
        Err(Error::WrongPhase { .. })
    ));
    engine.declare_library(INST_LIB_NAME).unwrap();
    let f = engine.declare_function(SIM_FUNCTION).unwrap();
    engine.finish_declare().unwrap();
    // ... and declare operations are over once reservation starts.
    assert!(matches!(
        engine.declare_library("late.so"),
        Err(Error::WrongPhase { .. })
    ));
    assert!(matches!(
        engine.declare_function("late"),
        Err(Error::WrongPhase { .. })
    ));
    assert!(matches!(
        engine.finish_declare(),
        Err(Error::WrongPhase { .. })
    ));
    let addr = common::BASE_64 + common::TEXT_OFF;
    engine.add_point(addr, f, InstMode::Tramp).unwrap();
}

#[test]
fn reserved_offsets_are_disjoint_and_stable() {
    let mut engine = engine(RewriteContext::default());
    engine.finish_declare().unwrap();
    let a = engine.reserve_data_offset(16).unwrap();
    let b = engine.reserve_data_offset(24).unwrap();
    let c = engine.reserve_data_offset(1).unwrap();
    assert!(a + 16 <= b);
    assert!(b + 24 <= c);
    assert!(engine.reserved_extent() > c);
    // Arena exhaustion is fatal.
    assert!(matches!(
        engine.reserve_data_offset(u64::MAX / 2),
        Err(Error::ReservedExhausted { .. })
    ));
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(0xFFFF)]
#[case(0x10000)]
#[case(0x10001)]
#[case(12_345_678)]
#[case(u32::MAX)]
fn cursor_wrap_is_modular(#[case] cursor: u32) {
    assert_eq!(
        wrap_cursor(cursor, DEFAULT_BUFFER_ENTRIES),
        cursor % DEFAULT_BUFFER_ENTRIES
    );
    assert_eq!(wrap_cursor(cursor, 256), cursor % 256);
}

#[test]
fn thread_hash_contract() {
    assert_eq!(thread::hash_thread(0), 0);
    assert_eq!(thread::hash_thread(0x1000), 1);
    assert_eq!(thread::hash_thread(0x7f5a_3c00_1000), 0xC001);
    let mut occupied = vec![0u64; thread::THREAD_TABLE_SLOTS as usize];
    let tid_a = 0x1000;
    let slot_a = thread::probe_slot(&occupied, tid_a).unwrap();
    assert_eq!(slot_a, 1);
    occupied[slot_a as usize] = tid_a;
    // Re-probing an owned slot finds it again.
    assert_eq!(thread::probe_slot(&occupied, tid_a), Some(1));
}

fn reserve_buffers(engine: &mut Instrumentor) -> BufferSpec {
    let buffer_store = engine
        .reserve_data_offset((DEFAULT_BUFFER_ENTRIES * BUFFER_ENTRY_SIZE) as u64)
        .unwrap();
    let cursor_store = engine.reserve_data_offset(8).unwrap();
    // Cursor starts at 1; 0 marks an empty thread-hash slot.
    engine
        .initialize_reserved_data(cursor_store, &1u32.to_le_bytes())
        .unwrap();
    BufferSpec {
        buffer_store,
        cursor_store,
        entries: DEFAULT_BUFFER_ENTRIES,
    }
}

#[test]
fn memop_precursor_has_the_canonical_shape() {
    let mut engine = engine(RewriteContext::default());
    let _f = engine.declare_function(SIM_FUNCTION).unwrap();
    engine.finish_declare().unwrap();
    let buffers = reserve_buffers(&mut engine);

    let addr = common::BASE_64 + common::TEXT_OFF;
    let insn = engine.instruction_at_addr(addr).unwrap().clone();
    let pre = engine.buffered_address_calc(&insn, 3, 7, &buffers).unwrap();

    let mnemonics: Vec<&str> = pre.iter().map(|i| i.mnemonic()).collect();
    assert_eq!(
        mnemonics,
        [
            "mov", "mov", "mov", // spill the temporaries
            "mov", "add", // base + displacement
            "mov", "imul", "add", // index * scale
            "mov", "mov", // buffer base, cursor
            "shl", "add", "shr", // entry address
            "mov", "mov", "mov", "mov", "mov", // entry fields
            "add", "mov", "cmp", // cursor advance and test
            "mov", "mov", "mov", // restore the temporaries
            "jl", // skip the call while the buffer has room
        ]
    );
    assert_eq!(pre.len(), 25);

    // The temporaries avoid everything the instruction touches (rax,
    // rbx, rcx) and are drawn top-down from the pool.
    let temps: Vec<u8> = pre[..3]
        .iter()
        .map(|i| match i.operands()[1] {
            Operand::Reg(r) => r.0,
            ref other => panic!("spill stores a register, got {other:?}"),
        })
        .collect();
    assert_eq!(temps, [15, 14, 13]);

    // Entry ids land in the immediates feeding the field stores.
    assert_eq!(pre[14].operands()[1], Operand::Imm(3));
    assert_eq!(pre[16].operands()[1], Operand::Imm(7));
    // The scale multiplier is the encoded one.
    assert_eq!(pre[6].operands()[1], Operand::Imm(4));
    // The final branch skips a fixed-size call-support block.
    match pre[24].operands()[0] {
        Operand::Imm(skip) => assert!(skip > 0),
        ref other => panic!("jl carries its offset, got {other:?}"),
    }
}

#[test]
fn pc_relative_base_materializes_the_next_address() {
    let mut engine = engine(RewriteContext::default());
    engine.finish_declare().unwrap();
    let buffers = reserve_buffers(&mut engine);

    // mov rax, [rip + 0x100] decoded at an arbitrary address.
    let addr = 0x41_2340u64;
    let insn = elf_rewriter::disasm::decode_next(
        engine.image().decode_mode(),
        addr,
        &[0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00],
    )
    .unwrap();
    let pre = engine.buffered_address_calc(&insn, 0, 0, &buffers).unwrap();
    // After the three spills: the PC materialization, then the
    // displacement add.
    assert_eq!(pre[3].mnemonic(), "mov");
    assert_eq!(pre[3].operands()[1], Operand::Imm((addr + 7) as i64));
    assert_eq!(pre[4].mnemonic(), "add");
    assert_eq!(pre[4].operands()[1], Operand::Imm(0x100));
}

#[test]
fn thirty_two_bit_path_mirrors_the_sixty_four_bit_one() {
    let image = ElfImage::parse("app32", common::build32(&common::loop_function(), "spin"))
        .unwrap();
    let mut engine = Instrumentor::new(image, RewriteContext::default()).unwrap();
    engine.finish_declare().unwrap();
    let buffer_store = engine.reserve_data_offset(4096).unwrap();
    let cursor_store = engine.reserve_data_offset(8).unwrap();
    let buffers = BufferSpec {
        buffer_store,
        cursor_store,
        entries: 256,
    };

    // A PC-relative operand fed to the 32-bit generator materializes
    // the fall-through address exactly like the 64-bit path.
    let insn = Instruction::from_encoding(
        vec![0x8D, 0x80, 0x00, 0x01, 0x00, 0x00],
        "lea",
        [
            Operand::Reg(elf_rewriter::insn::REG_AX),
            Operand::Mem(MemOperand {
                base: MemBase::Pc,
                index: None,
                scale: 0,
                disp: 0x100,
                segment: None,
            }),
            Operand::Unused,
        ],
    );
    let pre = engine.buffered_address_calc(&insn, 0, 0, &buffers).unwrap();
    assert_eq!(pre[3].operands()[1], Operand::Imm(insn.len() as i64));
    assert_eq!(pre[4].operands()[1], Operand::Imm(0x100));
    // Temporaries come from the eight-register pool.
    for insn in &pre[..3] {
        match insn.operands()[1] {
            Operand::Reg(r) => assert!(r.0 < 8),
            ref other => panic!("expected a register spill, got {other:?}"),
        }
    }
}

#[test]
fn short_function_without_jump_room_aborts() {
    // Exactly four bytes ending in ret.
    let fixture = Fixture::new(
        vec![0x53, 0x5B, 0x90, 0xC3],
        vec![Sym {
            name: "tiny",
            text_off: 0,
            size: 4,
            is_func: true,
        }],
    )
    .with_dynamic();
    let image = ElfImage::parse("tiny", fixture.build64()).unwrap();
    let mut engine = Instrumentor::new(image, RewriteContext::default()).unwrap();
    let f = engine.declare_function(EXIT_FUNCTION).unwrap();
    engine.finish_declare().unwrap();
    engine
        .add_point(common::BASE_64 + common::TEXT_OFF, f, InstMode::Tramp)
        .unwrap();
    assert!(matches!(
        engine.emit(),
        Err(Error::NoRoomForJump { .. })
    ));
}

#[test]
fn zero_instrumentation_emit_is_byte_identical() {
    let bytes = dynamic_fixture();
    let image = ElfImage::parse("app", bytes.clone()).unwrap();
    let mut engine = Instrumentor::new(image, RewriteContext::default()).unwrap();
    engine.finish_declare().unwrap();
    assert_eq!(engine.emit().unwrap(), bytes);
}

#[test]
fn emit_rewrites_the_image_end_to_end() {
    let bytes = dynamic_fixture();
    let image = ElfImage::parse("app", bytes.clone()).unwrap();
    let orig_entry = image.ehdr.e_entry;
    let orig_phnum = image.ehdr.e_phnum;
    let mut engine = Instrumentor::new(image, named_ctx()).unwrap();

    engine.declare_library(INST_LIB_NAME).unwrap();
    let sim = engine.declare_function(SIM_FUNCTION).unwrap();
    let _exit = engine.declare_function(EXIT_FUNCTION).unwrap();
    engine.finish_declare().unwrap();

    let buffers = reserve_buffers(&mut engine);
    let comment_off = engine.write_comment_block("siminst", 0).unwrap();

    let ops = engine.exposed_memory_ops();
    assert_eq!(ops.len(), 1, "one probe-eligible memory op in the fixture");
    let op = ops[0];
    let target = op.addr;
    let pt = engine.add_point(target, sim, InstMode::TrampInline).unwrap();
    let insn = engine.instruction_at_addr(target).unwrap().clone();
    let pre = engine
        .buffered_address_calc(&insn, op.block_id, op.memop_id, &buffers)
        .unwrap();
    engine.point_mut(pt).unwrap().add_precursors(pre);

    let data_base = engine.inst_data_address();
    let out = engine.emit().unwrap();

    // The output parses and keeps the entry point and segment order,
    // with the two new load segments appended.
    let rewritten = ElfImage::parse("app.inst", out).unwrap();
    assert_eq!(rewritten.ehdr.e_entry, orig_entry);
    assert_eq!(rewritten.ehdr.e_phnum, orig_phnum + 2);
    assert!(rewritten
        .shdrs
        .iter()
        .any(|s| s.name == ".instcode" && s.is_text()));
    let instdata = rewritten
        .shdrs
        .iter()
        .find(|s| s.name == ".instdata")
        .expect("reserved data section");
    assert_eq!(instdata.addr, data_base);

    // The probed instruction now opens with a long jump into the
    // trampoline region.
    let text = rewritten.section_data(1).unwrap();
    assert_eq!(text[0], 0xE9);
    let rel = i32::from_le_bytes(text[1..5].try_into().unwrap());
    let jump_target = (target + 5).wrapping_add_signed(rel as i64);
    let instcode = rewritten
        .shdrs
        .iter()
        .find(|s| s.name == ".instcode")
        .unwrap();
    assert!(instcode.in_range(jump_target));

    // Tool wiring: an extra DT_NEEDED, undefined import symbols, and
    // relocations filling their address slots.
    let dynamic = rewritten.dynamic().unwrap();
    assert_eq!(dynamic.needed_offsets().len(), 2);
    let dynsym = rewritten.dynsym().unwrap();
    let sim_sym = dynsym.lookup(SIM_FUNCTION).expect("imported tool symbol");
    assert_eq!(sim_sym.shndx, 0);
    assert!(dynsym.lookup(EXIT_FUNCTION).is_some());

    // Unmoved symbols keep their values.
    let symtab = rewritten.symtabs().next().unwrap();
    assert_eq!(
        symtab.lookup("spin").unwrap().value,
        common::BASE_64 + common::TEXT_OFF + 6
    );

    // The comment block sits in the emitted data image:
    // "<appName> <phaseId> <extension> <exposedBlockCount> <dumpCode>".
    let data = rewritten.section_data(instdata.index).unwrap();
    let comment = &data[comment_off as usize..];
    let comment = &comment[..comment.iter().position(|b| *b == 0).unwrap()];
    let expected = format!("app 0 siminst {} 0", 1 + 3);
    assert_eq!(core::str::from_utf8(comment).unwrap(), expected);

    // The cursor starts at 1.
    assert_eq!(data[buffers.cursor_store as usize], 1);
}

fn has_bytes(hay: &[u8], needle: &[u8]) -> bool {
    hay.windows(needle.len()).any(|w| w == needle)
}

fn instcode_of(out: &[u8]) -> Vec<u8> {
    let image = ElfImage::parse("out", out.to_vec()).unwrap();
    let shdr = image
        .shdrs
        .iter()
        .find(|s| s.name == ".instcode")
        .expect("trampoline code section");
    image.section_data(shdr.index).unwrap().to_vec()
}

fn plant_memop(mode: InstMode) -> Vec<u8> {
    let mut engine = engine(RewriteContext::default());
    engine.declare_library(INST_LIB_NAME).unwrap();
    let sim = engine.declare_function(SIM_FUNCTION).unwrap();
    engine.finish_declare().unwrap();
    let buffers = reserve_buffers(&mut engine);
    let addr = common::BASE_64 + common::TEXT_OFF;
    let pt = engine.add_point(addr, sim, mode).unwrap();
    let insn = engine.instruction_at_addr(addr).unwrap().clone();
    let pre = engine.buffered_address_calc(&insn, 0, 0, &buffers).unwrap();
    engine.point_mut(pt).unwrap().add_precursors(pre);
    engine.emit().unwrap()
}

#[test]
fn tramp_calls_unconditionally_trampinline_keeps_the_guard() {
    let out_tramp = plant_memop(InstMode::Tramp);
    let out_inline = plant_memop(InstMode::TrampInline);
    assert_ne!(out_tramp, out_inline, "the two modes must plant differently");

    // The guard: jl rel32 skipping the 151-byte call-support block.
    // The 6-byte memop function is too narrow for inline emission, so
    // a trampinline point falls back to the out-of-line layout and the
    // guard survives in the trampoline; a tramp point drops it.
    const GUARD: [u8; 6] = [0x0F, 0x8C, 0x97, 0x00, 0x00, 0x00];
    assert!(
        !has_bytes(&instcode_of(&out_tramp), &GUARD),
        "a tramp point must call the tool unconditionally"
    );
    assert!(has_bytes(&instcode_of(&out_inline), &GUARD));
}

#[test]
fn trampinline_inlines_precursors_at_a_wide_site() {
    // A straight-line function wide enough to hold the precursor
    // sequence in place of the instructions it displaces.
    let mut text = vec![0x48, 0x8B, 0x03]; // mov rax, [rbx]
    for _ in 0..59 {
        text.extend_from_slice(&[0x48, 0x89, 0xD8]); // mov rax, rbx
    }
    text.push(0xC3);
    let size = text.len() as u64;
    let fixture = Fixture::new(
        text,
        vec![Sym {
            name: "wide_copy",
            text_off: 0,
            size,
            is_func: true,
        }],
    )
    .with_dynamic();
    let image = ElfImage::parse("wide", fixture.build64()).unwrap();
    let mut engine = Instrumentor::new(image, RewriteContext::default()).unwrap();
    engine.declare_library(INST_LIB_NAME).unwrap();
    let sim = engine.declare_function(SIM_FUNCTION).unwrap();
    engine.finish_declare().unwrap();
    let buffers = reserve_buffers(&mut engine);

    let addr = common::BASE_64 + common::TEXT_OFF;
    let pt = engine.add_point(addr, sim, InstMode::TrampInline).unwrap();
    let insn = engine.instruction_at_addr(addr).unwrap().clone();
    let pre = engine.buffered_address_calc(&insn, 0, 0, &buffers).unwrap();
    let first_spill = pre[0].bytes().to_vec();
    engine.point_mut(pt).unwrap().add_precursors(pre);

    let out = engine.emit().unwrap();
    let rewritten = ElfImage::parse("wide.inst", out).unwrap();
    let text = rewritten.section_data(1).unwrap();

    // The site opens with the flags save and the precursor sequence,
    // not with a long jump.
    assert_eq!(text[0], 0x9C, "inline sites start with pushf");
    assert_eq!(&text[1..1 + first_spill.len()], &first_spill[..]);
    // On the fast path the guard hops only the 5-byte slow jump.
    assert!(has_bytes(text, &[0x0F, 0x8C, 0x05, 0x00, 0x00, 0x00]));
    // The slow path still jumps out to the call-support block.
    assert!(text.contains(&0xE9));
}

#[test]
fn points_reject_unknown_targets() {
    let mut engine = engine(RewriteContext::default());
    let f = engine.declare_function(SIM_FUNCTION).unwrap();
    engine.finish_declare().unwrap();
    // Not a code address.
    assert!(engine.add_point(0x1000, f, InstMode::Tramp).is_err());
    // Mid-instruction.
    assert!(engine
        .add_point(common::BASE_64 + common::TEXT_OFF + 1, f, InstMode::Tramp)
        .is_err());
}

#[test]
fn branch_targets_resolve_in_the_loop_function() {
    let engine = engine(RewriteContext::default());
    let jl_addr = common::BASE_64 + common::TEXT_OFF + 6 + 7;
    let insn = engine.instruction_at_addr(jl_addr).unwrap();
    assert_eq!(insn.mnemonic(), "jl");
    match insn.operands()[JUMP_TARGET_OPERAND] {
        Operand::ImmRel { target } => {
            assert_eq!(target, common::BASE_64 + common::TEXT_OFF + 6 + 2);
        }
        ref other => panic!("expected a branch target, got {other:?}"),
    }
}
