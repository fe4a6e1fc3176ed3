use elf_rewriter::disasm::decode_next;
use elf_rewriter::insn::{
    DecodeMode, InsnFlags, InsnType, MemBase, Operand, REG_AX, REG_BX, REG_CX, REG_SP,
};
use rstest::rstest;

use DecodeMode::{Mode32, Mode64};

#[rstest]
#[case::nop(Mode64, &[0x90], 1)]
#[case::mov_rr(Mode64, &[0x48, 0x89, 0xD8], 3)]
#[case::push_rbp(Mode64, &[0x55], 1)]
#[case::push_r12(Mode64, &[0x41, 0x54], 2)]
#[case::sub_rsp_imm8(Mode64, &[0x48, 0x83, 0xEC, 0x18], 4)]
#[case::call_rel32(Mode64, &[0xE8, 0x00, 0x00, 0x00, 0x00], 5)]
#[case::je_rel32(Mode64, &[0x0F, 0x84, 0x10, 0x00, 0x00, 0x00], 6)]
#[case::mov_rip_rel(Mode64, &[0x48, 0x8B, 0x05, 0x44, 0x33, 0x22, 0x11], 7)]
#[case::movss_load(Mode64, &[0xF3, 0x0F, 0x10, 0x44, 0x24, 0x08], 6)]
#[case::movdqa_store(Mode64, &[0x66, 0x0F, 0x7F, 0x41, 0x10], 5)]
#[case::ret(Mode64, &[0xC3], 1)]
#[case::jmp_indirect(Mode64, &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00], 6)]
#[case::movabs(Mode64, &[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8], 10)]
#[case::cmp_eax_imm8(Mode64, &[0x83, 0xF8, 0x0A], 3)]
#[case::syscall(Mode64, &[0x0F, 0x05], 2)]
#[case::rdtsc(Mode64, &[0x0F, 0x31], 2)]
#[case::in_imm(Mode64, &[0xE4, 0x10], 2)]
#[case::fadd_mem(Mode64, &[0xD8, 0x04, 0x24], 3)]
#[case::int_imm(Mode64, &[0xCD, 0x80], 2)]
#[case::lea_sib(Mode64, &[0x48, 0x8D, 0x04, 0x8B], 4)]
#[case::test_rr(Mode64, &[0x48, 0x85, 0xC0], 3)]
#[case::imul_imm8(Mode64, &[0x48, 0x6B, 0xF6, 0x10], 4)]
#[case::shl_imm(Mode64, &[0x48, 0xC1, 0xE6, 0x04], 4)]
#[case::long_nop(Mode64, &[0x0F, 0x1F, 0x44, 0x00, 0x00], 5)]
#[case::mov32_sib(Mode32, &[0x8B, 0x44, 0x8B, 0x10], 4)]
#[case::mov32_moffs(Mode32, &[0xA1, 0x44, 0x33, 0x22, 0x11], 5)]
#[case::jmp32_rel(Mode32, &[0xE9, 0x00, 0x01, 0x00, 0x00], 5)]
#[case::mov16_imm(Mode32, &[0x66, 0xB8, 0x34, 0x12], 4)]
#[case::push_es(Mode32, &[0x06], 1)]
fn decodes_lengths(#[case] mode: DecodeMode, #[case] bytes: &[u8], #[case] len: u32) {
    let insn = decode_next(mode, 0x1000, bytes).unwrap();
    assert_eq!(insn.len(), len, "length of {bytes:02x?}");
}

#[test]
fn decodes_sib_memory_operand() {
    // mov rax, [rbx + rcx*4 + 0x10]
    let insn = decode_next(Mode64, 0x1000, &[0x48, 0x8B, 0x44, 0x8B, 0x10]).unwrap();
    assert_eq!(insn.itype(), InsnType::Int);
    assert!(insn.is_memory_operation());
    let mem = insn.memory_operand().unwrap();
    assert_eq!(mem.base, MemBase::Gpr(REG_BX));
    assert_eq!(mem.index, Some(REG_CX));
    assert_eq!(mem.effective_scale(), 4);
    assert_eq!(mem.disp, 0x10);
    let touched = insn.touched_registers();
    assert!(touched.contains(REG_AX));
    assert!(touched.contains(REG_BX));
    assert!(touched.contains(REG_CX));
}

#[test]
fn decodes_rip_relative_operand() {
    // mov rax, [rip + 0x100]
    let insn = decode_next(Mode64, 0x40_0000, &[0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00]).unwrap();
    let mem = insn.memory_operand().unwrap();
    assert_eq!(mem.base, MemBase::Pc);
    assert_eq!(mem.disp, 0x100);
    assert!(insn.flags().contains(InsnFlags::PC_RELATIVE));
    assert_eq!(insn.pc_disp_offset(), Some(3));
}

#[test]
fn moffs_is_an_absolute_memory_operand() {
    let insn = decode_next(Mode32, 0x1000, &[0xA1, 0x44, 0x33, 0x22, 0x11]).unwrap();
    let mem = insn.memory_operand().unwrap();
    assert_eq!(mem.base, MemBase::None);
    assert_eq!(mem.disp, 0x11223344);
    assert!(insn.flags().contains(InsnFlags::READS_MEMORY));
    assert!(insn.is_memory_operation());
}

#[rstest]
#[case::jmp_short(&[0xEB, 0x05], 0x1007)]
#[case::jl_short(&[0x7C, 0xF9], 0xFFB)]
#[case::jne_near(&[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00], 0x1106)]
#[case::call(&[0xE8, 0xFB, 0xFF, 0xFF, 0xFF], 0x1000)]
fn resolves_branch_targets(#[case] bytes: &[u8], #[case] target: u64) {
    let insn = decode_next(Mode64, 0x1000, bytes).unwrap();
    assert_eq!(insn.branch_target(), Some(target));
    assert_eq!(
        insn.operand(elf_rewriter::insn::JUMP_TARGET_OPERAND),
        &Operand::ImmRel { target }
    );
}

#[test]
fn classifies_control_transfers() {
    let jl = decode_next(Mode64, 0, &[0x7C, 0x02]).unwrap();
    assert_eq!(jl.itype(), InsnType::CondBranch);
    assert!(jl.is_control());
    assert!(!jl.is_unconditional_branch());

    let jmp = decode_next(Mode64, 0, &[0xE9, 0, 0, 0, 0]).unwrap();
    assert!(jmp.is_unconditional_branch());

    let call = decode_next(Mode64, 0, &[0xE8, 0, 0, 0, 0]).unwrap();
    assert!(call.is_call());
    assert!(!call.is_unconditional_branch());
    assert!(call.touched_registers().contains(REG_SP));

    let ret = decode_next(Mode64, 0, &[0xC3]).unwrap();
    assert!(ret.is_return());

    let indirect = decode_next(Mode64, 0, &[0xFF, 0xD0]).unwrap();
    assert!(indirect.is_call());
    assert!(indirect.flags().contains(InsnFlags::INDIRECT));
    assert_eq!(indirect.branch_target(), None);
}

#[test]
fn lea_and_long_nops_are_not_memory_operations() {
    let lea = decode_next(Mode64, 0, &[0x48, 0x8D, 0x04, 0x8B]).unwrap();
    assert!(lea.memory_operand().is_some());
    assert!(!lea.is_memory_operation());

    let nop = decode_next(Mode64, 0, &[0x0F, 0x1F, 0x44, 0x00, 0x00]).unwrap();
    assert!(!nop.is_memory_operation());
}

#[test]
fn prefetch_and_io_classification() {
    let prefetch = decode_next(Mode64, 0, &[0x0F, 0x18, 0x09]).unwrap();
    assert_eq!(prefetch.itype(), InsnType::Prefetch);

    let io = decode_next(Mode64, 0, &[0xE4, 0x10]).unwrap();
    assert_eq!(io.itype(), InsnType::Io);

    let hw = decode_next(Mode64, 0, &[0x0F, 0x31]).unwrap();
    assert_eq!(hw.itype(), InsnType::HwCount);
    assert!(hw.touched_registers().contains(REG_AX));
}

#[test]
fn rejects_truncated_and_invalid_encodings() {
    assert!(decode_next(Mode64, 0, &[0x48, 0x8B]).is_err());
    assert!(decode_next(Mode64, 0, &[0x0F, 0x0A]).is_err());
    // inc via 0x40 is a REX prefix in 64-bit mode, an opcode in 32-bit.
    assert!(decode_next(Mode64, 0, &[0x40]).is_err());
    assert_eq!(decode_next(Mode32, 0, &[0x40]).unwrap().len(), 1);
    // push es exists only in 32-bit mode.
    assert!(decode_next(Mode64, 0, &[0x06]).is_err());
}

#[test]
fn group_encodings_pick_the_member_operation() {
    let not = decode_next(Mode64, 0, &[0xF7, 0xD0]).unwrap();
    assert_eq!(not.mnemonic(), "not");
    assert_eq!(not.len(), 2);

    // test r/m32, imm32 keeps its immediate.
    let test = decode_next(Mode64, 0, &[0xF7, 0xC0, 1, 0, 0, 0]).unwrap();
    assert_eq!(test.mnemonic(), "test");
    assert_eq!(test.len(), 6);

    let mul = decode_next(Mode64, 0, &[0xF7, 0xE3]).unwrap();
    assert_eq!(mul.mnemonic(), "mul");
    assert!(mul.touched_registers().contains(REG_AX));
}
