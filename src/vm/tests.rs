use super::*;
use crate::asm::Assembler;
use crate::isa::{self, Insn};
use crate::traps;
use crate::WORD_BIT;

const W: Word = WORD_BYTES as Word;

fn machine(words: UWord) -> Machine {
    Machine::new(words, 64, 64)
}

/// Renders the data stack bottom-first, the way the reference traces do.
fn stack_string(m: &Machine) -> String {
    m.data_stack()
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Steps once per expected stack picture, comparing after each step.
fn step_trace(m: &mut Machine, expected: &[String]) {
    for (i, correct) in expected.iter().enumerate() {
        let _ = m.step();
        assert_eq!(&stack_string(m), correct, "after step {}", i + 1);
    }
}

/// Assembles a program, appends BREAK, and runs it to the pause.
fn run_insns(setup: impl FnOnce(&mut Assembler)) -> Machine {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        setup(&mut a);
        a.insn(Insn::Break);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    m
}

/// Assembles a program and runs it to its (expected) fault.
fn run_err(setup: impl FnOnce(&mut Assembler)) -> (Machine, VmError) {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        setup(&mut a);
    }
    let err = m.run().expect_err("program should fault");
    (m, err)
}

// ==================== Literals ====================

#[test]
fn pushi_extremes_round_trip() {
    let max: Word = (1 << (WORD_BIT - isa::OP1_SHIFT - 1)) - 1;
    let min: Word = -(1 << (WORD_BIT - isa::OP1_SHIFT - 1));
    let m = run_insns(|a| {
        a.pushi(max);
        a.pushi(min);
    });
    assert_eq!(m.data_stack(), &[max, min]);
}

#[test]
fn pushreli_pushes_an_absolute_address() {
    let m = run_insns(|a| {
        a.pushreli(0x40);
    });
    assert_eq!(m.data_stack(), &[0x40]);
}

// ==================== Arithmetic ====================

#[test]
fn arithmetic_stepped_trace() {
    let mut m = machine(256);
    let mut correct: Vec<String> = Vec::new();
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushi(1);
        correct.push("1".into());
        a.insn(Insn::Neg);
        correct.push("-1".into());
        a.insn(Insn::WordBytes);
        correct.push(format!("-1 {}", W));
        a.pushi(-W);
        correct.push(format!("-1 {} -{}", W, W));
        a.pushi(0);
        correct.push(format!("-1 {} -{} 0", W, W));
        a.insn(Insn::Swap);
        correct.push(format!("-1 -{} {}", W, W));
        a.pushi(1);
        correct.push(format!("-1 -{} {} 1", W, W));
        a.insn(Insn::Swap);
        correct.push(format!("{} -{} -1", W, W));
        a.insn(Insn::Add);
        correct.push(format!("{} {}", W, -W - 1));
        a.insn(Insn::Add);
        correct.push("-1".into());
        a.insn(Insn::WordBytes);
        correct.push(format!("-1 {}", W));
        a.insn(Insn::Mul);
        correct.push(format!("-{}", W));
        a.pushi(W - 1);
        correct.push(format!("-{} {}", W, W - 1));
        a.insn(Insn::Divmod);
        correct.push("-1 -1".into());
        a.insn(Insn::Pop);
        correct.push("-1".into());
        a.pushi(-2);
        correct.push("-1 -2".into());
        a.insn(Insn::Udivmod);
        correct.push("1 1".into());
    }
    step_trace(&mut m, &correct);
}

#[test]
fn division_by_zero_is_defined() {
    let m = run_insns(|a| {
        a.pushi(5);
        a.pushi(0);
        a.insn(Insn::Divmod);
    });
    assert_eq!(m.data_stack(), &[0, 5]);

    let m = run_insns(|a| {
        a.pushi(5);
        a.pushi(0);
        a.insn(Insn::Udivmod);
    });
    assert_eq!(m.data_stack(), &[0, 5]);
}

#[test]
fn word_min_over_minus_one_is_defined() {
    let m = run_insns(|a| {
        a.pushi(1);
        a.insn(Insn::Neg);
        // Build WORD_MIN as 1 << (WORD_BIT - 1), then bring -1 to the top.
        a.pushi(1);
        a.pushi(WORD_BIT as Word - 1);
        a.insn(Insn::Lshift);
        a.pushi(0);
        a.insn(Insn::Swap);
        a.insn(Insn::Divmod);
    });
    assert_eq!(m.data_stack(), &[crate::WORD_MIN, 0]);
}

// ==================== Logic and shifts ====================

#[test]
fn bitwise_instructions() {
    let m = run_insns(|a| {
        a.pushi(0b1100);
        a.pushi(0b1010);
        a.insn(Insn::And);
        a.pushi(0b1100);
        a.pushi(0b1010);
        a.insn(Insn::Or);
        a.pushi(0b1100);
        a.pushi(0b1010);
        a.insn(Insn::Xor);
        a.pushi(0);
        a.insn(Insn::Not);
    });
    assert_eq!(m.data_stack(), &[0b1000, 0b1110, 0b0110, -1]);
}

#[test]
fn shifts_saturate_at_word_width() {
    let m = run_insns(|a| {
        a.pushi(1);
        a.pushi(4);
        a.insn(Insn::Lshift);
        a.pushi(1);
        a.pushi(WORD_BIT as Word);
        a.insn(Insn::Lshift);
        a.pushi(-1);
        a.pushi(1);
        a.insn(Insn::Rshift);
        a.pushi(-1);
        a.pushi(WORD_BIT as Word);
        a.insn(Insn::Rshift);
    });
    assert_eq!(m.data_stack(), &[16, 0, Word::MAX, 0]);
}

#[test]
fn arithmetic_shift_preserves_the_sign() {
    let m = run_insns(|a| {
        a.pushi(-8);
        a.pushi(1);
        a.insn(Insn::Arshift);
        a.pushi(-1);
        a.pushi(WORD_BIT as Word);
        a.insn(Insn::Arshift);
        a.pushi(1);
        a.pushi(WORD_BIT as Word);
        a.insn(Insn::Arshift);
    });
    assert_eq!(m.data_stack(), &[-4, -1, 0]);
}

// ==================== Comparison ====================

#[test]
fn comparisons_produce_boolean_words() {
    let m = run_insns(|a| {
        a.pushi(3);
        a.pushi(3);
        a.insn(Insn::Eq);
        a.pushi(3);
        a.pushi(4);
        a.insn(Insn::Eq);
        a.pushi(-1);
        a.pushi(1);
        a.insn(Insn::Lt);
        a.pushi(-1);
        a.pushi(1);
        a.insn(Insn::Ult);
        a.pushi(1);
        a.pushi(-1);
        a.insn(Insn::Ult);
    });
    assert_eq!(m.data_stack(), &[1, 0, 1, 0, 1]);
}

// ==================== Stack manipulation ====================

#[test]
fn dup_copies_by_depth() {
    let m = run_insns(|a| {
        a.pushi(3);
        a.pushi(2);
        a.pushi(1);
        a.insn(Insn::Dup);
    });
    assert_eq!(m.data_stack(), &[3, 2, 3]);
}

#[test]
fn dup_past_the_bottom_underflows() {
    let (m, err) = run_err(|a| {
        a.pushi(5);
        a.insn(Insn::Dup);
    });
    assert_eq!(err, VmError::StackUnderflow);
    // The depth operand is pushed back before the fault.
    assert_eq!(m.data_stack(), &[5]);
}

#[test]
fn set_writes_by_depth() {
    let m = run_insns(|a| {
        a.pushi(10);
        a.pushi(20);
        a.pushi(30);
        a.pushi(99);
        a.pushi(1);
        a.insn(Insn::Set);
    });
    assert_eq!(m.data_stack(), &[10, 99, 30]);
}

#[test]
fn swap_exchanges_with_the_top() {
    let m = run_insns(|a| {
        a.pushi(3);
        a.pushi(2);
        a.pushi(1);
        a.pushi(0);
        a.insn(Insn::Swap);
    });
    assert_eq!(m.data_stack(), &[3, 1, 2]);
}

#[test]
fn return_stack_helpers_move_words() {
    let m = run_insns(|a| {
        a.pushi(5);
        a.insn(Insn::Pushs);
        a.insn(Insn::Dups);
        a.insn(Insn::Pops);
    });
    assert_eq!(m.data_stack(), &[5, 5]);
    assert_eq!(m.sp(), 0);
}

// ==================== Control transfer ====================

#[test]
fn immediate_jump() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.jumpi(0x40);
        a.org(0x40);
        a.pushi(7);
        a.insn(Insn::Break);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    assert_eq!(m.data_stack(), &[7]);
    assert_eq!(m.pc(), 0x40 + WORD_BYTES);
}

#[test]
fn conditional_jump_takes_only_on_zero() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushi(0);
        a.jumpzi(0x40);
        a.org(0x40);
        a.pushi(1);
        a.jumpzi(0x80);
        a.insn(Insn::Break);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    // Second jump not taken: we stopped after it, not at 0x80.
    assert_eq!(m.pc(), 0x40 + 2 * WORD_BYTES);
}

#[test]
fn immediate_call_and_ret() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.calli(0x40);
        a.insn(Insn::Break);
        a.org(0x40);
        a.pushi(3);
        a.insn(Insn::Ret);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    assert_eq!(m.data_stack(), &[3]);
    assert_eq!(m.pc(), WORD_BYTES);
    assert_eq!(m.sp(), 0);
}

#[test]
fn computed_jump_and_call_check_alignment() {
    let (_, err) = run_err(|a| {
        a.pushi(1);
        a.insn(Insn::Jump);
    });
    assert_eq!(err, VmError::UnalignedAddress);

    let (_, err) = run_err(|a| {
        a.pushi(1);
        a.insn(Insn::Call);
    });
    assert_eq!(err, VmError::UnalignedAddress);

    let m = run_insns(|a| {
        a.pushreli(3 * WORD_BYTES);
        a.insn(Insn::Jump);
        a.insn(Insn::Undefined); // skipped
        a.pushi(9);
    });
    assert_eq!(m.data_stack(), &[9]);
}

// ==================== Memory ====================

#[test]
fn word_store_and_load() {
    let m = run_insns(|a| {
        a.pushi(0x123);
        a.pushi(0x100);
        a.insn(Insn::Store);
        a.pushi(0x100);
        a.insn(Insn::Load);
    });
    assert_eq!(m.data_stack(), &[0x123]);
}

#[test]
fn byte_store_and_load_need_no_alignment() {
    let m = run_insns(|a| {
        a.pushi(0xab);
        a.pushi(0x101);
        a.insn(Insn::Store1);
        a.pushi(0x101);
        a.insn(Insn::Load1);
    });
    assert_eq!(m.data_stack(), &[0xab]);
}

#[test]
fn narrow_access_checks_its_own_alignment() {
    let m = run_insns(|a| {
        a.pushi(0xbeef);
        a.pushi(0x102);
        a.insn(Insn::Store2);
        a.pushi(0x102);
        a.insn(Insn::Load2);
        a.pushi(0x1234abcd);
        a.pushi(0x104);
        a.insn(Insn::Store4);
        a.pushi(0x104);
        a.insn(Insn::Load4);
    });
    assert_eq!(m.data_stack(), &[0xbeef, 0x1234abcd]);

    let (_, err) = run_err(|a| {
        a.pushi(0x101);
        a.insn(Insn::Load2);
    });
    assert_eq!(err, VmError::UnalignedAddress);

    let (_, err) = run_err(|a| {
        a.pushi(0x102);
        a.insn(Insn::Load4);
    });
    assert_eq!(err, VmError::UnalignedAddress);

    let (_, err) = run_err(|a| {
        a.pushi(0x101);
        a.insn(Insn::Load);
    });
    assert_eq!(err, VmError::UnalignedAddress);
}

#[test]
fn stepped_access_modes_match_their_definitions() {
    let base = 0x100 as UWord;
    let mut m = machine(1024);
    m.store_word(base, 111).unwrap();
    m.store_word(base + WORD_BYTES, 222).unwrap();
    let w = WORD_BYTES as Word;

    let cases: &[(Insn, Word, &[Word])] = &[
        (Insn::LoadIa, base as Word, &[111, base as Word + w]),
        (Insn::LoadIb, base as Word, &[222, base as Word + w]),
        (Insn::LoadDa, (base + WORD_BYTES) as Word, &[222, base as Word]),
        (Insn::LoadDb, (base + WORD_BYTES) as Word, &[111, base as Word]),
    ];
    for (insn, addr, expect) in cases {
        m.dp = 0;
        m.push_data(*addr).unwrap();
        m.set_pc(0x800);
        {
            let mut a = Assembler::new(&mut m, 0x800);
            a.insn(*insn);
            a.insn(Insn::Break);
        }
        assert_eq!(m.run(), Err(VmError::Break));
        assert_eq!(m.data_stack(), *expect, "mode {:?}", insn);
    }

    let stores: &[(Insn, Word, UWord, Word)] = &[
        // (insn, start address, stored-at, result address)
        (Insn::StoreIa, base as Word, base, base as Word + w),
        (Insn::StoreIb, base as Word, base + WORD_BYTES, base as Word + w),
        (Insn::StoreDa, base as Word, base, base as Word - w),
        (Insn::StoreDb, base as Word, base - WORD_BYTES, base as Word - w),
    ];
    for (i, (insn, addr, stored_at, result)) in stores.iter().enumerate() {
        let value = 1000 + i as Word;
        m.dp = 0;
        m.push_data(value).unwrap();
        m.push_data(*addr).unwrap();
        m.set_pc(0x800);
        {
            let mut a = Assembler::new(&mut m, 0x800);
            a.insn(*insn);
            a.insn(Insn::Break);
        }
        assert_eq!(m.run(), Err(VmError::Break));
        assert_eq!(m.data_stack(), &[*result], "mode {:?}", insn);
        assert_eq!(m.load_word(*stored_at).unwrap(), value, "mode {:?}", insn);
    }
}

// ==================== Registers ====================

#[test]
fn register_instructions_report_machine_state() {
    let m = run_insns(|a| {
        a.insn(Insn::GetDsize);
        a.insn(Insn::GetSsize);
        a.insn(Insn::GetSp);
        a.insn(Insn::GetHandlerSp);
        a.insn(Insn::WordBytes);
        a.insn(Insn::GetDp);
    });
    assert_eq!(m.data_stack(), &[64, 64, 0, 0, W, 5]);
}

#[test]
fn set_dp_truncates_the_stack() {
    let m = run_insns(|a| {
        a.pushi(7);
        a.pushi(8);
        a.pushi(9);
        a.pushi(1);
        a.insn(Insn::SetDp);
    });
    assert_eq!(m.data_stack(), &[7]);
}

// ==================== Error injection (SET_DP/SET_SP) ====================

#[test]
fn overflowed_depth_is_detected_lazily() {
    let dsize = 64 as Word;
    let mut m = machine(256);
    let mut labels = Vec::new();
    {
        let mut a = Assembler::new(&mut m, 0);
        // 1: DUP on an overflowed stack
        labels.push(a.label());
        a.pushi(dsize + 1);
        a.insn(Insn::SetDp);
        a.insn(Insn::Dup);
        // 2: PUSHS on an overflowed stack
        labels.push(a.label());
        a.pushi(dsize + 1);
        a.insn(Insn::SetDp);
        a.insn(Insn::Pushs);
        // 3: dp == dsize is a legal state
        labels.push(a.label());
        a.pushi(dsize);
        a.insn(Insn::SetDp);
        a.insn(Insn::Pushs);
        a.pushi(0);
        a.insn(Insn::Throw);
        // 4: CALL to an unaligned address
        labels.push(a.label());
        a.pushi(1);
        a.insn(Insn::Call);
        // 5: LOAD from an unaligned address
        labels.push(a.label());
        a.pushi(1);
        a.insn(Insn::Load);
        // 6: invalid opcode
        labels.push(a.label());
        a.insn(Insn::Undefined);
    }

    let expected = [
        Err(VmError::StackOverflow),
        Err(VmError::StackOverflow),
        Ok(()),
        Err(VmError::UnalignedAddress),
        Err(VmError::UnalignedAddress),
        Err(VmError::InvalidOpcode),
    ];
    for (label, expect) in labels.iter().zip(expected) {
        m.dp = 0;
        m.sp = 0;
        m.handler_sp = 0;
        m.set_pc(*label);
        assert_eq!(m.run(), expect, "case at {:#x}", label);
    }
}

// ==================== Exceptions ====================

#[test]
fn catch_stepped_trace() {
    let mut m = Machine::new(1024, 64, 64);
    let h1: UWord = 0x200;
    let h2: UWord = 0x400;
    let h3: UWord = 0x600;
    let mut correct: Vec<String> = Vec::new();
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushi(8);
        correct.push("8".into());
        a.pushi(5);
        correct.push("8 5".into());
        a.pushreli(h1);
        correct.push(format!("8 5 {}", h1));
        a.insn(Insn::Catch);
        correct.push("8 5".into());
        let ret1 = a.label();

        a.org(h1);
        a.insn(Insn::Ret);
        correct.push("8 5 0".into());

        a.org(ret1);
        a.pushreli(h2);
        correct.push(format!("8 5 0 {}", h2));
        a.insn(Insn::Catch);
        correct.push("8 5 0".into());
        let ret2 = a.label();

        a.org(h2);
        a.insn(Insn::Undefined);
        correct.push("8 5 0 -1".into());

        a.org(ret2);
        a.insn(Insn::Pop);
        correct.push("8 5 0".into());
        a.insn(Insn::Pop);
        correct.push("8 5".into());
        a.insn(Insn::Pop);
        correct.push("8".into());
        a.insn(Insn::Pop);
        correct.push("".into());
        a.pushreli(h3);
        correct.push(format!("{}", h3));
        a.insn(Insn::Catch);
        correct.push("".into());
        let ret3 = a.label();

        a.org(h3);
        a.pushi(-1);
        correct.push("-1".into());
        a.insn(Insn::Throw);
        correct.push("-1".into());

        a.org(ret3);
        a.pushi(0);
        correct.push("-1 0".into());
        a.insn(Insn::Throw);
        correct.push("-1".into());
    }
    step_trace(&mut m, &correct);
    assert_eq!(m.handler_sp(), 0);
    assert_eq!(m.sp(), 0);
}

#[test]
fn catch_then_ret_pushes_completion_code() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushreli(0x80);
        a.insn(Insn::Catch);
        a.insn(Insn::Break);
        a.org(0x80);
        a.insn(Insn::Ret);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    assert_eq!(m.data_stack(), &[0]);
    assert_eq!(m.handler_sp(), 0);
    assert_eq!(m.pc(), 2 * WORD_BYTES);
}

#[test]
fn throw_without_handler_returns_the_code() {
    let (_, err) = run_err(|a| {
        a.pushi(42);
        a.insn(Insn::Throw);
    });
    assert_eq!(err, VmError::Code(42));
}

#[test]
fn throw_zero_without_handler_halts_cleanly() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushi(0);
        a.insn(Insn::Throw);
    }
    assert_eq!(m.run(), Ok(()));
}

#[test]
fn throw_on_an_empty_stack_synthesizes_underflow() {
    let (_, err) = run_err(|a| {
        a.insn(Insn::Throw);
    });
    assert_eq!(err, VmError::StackUnderflow);
}

#[test]
fn nested_handlers_unwind_innermost_first() {
    let mut m = machine(1024);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushreli(0x100);
        a.insn(Insn::Catch);
        let ret_main = a.label();
        a.org(0x100);
        a.pushreli(0x200);
        a.insn(Insn::Catch);
        let ret_outer = a.label();
        a.org(0x200);
        a.pushi(99);
        a.insn(Insn::Throw);
        a.org(ret_outer);
        a.pushi(77);
        a.insn(Insn::Throw);
        a.org(ret_main);
        a.insn(Insn::Break);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    assert_eq!(m.data_stack(), &[99, 77]);
    assert_eq!(m.handler_sp(), 0);
}

#[test]
fn step_reports_a_caught_fault() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushreli(0x80);
        a.insn(Insn::Catch);
        a.insn(Insn::Break);
        a.org(0x80);
        a.insn(Insn::Undefined);
    }
    assert_eq!(m.step(), Err(VmError::Break)); // pushreli
    assert_eq!(m.step(), Err(VmError::Break)); // catch
    assert_eq!(m.step(), Err(VmError::InvalidOpcode));
    // Unwound to the word after CATCH with the code on the stack.
    assert_eq!(m.pc(), 2 * WORD_BYTES);
    assert_eq!(m.data_stack(), &[VmError::InvalidOpcode.code()]);
}

// ==================== Pausing and stepping ====================

#[test]
fn break_rewinds_onto_itself() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0x40);
        a.insn(Insn::Break);
    }
    m.set_pc(0x40);
    for _ in 0..3 {
        assert_eq!(m.run(), Err(VmError::Break));
        assert_eq!(m.pc(), 0x40);
    }
}

#[test]
fn packed_words_step_at_instruction_granularity() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        for _ in 0..3 {
            a.insns(&[Insn::WordBytes, Insn::Pop]);
        }
        a.insn(Insn::Break);
    }
    for cycle in 1..=6 {
        assert_eq!(m.step(), Err(VmError::Break), "cycle {}", cycle);
        // Two short instructions per word: pc advances cycles/2 words.
        assert_eq!(m.pc(), (cycle + 1) / 2 * WORD_BYTES, "cycle {}", cycle);
    }
    assert_eq!(m.data_stack(), &[] as &[Word]);
    // The next step lands on BREAK, which rewinds onto its own word.
    assert_eq!(m.step(), Err(VmError::Break));
    assert_eq!(m.pc(), 3 * WORD_BYTES);
}

#[test]
fn nop_terminates_a_packed_word_early() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.insns(&[Insn::WordBytes, Insn::Nop, Insn::WordBytes]);
        a.insn(Insn::Break);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    // The second WORD_BYTES never executes.
    assert_eq!(m.data_stack(), &[W]);
}

#[test]
fn run_for_pauses_between_instructions() {
    let mut m = machine(256);
    {
        let mut a = Assembler::new(&mut m, 0);
        for i in 0..5 {
            a.pushi(i);
        }
        a.insn(Insn::Break);
    }
    assert_eq!(m.run_for(Some(3)), Err(VmError::Break));
    assert_eq!(m.data_stack(), &[0, 1, 2]);
    assert_eq!(m.pc(), 3 * WORD_BYTES);
    assert_eq!(m.run_for(Some(100)), Err(VmError::Break));
    assert_eq!(m.data_stack(), &[0, 1, 2, 3, 4]);
}

// ==================== Faults on fetch ====================

#[test]
fn unaligned_pc_faults() {
    let mut m = machine(256);
    m.set_pc(1);
    assert_eq!(m.run(), Err(VmError::UnalignedAddress));
}

#[test]
fn pc_outside_memory_faults() {
    let mut m = machine(256);
    m.set_pc(m.msize());
    assert_eq!(m.run(), Err(VmError::InvalidLoad));
}

// ==================== Traps ====================

#[test]
fn trap_dispatches_through_the_instruction() {
    let mut m = machine(256);
    m.register_args(&["one", "two"]);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushi(traps::LIBC_ARGC as Word);
        a.trap(traps::LIBC);
        a.insn(Insn::Break);
    }
    assert_eq!(m.run(), Err(VmError::Break));
    assert_eq!(m.data_stack(), &[2]);
}

#[test]
fn unknown_trap_library_faults() {
    let (_, err) = run_err(|a| {
        a.trap(3);
    });
    assert_eq!(err, VmError::InvalidLibrary);
}

#[test]
fn unknown_trap_function_faults() {
    let (_, err) = run_err(|a| {
        a.pushi(0x7777);
        a.trap(traps::LIBC);
    });
    assert_eq!(err, VmError::InvalidFunction);
}

#[test]
fn trap_faults_reach_an_installed_handler() {
    let mut m = machine(1024);
    {
        let mut a = Assembler::new(&mut m, 0);
        a.pushreli(0x100);
        a.insn(Insn::Catch);
        a.insn(Insn::Break);
        a.org(0x100);
        a.trap(9); // invalid library
    }
    assert_eq!(m.run(), Err(VmError::Break));
    assert_eq!(
        m.data_stack(),
        &[VmError::InvalidLibrary.code()]
    );
}
