//! In-memory assembler and disassembler helpers.
//!
//! The [`Assembler`] builds instruction words directly into a machine's
//! memory, resolving branch targets to the word-counted relative operands
//! the codec uses. It is the tool the interpreter tests and the shell's
//! error reporting lean on; operands that do not fit their immediate field
//! are caller errors and assert.

use crate::isa::{self, Insn, Op};
use crate::vm::Machine;
use crate::{UWord, Word, WORD_BYTES};

/// Assembles instruction words into machine memory at a moving address.
pub struct Assembler<'a> {
    m: &'a mut Machine,
    at: UWord,
}

impl<'a> Assembler<'a> {
    /// Starts assembling at `at`, which must be word-aligned.
    pub fn new(m: &'a mut Machine, at: UWord) -> Self {
        assert!(at % WORD_BYTES == 0, "assembly address must be aligned");
        Self { m, at }
    }

    /// The address the next word will be assembled at.
    pub fn label(&self) -> UWord {
        self.at
    }

    /// Moves assembly to `at`.
    pub fn org(&mut self, at: UWord) {
        assert!(at % WORD_BYTES == 0, "assembly address must be aligned");
        self.at = at;
    }

    /// Emits one raw word.
    pub fn word(&mut self, value: Word) {
        self.m
            .store_word(self.at, value)
            .expect("assembled past the end of memory");
        self.at += WORD_BYTES;
    }

    /// Emits one short instruction in its own word.
    pub fn insn(&mut self, insn: Insn) {
        self.word(isa::encode_insns(&[insn]));
    }

    /// Emits one word packing several short instructions.
    pub fn insns(&mut self, insns: &[Insn]) {
        self.word(isa::encode_insns(insns));
    }

    /// Emits a trap call for a library id.
    pub fn trap(&mut self, library: UWord) {
        self.word(isa::encode_trap(library));
    }

    /// Emits an immediate literal push.
    pub fn pushi(&mut self, value: Word) {
        self.word(isa::encode_pushi(value));
    }

    /// Emits an immediate call to the word-aligned `target`.
    pub fn calli(&mut self, target: UWord) {
        let offset = self.rel(target);
        self.word(isa::encode_calli(offset));
    }

    /// Emits an immediate jump to `target`.
    pub fn jumpi(&mut self, target: UWord) {
        let offset = self.rel(target);
        self.word(isa::encode_jumpi(offset));
    }

    /// Emits an immediate conditional jump to `target`.
    pub fn jumpzi(&mut self, target: UWord) {
        let offset = self.rel(target);
        self.word(isa::encode_jumpzi(offset));
    }

    /// Emits an immediate relative push of `target`'s address.
    pub fn pushreli(&mut self, target: UWord) {
        let offset = self.rel(target);
        self.word(isa::encode_pushreli(offset));
    }

    /// Word offset of `target` relative to the word after the current one.
    fn rel(&self, target: UWord) -> Word {
        assert!(target % WORD_BYTES == 0, "branch target must be aligned");
        (target.wrapping_sub(self.at + WORD_BYTES) as Word) / WORD_BYTES as Word
    }
}

fn rel_target(addr: UWord, offset: Word) -> UWord {
    addr.wrapping_add(WORD_BYTES)
        .wrapping_add((offset as UWord).wrapping_mul(WORD_BYTES))
}

/// Renders the instruction word at `addr` for display.
pub fn disass(word: Word, addr: UWord) -> String {
    match isa::decode(word) {
        Ok(Op::Calli(offset)) => format!("CALLI ${:x}", rel_target(addr, offset)),
        Ok(Op::Pushi(value)) => format!("PUSHI {}", value),
        Ok(Op::Pushreli(offset)) => format!("PUSHRELI ${:x}", rel_target(addr, offset)),
        Ok(Op::Jumpi(offset)) => format!("JUMPI ${:x}", rel_target(addr, offset)),
        Ok(Op::Jumpzi(offset)) => format!("JUMPZI ${:x}", rel_target(addr, offset)),
        Ok(Op::Trap(library)) => format!("TRAP ${:x}", library),
        Ok(Op::Insn(mut bits)) => {
            let mut names: Vec<&str> = Vec::new();
            loop {
                let opcode = (bits as UWord & isa::INSN_MASK) as u8;
                if opcode == Insn::Nop as u8 {
                    break;
                }
                names.push(match Insn::try_from(opcode) {
                    Ok(insn) => insn.mnemonic(),
                    Err(_) => "UNDEFINED",
                });
                bits = ((bits as UWord) >> isa::INSN_BITS) as Word;
            }
            if names.is_empty() {
                "NOP".to_string()
            } else {
                names.join(" ")
            }
        }
        Err(_) => format!("invalid ${:x}", word as UWord),
    }
}
