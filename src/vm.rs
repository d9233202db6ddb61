//! Core machine state and interpreter loop.
//!
//! A [`Machine`] owns one flat byte-addressed memory, a data stack and a
//! return stack, and the handful of registers the instruction set can see.
//! The interpreter is a fetch-decode-execute loop over the word forms of
//! [`isa`](crate::isa); faults unwind to the innermost CATCH handler frame
//! or terminate the run.
//!
//! Single-stepping is an instruction budget on the same loop: `run_for`
//! pauses with [`VmError::Break`] between short instructions, keeping the
//! unconsumed remainder of a packed instruction word in the `ir` register so
//! the next call resumes mid-word. Code memory is never patched.

use std::fs::File;

use crate::errors::VmError;
use crate::isa::{self, Insn, Op};
use crate::stack;
use crate::traps;
use crate::{UWord, Word, WORD_BYTES, WORD_MIN};

/// Default capacity of each stack, in words.
pub const DEFAULT_STACK_SIZE: UWord = 4096;

/// Number of registers in the debug-stub register block.
pub const NUM_REGISTERS: usize = 8;

/// Names of the registers in the debug-stub wire order.
pub const REGISTER_NAMES: [&str; NUM_REGISTERS] = [
    "pc",
    "ir",
    "msize",
    "ssize",
    "sp",
    "dsize",
    "dp",
    "handler_sp",
];

/// What one executed instruction asks the loop to do next.
pub(crate) enum Flow {
    /// Keep executing.
    Continue,
    /// Pause; the BREAK instruction has rewound `pc` onto itself.
    Break,
}

/// One virtual machine instance.
///
/// The machine owns its memory and stacks; embedders wanting concurrent
/// machines create independent instances. All registers are reachable
/// through accessors; the interpreter mutates them only via instructions.
pub struct Machine {
    pub(crate) mem: Vec<u8>,
    /// Byte address of the next instruction word.
    pub(crate) pc: UWord,
    /// Unconsumed packed short instructions of the current word.
    pub(crate) ir: Word,
    pub(crate) d0: Vec<Word>,
    pub(crate) dsize: UWord,
    pub(crate) dp: UWord,
    pub(crate) s0: Vec<Word>,
    pub(crate) ssize: UWord,
    pub(crate) sp: UWord,
    /// Return-stack depth of the innermost handler frame; < 2 means none.
    pub(crate) handler_sp: UWord,
    /// Command-line arguments registered by the embedder for the trap layer.
    pub(crate) args: Vec<Vec<u8>>,
    /// Open-file table for the trap layer; slots 0-2 are the process stdio.
    pub(crate) files: Vec<Option<File>>,
}

impl Machine {
    /// Creates a machine with `memory_words` words of zeroed memory and the
    /// given stack capacities.
    pub fn new(memory_words: UWord, ssize: UWord, dsize: UWord) -> Self {
        Self {
            mem: vec![0; memory_words * WORD_BYTES],
            pc: 0,
            ir: 0,
            d0: vec![0; dsize],
            dsize,
            dp: 0,
            s0: vec![0; ssize],
            ssize,
            sp: 0,
            handler_sp: 0,
            args: Vec::new(),
            files: vec![None, None, None],
        }
    }

    /// Creates a machine with default stack capacities.
    pub fn with_defaults(memory_words: UWord) -> Self {
        Self::new(memory_words, DEFAULT_STACK_SIZE, DEFAULT_STACK_SIZE)
    }

    // =========================
    // Registers and stacks
    // =========================

    /// Byte address of the next instruction word.
    pub fn pc(&self) -> UWord {
        self.pc
    }

    /// Repoints execution at `addr`.
    ///
    /// Any unconsumed packed instructions are abandoned.
    pub fn set_pc(&mut self, addr: UWord) {
        self.pc = addr;
        self.ir = 0;
    }

    /// Memory size in bytes.
    pub fn msize(&self) -> UWord {
        self.mem.len()
    }

    /// Data-stack capacity in words.
    pub fn dsize(&self) -> UWord {
        self.dsize
    }

    /// Data-stack depth.
    pub fn dp(&self) -> UWord {
        self.dp
    }

    /// Return-stack capacity in words.
    pub fn ssize(&self) -> UWord {
        self.ssize
    }

    /// Return-stack depth.
    pub fn sp(&self) -> UWord {
        self.sp
    }

    /// Return-stack depth of the innermost handler frame (< 2 when none).
    pub fn handler_sp(&self) -> UWord {
        self.handler_sp
    }

    /// The live portion of the data stack, bottom first.
    pub fn data_stack(&self) -> &[Word] {
        &self.d0[..self.dp.min(self.dsize)]
    }

    /// The live portion of the return stack, bottom first.
    pub fn return_stack(&self) -> &[Word] {
        &self.s0[..self.sp.min(self.ssize)]
    }

    /// Pushes a word onto the data stack.
    pub fn push_data(&mut self, value: Word) -> Result<(), VmError> {
        self.pushd(value)
    }

    /// Pops a word off the data stack.
    pub fn pop_data(&mut self) -> Result<Word, VmError> {
        self.popd()
    }

    /// Registers the command-line argument vector the ARGC/ARGV traps expose.
    pub fn register_args<S: AsRef<[u8]>>(&mut self, args: &[S]) {
        self.args = args.iter().map(|a| a.as_ref().to_vec()).collect();
    }

    /// The register block in debug-stub wire order (see [`REGISTER_NAMES`]).
    pub fn registers(&self) -> [UWord; NUM_REGISTERS] {
        [
            self.pc,
            self.ir as UWord,
            self.mem.len(),
            self.ssize,
            self.sp,
            self.dsize,
            self.dp,
            self.handler_sp,
        ]
    }

    /// Writes one register by wire index. Sizes are read-only; writes to
    /// them (or out-of-range indices) are ignored.
    pub fn set_register(&mut self, index: usize, value: UWord) {
        match index {
            0 => self.pc = value,
            1 => self.ir = value as Word,
            4 => self.sp = value,
            6 => self.dp = value,
            7 => self.handler_sp = value,
            _ => {}
        }
    }

    pub(crate) fn popd(&mut self) -> Result<Word, VmError> {
        stack::pop(&self.d0, self.dsize, &mut self.dp)
    }

    pub(crate) fn pushd(&mut self, value: Word) -> Result<(), VmError> {
        stack::push(&mut self.d0, self.dsize, &mut self.dp, value)
    }

    pub(crate) fn pops(&mut self) -> Result<Word, VmError> {
        stack::pop(&self.s0, self.ssize, &mut self.sp)
    }

    pub(crate) fn pushs(&mut self, value: Word) -> Result<(), VmError> {
        stack::push(&mut self.s0, self.ssize, &mut self.sp, value)
    }

    fn checkd(&self, pops: UWord, pushes: UWord) -> Result<(), VmError> {
        stack::check(self.dsize, self.dp, pops, pushes)
    }

    fn checks(&self, pops: UWord, pushes: UWord) -> Result<(), VmError> {
        stack::check(self.ssize, self.sp, pops, pushes)
    }

    // =========================
    // Memory access
    // =========================
    //
    // Loaded code is trusted: direct memory instructions verify alignment,
    // and an out-of-range address fails the program with InvalidLoad or
    // InvalidStore rather than being recoverable.

    /// Entire machine memory.
    pub fn memory(&self) -> &[u8] {
        &self.mem
    }

    /// Entire machine memory, writable.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    fn check_aligned(addr: UWord) -> Result<(), VmError> {
        if addr % WORD_BYTES != 0 {
            return Err(VmError::UnalignedAddress);
        }
        Ok(())
    }

    /// Loads the word at a word-aligned byte address.
    pub fn load_word(&self, addr: UWord) -> Result<Word, VmError> {
        Self::check_aligned(addr)?;
        let end = addr.checked_add(WORD_BYTES).ok_or(VmError::InvalidLoad)?;
        let bytes = self.mem.get(addr..end).ok_or(VmError::InvalidLoad)?;
        Ok(Word::from_ne_bytes(bytes.try_into().unwrap()))
    }

    /// Stores a word at a word-aligned byte address.
    pub fn store_word(&mut self, addr: UWord, value: Word) -> Result<(), VmError> {
        Self::check_aligned(addr)?;
        let end = addr.checked_add(WORD_BYTES).ok_or(VmError::InvalidStore)?;
        let bytes = self.mem.get_mut(addr..end).ok_or(VmError::InvalidStore)?;
        bytes.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Loads the byte at an address.
    pub fn load_byte(&self, addr: UWord) -> Result<u8, VmError> {
        self.mem.get(addr).copied().ok_or(VmError::InvalidLoad)
    }

    /// Stores a byte at an address.
    pub fn store_byte(&mut self, addr: UWord, value: u8) -> Result<(), VmError> {
        let slot = self.mem.get_mut(addr).ok_or(VmError::InvalidStore)?;
        *slot = value;
        Ok(())
    }

    fn load_u16(&self, addr: UWord) -> Result<u16, VmError> {
        if addr % 2 != 0 {
            return Err(VmError::UnalignedAddress);
        }
        let bytes = self.mem.get(addr..addr + 2).ok_or(VmError::InvalidLoad)?;
        Ok(u16::from_ne_bytes(bytes.try_into().unwrap()))
    }

    fn store_u16(&mut self, addr: UWord, value: u16) -> Result<(), VmError> {
        if addr % 2 != 0 {
            return Err(VmError::UnalignedAddress);
        }
        let bytes = self
            .mem
            .get_mut(addr..addr + 2)
            .ok_or(VmError::InvalidStore)?;
        bytes.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    fn load_u32(&self, addr: UWord) -> Result<u32, VmError> {
        if addr % 4 != 0 {
            return Err(VmError::UnalignedAddress);
        }
        let bytes = self.mem.get(addr..addr + 4).ok_or(VmError::InvalidLoad)?;
        Ok(u32::from_ne_bytes(bytes.try_into().unwrap()))
    }

    fn store_u32(&mut self, addr: UWord, value: u32) -> Result<(), VmError> {
        if addr % 4 != 0 {
            return Err(VmError::UnalignedAddress);
        }
        let bytes = self
            .mem
            .get_mut(addr..addr + 4)
            .ok_or(VmError::InvalidStore)?;
        bytes.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    // =========================
    // Execution
    // =========================

    /// Runs until a terminal condition.
    ///
    /// `Ok(())` means VM code halted cleanly by throwing 0 with no handler
    /// installed. `Err(VmError::Break)` means execution paused at a BREAK
    /// instruction; any other error is the uncaught fault or thrown code.
    pub fn run(&mut self) -> Result<(), VmError> {
        self.run_for(None)
    }

    /// Executes exactly one short instruction (or one immediate-form word).
    ///
    /// Returns `Err(VmError::Break)` when the instruction completed and
    /// execution paused after it; a fault's code when the instruction
    /// faulted (whether or not a handler caught it); and `Ok(())` when the
    /// instruction terminated the program cleanly.
    pub fn step(&mut self) -> Result<(), VmError> {
        self.run_for(Some(1))
    }

    /// Runs at most `budget` short instructions when a budget is given.
    pub fn run_for(&mut self, budget: Option<u64>) -> Result<(), VmError> {
        let mut fuel = budget;
        loop {
            if fuel == Some(0) {
                return Err(VmError::Break);
            }
            match self.cycle() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Break) => return Err(VmError::Break),
                Err(fault) => {
                    if let Some(code) = self.unwind(fault.code()) {
                        return if code == 0 {
                            Ok(())
                        } else {
                            Err(VmError::from_code(code))
                        };
                    }
                    // Caught: the handler is in control now, but a budgeted
                    // run still reports the fault as this step's outcome.
                    if let Some(f) = &mut fuel {
                        *f -= 1;
                        if *f == 0 {
                            return Err(fault);
                        }
                    }
                    continue;
                }
            }
            if let Some(f) = &mut fuel {
                *f -= 1;
            }
        }
    }

    /// Unwinds a fault or thrown code to the innermost handler frame.
    ///
    /// Returns `Some(code)` when no handler is installed and the run must
    /// terminate, `None` once a handler has taken over.
    fn unwind(&mut self, code: Word) -> Option<Word> {
        let mut code = code;
        self.ir = 0;
        loop {
            if self.handler_sp < 2 {
                return Some(code);
            }
            // Leave the code on the data stack for the handler, unless the
            // stack is full; dropping it is not an escalation.
            if self.dp < self.dsize {
                self.d0[self.dp] = code;
                self.dp += 1;
            }
            self.sp = self.handler_sp;
            let addr = match self.pops() {
                Ok(word) => word as UWord,
                Err(fault) => return Some(fault.code()),
            };
            self.handler_sp = match self.pops() {
                Ok(word) => word as UWord,
                Err(fault) => return Some(fault.code()),
            };
            if addr % WORD_BYTES != 0 {
                // The frame is corrupt; unwind to the next handler.
                code = VmError::UnalignedAddress.code();
                continue;
            }
            self.pc = addr;
            return None;
        }
    }

    /// Address of the word `offset` words from the one following `pc`.
    fn rel_target(&self, offset: Word) -> UWord {
        self.pc
            .wrapping_add((offset as UWord).wrapping_mul(WORD_BYTES))
    }

    /// Fetches and executes one short instruction or immediate-form word.
    fn cycle(&mut self) -> Result<Flow, VmError> {
        if self.ir != 0 {
            return self.insn_cycle();
        }
        let word = self.load_word(self.pc)?;
        self.pc = self.pc.wrapping_add(WORD_BYTES);
        match isa::decode(word)? {
            Op::Calli(offset) => {
                self.checks(0, 1)?;
                self.pushs(self.pc as Word)?;
                self.pc = self.rel_target(offset);
                Ok(Flow::Continue)
            }
            Op::Pushi(value) => {
                self.checkd(0, 1)?;
                self.pushd(value)?;
                Ok(Flow::Continue)
            }
            Op::Pushreli(offset) => {
                self.checkd(0, 1)?;
                self.pushd(self.rel_target(offset) as Word)?;
                Ok(Flow::Continue)
            }
            Op::Jumpi(offset) => {
                self.pc = self.rel_target(offset);
                Ok(Flow::Continue)
            }
            Op::Jumpzi(offset) => {
                self.checkd(1, 0)?;
                let target = self.rel_target(offset);
                let flag = self.popd()?;
                if flag == 0 {
                    self.pc = target;
                }
                Ok(Flow::Continue)
            }
            Op::Trap(library) => {
                traps::dispatch(self, library)?;
                // Traps may move pc and both stack pointers; re-validate.
                Self::check_aligned(self.pc)?;
                if self.sp > self.ssize || self.dp > self.dsize {
                    return Err(VmError::StackOverflow);
                }
                Ok(Flow::Continue)
            }
            Op::Insn(bits) => {
                self.ir = bits;
                self.insn_cycle()
            }
        }
    }

    /// Executes the next short instruction pending in `ir`.
    fn insn_cycle(&mut self) -> Result<Flow, VmError> {
        let opcode = ((self.ir as UWord) & isa::INSN_MASK) as u8;
        self.ir = ((self.ir as UWord) >> isa::INSN_BITS) as Word;
        if opcode == Insn::Nop as u8 {
            // NOP ends the word; whatever else it packed is discarded.
            self.ir = 0;
            return Ok(Flow::Continue);
        }
        let result = self.exec_insn(opcode);
        // The word is finished when its next opcode is NOP; a fault or
        // BREAK abandons the remainder (BREAK rewinds pc onto the whole
        // word, so it re-executes from the start on resume).
        if !matches!(result, Ok(Flow::Continue))
            || (self.ir as UWord) & isa::INSN_MASK == Insn::Nop as UWord
        {
            self.ir = 0;
        }
        result
    }

    fn exec_insn(&mut self, opcode: u8) -> Result<Flow, VmError> {
        match Insn::try_from(opcode)? {
            Insn::Nop => {}
            Insn::Not => {
                self.checkd(1, 1)?;
                let a = self.popd()?;
                self.pushd(!a)?;
            }
            Insn::And => {
                self.checkd(2, 1)?;
                let a = self.popd()?;
                let b = self.popd()?;
                self.pushd(a & b)?;
            }
            Insn::Or => {
                self.checkd(2, 1)?;
                let a = self.popd()?;
                let b = self.popd()?;
                self.pushd(a | b)?;
            }
            Insn::Xor => {
                self.checkd(2, 1)?;
                let a = self.popd()?;
                let b = self.popd()?;
                self.pushd(a ^ b)?;
            }
            Insn::Lshift => {
                self.checkd(2, 1)?;
                let shift = self.popd()?;
                let value = self.popd()?;
                self.pushd(match u32::try_from(shift) {
                    Ok(s) if s < crate::WORD_BIT => ((value as UWord) << s) as Word,
                    _ => 0,
                })?;
            }
            Insn::Rshift => {
                self.checkd(2, 1)?;
                let shift = self.popd()?;
                let value = self.popd()?;
                self.pushd(match u32::try_from(shift) {
                    Ok(s) if s < crate::WORD_BIT => ((value as UWord) >> s) as Word,
                    _ => 0,
                })?;
            }
            Insn::Arshift => {
                self.checkd(2, 1)?;
                let shift = self.popd()?;
                let value = self.popd()?;
                self.pushd(match u32::try_from(shift) {
                    Ok(s) if s < crate::WORD_BIT => value >> s,
                    // Shifting all bits out leaves only the sign.
                    _ => {
                        if value < 0 {
                            -1
                        } else {
                            0
                        }
                    }
                })?;
            }
            Insn::Pop => {
                self.checkd(1, 0)?;
                self.dp -= 1;
            }
            Insn::Dup => {
                self.checkd(1, 1)?;
                let depth = self.popd()? as UWord;
                if depth >= self.dp {
                    self.pushd(depth as Word)?;
                    return Err(VmError::StackUnderflow);
                }
                self.pushd(self.d0[self.dp - depth - 1])?;
            }
            Insn::Set => {
                self.checkd(2, 1)?;
                let depth = self.popd()? as UWord;
                // depth is counted from the top of the stack that remains
                // once both operands are gone.
                if depth >= self.dp - 1 {
                    self.pushd(depth as Word)?;
                    return Err(VmError::StackUnderflow);
                }
                let value = self.popd()?;
                self.d0[self.dp - depth - 1] = value;
            }
            Insn::Swap => {
                self.checkd(1, 0)?;
                let depth = self.popd()? as UWord;
                if self.dp == 0 || depth >= self.dp - 1 {
                    self.pushd(depth as Word)?;
                    return Err(VmError::StackUnderflow);
                }
                self.d0.swap(self.dp - depth - 2, self.dp - 1);
            }
            Insn::Jump => {
                self.checkd(1, 0)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                self.pc = addr;
            }
            Insn::Jumpz => {
                self.checkd(2, 0)?;
                let addr = self.popd()? as UWord;
                let flag = self.popd()?;
                if flag == 0 {
                    Self::check_aligned(addr)?;
                    self.pc = addr;
                }
            }
            Insn::Call => {
                self.checkd(1, 0)?;
                self.checks(0, 1)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                self.pushs(self.pc as Word)?;
                self.pc = addr;
            }
            Insn::Ret => {
                self.checks(1, 0)?;
                if self.sp < self.handler_sp {
                    self.checks(1, 0)?;
                    self.checkd(0, 1)?;
                }
                let addr = self.pops()? as UWord;
                Self::check_aligned(addr)?;
                if self.sp < self.handler_sp {
                    // Returning past the innermost handler frame: restore
                    // the saved handler and report completion code 0.
                    self.handler_sp = self.pops()? as UWord;
                    self.pushd(0)?;
                }
                self.pc = addr;
            }
            Insn::Load => {
                self.checkd(1, 1)?;
                let addr = self.popd()? as UWord;
                let value = self.load_word(addr)?;
                self.pushd(value)?;
            }
            Insn::Store => {
                self.checkd(2, 0)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                let value = self.popd()?;
                self.store_word(addr, value)?;
            }
            Insn::Load1 => {
                self.checkd(1, 1)?;
                let addr = self.popd()? as UWord;
                let value = self.load_byte(addr)?;
                self.pushd(value as Word)?;
            }
            Insn::Store1 => {
                self.checkd(2, 0)?;
                let addr = self.popd()? as UWord;
                let value = self.popd()?;
                self.store_byte(addr, value as u8)?;
            }
            Insn::Load2 => {
                self.checkd(1, 1)?;
                let addr = self.popd()? as UWord;
                let value = self.load_u16(addr)?;
                self.pushd(value as Word)?;
            }
            Insn::Store2 => {
                self.checkd(2, 0)?;
                let addr = self.popd()? as UWord;
                if addr % 2 != 0 {
                    return Err(VmError::UnalignedAddress);
                }
                let value = self.popd()?;
                self.store_u16(addr, value as u16)?;
            }
            Insn::Load4 => {
                self.checkd(1, 1)?;
                let addr = self.popd()? as UWord;
                let value = self.load_u32(addr)?;
                self.pushd(value as Word)?;
            }
            Insn::Store4 => {
                self.checkd(2, 0)?;
                let addr = self.popd()? as UWord;
                if addr % 4 != 0 {
                    return Err(VmError::UnalignedAddress);
                }
                let value = self.popd()?;
                self.store_u32(addr, value as u32)?;
            }
            Insn::LoadIa => {
                self.checkd(1, 2)?;
                let addr = self.popd()? as UWord;
                let value = self.load_word(addr)?;
                self.pushd(value)?;
                self.pushd(addr.wrapping_add(WORD_BYTES) as Word)?;
            }
            Insn::StoreDb => {
                self.checkd(2, 1)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                let value = self.popd()?;
                let below = addr.wrapping_sub(WORD_BYTES);
                self.store_word(below, value)?;
                self.pushd(below as Word)?;
            }
            Insn::LoadIb => {
                self.checkd(1, 2)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                let above = addr.wrapping_add(WORD_BYTES);
                let value = self.load_word(above)?;
                self.pushd(value)?;
                self.pushd(above as Word)?;
            }
            Insn::StoreDa => {
                self.checkd(2, 1)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                let value = self.popd()?;
                self.store_word(addr, value)?;
                self.pushd(addr.wrapping_sub(WORD_BYTES) as Word)?;
            }
            Insn::LoadDa => {
                self.checkd(1, 2)?;
                let addr = self.popd()? as UWord;
                let value = self.load_word(addr)?;
                self.pushd(value)?;
                self.pushd(addr.wrapping_sub(WORD_BYTES) as Word)?;
            }
            Insn::StoreIb => {
                self.checkd(2, 1)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                let value = self.popd()?;
                let above = addr.wrapping_add(WORD_BYTES);
                self.store_word(above, value)?;
                self.pushd(above as Word)?;
            }
            Insn::LoadDb => {
                self.checkd(1, 2)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                let below = addr.wrapping_sub(WORD_BYTES);
                let value = self.load_word(below)?;
                self.pushd(value)?;
                self.pushd(below as Word)?;
            }
            Insn::StoreIa => {
                self.checkd(2, 1)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                let value = self.popd()?;
                self.store_word(addr, value)?;
                self.pushd(addr.wrapping_add(WORD_BYTES) as Word)?;
            }
            Insn::Neg => {
                self.checkd(1, 1)?;
                let a = self.popd()?;
                self.pushd(a.wrapping_neg())?;
            }
            Insn::Add => {
                self.checkd(2, 1)?;
                let a = self.popd()?;
                let b = self.popd()?;
                self.pushd(b.wrapping_add(a))?;
            }
            Insn::Mul => {
                self.checkd(2, 1)?;
                let a = self.popd()?;
                let b = self.popd()?;
                self.pushd(b.wrapping_mul(a))?;
            }
            Insn::Divmod => {
                self.checkd(2, 2)?;
                let divisor = self.popd()?;
                let dividend = self.popd()?;
                if dividend == WORD_MIN && divisor == -1 {
                    self.pushd(WORD_MIN)?;
                    self.pushd(0)?;
                } else if divisor == 0 {
                    self.pushd(0)?;
                    self.pushd(dividend)?;
                } else {
                    self.pushd(dividend / divisor)?;
                    self.pushd(dividend % divisor)?;
                }
            }
            Insn::Udivmod => {
                self.checkd(2, 2)?;
                let divisor = self.popd()? as UWord;
                let dividend = self.popd()? as UWord;
                if divisor == 0 {
                    self.pushd(0)?;
                    self.pushd(dividend as Word)?;
                } else {
                    self.pushd((dividend / divisor) as Word)?;
                    self.pushd((dividend % divisor) as Word)?;
                }
            }
            Insn::Eq => {
                self.checkd(2, 1)?;
                let a = self.popd()?;
                let b = self.popd()?;
                self.pushd((a == b) as Word)?;
            }
            Insn::Lt => {
                self.checkd(2, 1)?;
                let a = self.popd()?;
                let b = self.popd()?;
                self.pushd((b < a) as Word)?;
            }
            Insn::Ult => {
                self.checkd(2, 1)?;
                let a = self.popd()? as UWord;
                let b = self.popd()? as UWord;
                self.pushd((b < a) as Word)?;
            }
            Insn::Pushs => {
                self.checkd(1, 0)?;
                self.checks(0, 1)?;
                let value = self.popd()?;
                self.pushs(value)?;
            }
            Insn::Pops => {
                self.checks(1, 0)?;
                self.checkd(0, 1)?;
                let value = self.pops()?;
                self.pushd(value)?;
            }
            Insn::Dups => {
                self.checks(1, 1)?;
                self.checkd(0, 1)?;
                self.pushd(self.s0[self.sp - 1])?;
            }
            Insn::Catch => {
                self.checks(0, 2)?;
                self.checkd(1, 0)?;
                let addr = self.popd()? as UWord;
                Self::check_aligned(addr)?;
                self.pushs(self.handler_sp as Word)?;
                self.pushs(self.pc as Word)?;
                self.handler_sp = self.sp;
                self.pc = addr;
            }
            Insn::Throw => {
                let code = self.popd()?;
                return Err(VmError::from_code(code));
            }
            Insn::Break => {
                self.pc = self.pc.wrapping_sub(WORD_BYTES);
                return Ok(Flow::Break);
            }
            Insn::WordBytes => {
                self.checkd(0, 1)?;
                self.pushd(WORD_BYTES as Word)?;
            }
            Insn::GetSsize => {
                self.checkd(0, 1)?;
                self.pushd(self.ssize as Word)?;
            }
            Insn::GetSp => {
                self.checkd(0, 1)?;
                self.pushd(self.sp as Word)?;
            }
            Insn::SetSp => {
                self.checkd(1, 0)?;
                self.sp = self.popd()? as UWord;
            }
            Insn::GetDsize => {
                self.checkd(0, 1)?;
                self.pushd(self.dsize as Word)?;
            }
            Insn::GetDp => {
                self.checkd(0, 1)?;
                let value = self.dp as Word;
                self.pushd(value)?;
            }
            Insn::SetDp => {
                self.checkd(1, 0)?;
                let value = self.popd()? as UWord;
                self.dp = value;
            }
            Insn::GetHandlerSp => {
                self.checkd(0, 1)?;
                self.pushd(self.handler_sp as Word)?;
            }
            Insn::Undefined => return Err(VmError::InvalidOpcode),
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests;
