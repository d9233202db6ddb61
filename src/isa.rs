//! Instruction Set Architecture (ISA) definitions.
//!
//! One machine word encodes one instruction. The low bits carry a primary
//! tag selecting an immediate form (call, literal push, relative-address
//! push) or an escape to a secondary tag (immediate jumps, a trap call, or a
//! word of packed short-form instructions). Immediate operands are recovered
//! by arithmetic right shift, so they sign-extend; relative operands are
//! counted in words from the address of the word *following* the
//! instruction.
//!
//! A short-form (`INSN`) word packs up to [`MAX_PACKED`] 6-bit opcodes,
//! executed low bits first; the next `NOP` opcode (or running out of set
//! bits) ends the word.
//!
//! The [`for_each_insn!`](crate::for_each_insn) macro holds the canonical
//! short-opcode definitions and invokes a callback macro for code
//! generation, so the enum, decoder and mnemonic tables cannot drift apart.

use crate::errors::VmError;
use crate::{UWord, Word};

#[cfg(target_pointer_width = "64")]
mod layout {
    use crate::UWord;

    /// Mask of the primary tag bits.
    pub const OP1_MASK: UWord = 0x7;
    /// Mask of the secondary tag bits (same field on 64-bit words).
    pub const OP2_MASK: UWord = 0x7;
    /// Operand shift for primary-tag forms.
    pub const OP1_SHIFT: u32 = 3;
    /// Operand shift for secondary-tag forms.
    pub const OP2_SHIFT: u32 = 3;

    pub const OP_CALLI: UWord = 0x0;
    pub const OP_PUSHI: UWord = 0x1;
    pub const OP_PUSHRELI: UWord = 0x2;
    pub const OP_JUMPI: UWord = 0x3;
    pub const OP_JUMPZI: UWord = 0x4;
    pub const OP_TRAP: UWord = 0x5;
    pub const OP_INSN: UWord = 0x7;
}

#[cfg(target_pointer_width = "32")]
mod layout {
    use crate::UWord;

    /// Mask of the primary tag bits.
    pub const OP1_MASK: UWord = 0x3;
    /// Mask of the secondary tag bits, valid when the primary tag is 3.
    pub const OP2_MASK: UWord = 0xf;
    /// Operand shift for primary-tag forms.
    pub const OP1_SHIFT: u32 = 2;
    /// Operand shift for secondary-tag forms.
    pub const OP2_SHIFT: u32 = 4;

    pub const OP_CALLI: UWord = 0x0;
    pub const OP_PUSHI: UWord = 0x1;
    pub const OP_PUSHRELI: UWord = 0x2;
    pub const OP_JUMPI: UWord = 0x3;
    pub const OP_JUMPZI: UWord = 0x7;
    pub const OP_TRAP: UWord = 0xb;
    pub const OP_INSN: UWord = 0xf;
}

pub use layout::*;

/// Bits per packed short opcode.
pub const INSN_BITS: u32 = 6;
/// Mask of one packed short opcode.
pub const INSN_MASK: UWord = 0x3f;
/// Maximum number of short opcodes one word can pack.
pub const MAX_PACKED: usize = ((crate::WORD_BIT - OP2_SHIFT) / INSN_BITS) as usize;

/// One decoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Immediate call; operand is a word offset, return address is pushed.
    Calli(Word),
    /// Immediate literal push.
    Pushi(Word),
    /// Immediate relative-address push; operand is a word offset.
    Pushreli(Word),
    /// Immediate jump; operand is a word offset.
    Jumpi(Word),
    /// Immediate conditional jump, taken when the popped flag is zero.
    Jumpzi(Word),
    /// Trap call; operand is the library id.
    Trap(UWord),
    /// Packed short-form instructions; operand is the remaining payload.
    Insn(Word),
}

/// Decodes one instruction word.
pub fn decode(word: Word) -> Result<Op, VmError> {
    match (word as UWord) & OP1_MASK {
        OP_CALLI => Ok(Op::Calli(word >> OP1_SHIFT)),
        OP_PUSHI => Ok(Op::Pushi(word >> OP1_SHIFT)),
        OP_PUSHRELI => Ok(Op::Pushreli(word >> OP1_SHIFT)),
        _ => match (word as UWord) & OP2_MASK {
            OP_JUMPI => Ok(Op::Jumpi(word >> OP2_SHIFT)),
            OP_JUMPZI => Ok(Op::Jumpzi(word >> OP2_SHIFT)),
            OP_TRAP => Ok(Op::Trap((word as UWord) >> OP2_SHIFT)),
            OP_INSN => Ok(Op::Insn(((word as UWord) >> OP2_SHIFT) as Word)),
            _ => Err(VmError::InvalidOpcode),
        },
    }
}

/// Invokes a callback macro with the complete short-opcode definition list.
///
/// This macro enables code generation for the short instructions in multiple
/// modules without duplicating the definitions.
#[macro_export]
macro_rules! for_each_insn {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Bitwise
            // =========================
            /// NOP ; ends the current instruction word
            Nop = 0x00, "NOP",
            /// NOT ( a -- ~a )
            Not = 0x01, "NOT",
            /// AND ( a b -- a&b )
            And = 0x02, "AND",
            /// OR ( a b -- a|b )
            Or = 0x03, "OR",
            /// XOR ( a b -- a^b )
            Xor = 0x04, "XOR",
            /// LSHIFT ( a n -- a<<n ) ; 0 when n >= word bits
            Lshift = 0x05, "LSHIFT",
            /// RSHIFT ( a n -- a>>n ) ; logical, 0 when n >= word bits
            Rshift = 0x06, "RSHIFT",
            /// ARSHIFT ( a n -- a>>n ) ; arithmetic, sign-preserving
            Arshift = 0x07, "ARSHIFT",
            // =========================
            // Stack manipulation
            // =========================
            /// POP ( a -- )
            Pop = 0x08, "POP",
            /// DUP ( n -- stack[n] ) ; n counted from the top
            Dup = 0x09, "DUP",
            /// SET ( v n -- ) ; stack[n] = v
            Set = 0x0a, "SET",
            /// SWAP ( n -- ) ; exchange top with stack[n+1]
            Swap = 0x0b, "SWAP",
            // =========================
            // Control transfer
            // =========================
            /// JUMP ( addr -- )
            Jump = 0x0c, "JUMP",
            /// JUMPZ ( flag addr -- ) ; jump when flag is 0
            Jumpz = 0x0d, "JUMPZ",
            /// CALL ( addr -- ) ; pushes the return address on the return stack
            Call = 0x0e, "CALL",
            /// RET ; pops a return address, unwinding a handler frame if crossed
            Ret = 0x0f, "RET",
            // =========================
            // Memory access
            // =========================
            /// LOAD ( addr -- w )
            Load = 0x10, "LOAD",
            /// STORE ( v addr -- )
            Store = 0x11, "STORE",
            /// LOAD1 ( addr -- b ) ; byte, zero-extended
            Load1 = 0x12, "LOAD1",
            /// STORE1 ( v addr -- )
            Store1 = 0x13, "STORE1",
            /// LOAD2 ( addr -- h ) ; 16-bit, zero-extended, 2-byte aligned
            Load2 = 0x14, "LOAD2",
            /// STORE2 ( v addr -- )
            Store2 = 0x15, "STORE2",
            /// LOAD4 ( addr -- u ) ; 32-bit, zero-extended, 4-byte aligned
            Load4 = 0x16, "LOAD4",
            /// STORE4 ( v addr -- )
            Store4 = 0x17, "STORE4",
            // =========================
            // Stepped memory access
            // =========================
            /// LOAD_IA ( addr -- w addr+1 ) ; load, increment after
            LoadIa = 0x18, "LOAD_IA",
            /// STORE_DB ( v addr -- addr-1 ) ; decrement before, store
            StoreDb = 0x19, "STORE_DB",
            /// LOAD_IB ( addr -- w addr+1 ) ; increment before, load
            LoadIb = 0x1a, "LOAD_IB",
            /// STORE_DA ( v addr -- addr-1 ) ; store, decrement after
            StoreDa = 0x1b, "STORE_DA",
            /// LOAD_DA ( addr -- w addr-1 ) ; load, decrement after
            LoadDa = 0x1c, "LOAD_DA",
            /// STORE_IB ( v addr -- addr+1 ) ; increment before, store
            StoreIb = 0x1d, "STORE_IB",
            /// LOAD_DB ( addr -- w addr-1 ) ; decrement before, load
            LoadDb = 0x1e, "LOAD_DB",
            /// STORE_IA ( v addr -- addr+1 ) ; store, increment after
            StoreIa = 0x1f, "STORE_IA",
            // =========================
            // Arithmetic
            // =========================
            /// NEG ( a -- -a )
            Neg = 0x20, "NEG",
            /// ADD ( a b -- a+b )
            Add = 0x21, "ADD",
            /// MUL ( a b -- a*b )
            Mul = 0x22, "MUL",
            /// DIVMOD ( a b -- a/b a%b ) ; signed; b=0 gives ( 0 a )
            Divmod = 0x23, "DIVMOD",
            /// UDIVMOD ( a b -- a/b a%b ) ; unsigned; b=0 gives ( 0 a )
            Udivmod = 0x24, "UDIVMOD",
            // =========================
            // Comparison
            // =========================
            /// EQ ( a b -- a==b )
            Eq = 0x25, "EQ",
            /// LT ( a b -- a<b ) ; signed
            Lt = 0x26, "LT",
            /// ULT ( a b -- a<b ) ; unsigned
            Ult = 0x27, "ULT",
            // =========================
            // Return stack and exceptions
            // =========================
            /// PUSHS ( a -- ) ( S: -- a ) ; move to the return stack
            Pushs = 0x28, "PUSHS",
            /// POPS ( -- a ) ( S: a -- ) ; move from the return stack
            Pops = 0x29, "POPS",
            /// DUPS ( -- a ) ( S: a -- a ) ; copy the return-stack top
            Dups = 0x2a, "DUPS",
            /// CATCH ( addr -- ) ; install a handler frame and jump
            Catch = 0x2b, "CATCH",
            /// THROW ( code -- ) ; unwind to the innermost handler
            Throw = 0x2c, "THROW",
            /// BREAK ; pause execution, leaving pc at this word
            Break = 0x2d, "BREAK",
            /// WORD_BYTES ( -- n ) ; bytes per word
            WordBytes = 0x2e, "WORD_BYTES",
            // =========================
            // Register access
            // =========================
            /// GET_SSIZE ( -- n )
            GetSsize = 0x31, "GET_SSIZE",
            /// GET_SP ( -- n )
            GetSp = 0x32, "GET_SP",
            /// SET_SP ( n -- )
            SetSp = 0x33, "SET_SP",
            /// GET_DSIZE ( -- n )
            GetDsize = 0x34, "GET_DSIZE",
            /// GET_DP ( -- n )
            GetDp = 0x35, "GET_DP",
            /// SET_DP ( n -- )
            SetDp = 0x36, "SET_DP",
            /// GET_HANDLER_SP ( -- n )
            GetHandlerSp = 0x37, "GET_HANDLER_SP",
            /// UNDEFINED ; always faults with the invalid-opcode code
            Undefined = 0x3f, "UNDEFINED",
        }
    };
}

macro_rules! define_insns {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal,
        )*
    ) => {
        /// Short-form instruction opcodes.
        ///
        /// Opcode values not in this enum decode to
        /// [`VmError::InvalidOpcode`].
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Insn {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Insn {
            type Error = VmError;

            fn try_from(opcode: u8) -> Result<Self, VmError> {
                match opcode {
                    $( $opcode => Ok(Insn::$name), )*
                    _ => Err(VmError::InvalidOpcode),
                }
            }
        }

        impl Insn {
            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Insn::$name => $mnemonic, )*
                }
            }

            /// Looks an instruction up by its assembly mnemonic.
            pub fn from_mnemonic(token: &str) -> Option<Insn> {
                match token {
                    $( $mnemonic => Some(Insn::$name), )*
                    _ => None,
                }
            }
        }
    };
}

crate::for_each_insn!(define_insns);

/// Whether `value` survives a round trip through a primary-form operand.
pub fn fits_op1(value: Word) -> bool {
    (value.wrapping_shl(OP1_SHIFT)) >> OP1_SHIFT == value
}

/// Whether `value` survives a round trip through a secondary-form operand.
pub fn fits_op2(value: Word) -> bool {
    (value.wrapping_shl(OP2_SHIFT)) >> OP2_SHIFT == value
}

/// Encodes an immediate literal push. The operand must fit (caller checks).
pub fn encode_pushi(value: Word) -> Word {
    assert!(fits_op1(value), "PUSHI operand out of range");
    (value << OP1_SHIFT) | OP_PUSHI as Word
}

/// Encodes an immediate call with a word offset.
pub fn encode_calli(offset: Word) -> Word {
    assert!(fits_op1(offset), "CALLI offset out of range");
    (offset << OP1_SHIFT) | OP_CALLI as Word
}

/// Encodes an immediate relative-address push with a word offset.
pub fn encode_pushreli(offset: Word) -> Word {
    assert!(fits_op1(offset), "PUSHRELI offset out of range");
    (offset << OP1_SHIFT) | OP_PUSHRELI as Word
}

/// Encodes an immediate jump with a word offset.
pub fn encode_jumpi(offset: Word) -> Word {
    assert!(fits_op2(offset), "JUMPI offset out of range");
    (offset << OP2_SHIFT) | OP_JUMPI as Word
}

/// Encodes an immediate conditional jump with a word offset.
pub fn encode_jumpzi(offset: Word) -> Word {
    assert!(fits_op2(offset), "JUMPZI offset out of range");
    (offset << OP2_SHIFT) | OP_JUMPZI as Word
}

/// Encodes a trap call for a library id.
pub fn encode_trap(library: UWord) -> Word {
    assert!(
        library << OP2_SHIFT >> OP2_SHIFT == library,
        "trap library id out of range"
    );
    ((library << OP2_SHIFT) | OP_TRAP) as Word
}

/// Encodes a word of packed short instructions, executed left to right.
pub fn encode_insns(ops: &[Insn]) -> Word {
    assert!(
        !ops.is_empty() && ops.len() <= MAX_PACKED,
        "cannot pack {} instructions into one word",
        ops.len()
    );
    let mut bits: UWord = 0;
    for (i, op) in ops.iter().enumerate() {
        bits |= (*op as UWord) << (INSN_BITS * i as u32);
    }
    ((bits << OP2_SHIFT) | OP_INSN) as Word
}
