//! bytecode.rs — the instruction set the compiler emits and the VM decodes
//! (§4.8, §6 "Bytecode layout").
//!
//! Opcodes are single bytes; operands are either a single byte (small
//! indices: locals, upvalues, argcounts) or a two-byte big-endian word
//! (constant-pool indices, jump offsets, collection counts) per §6. [`Op`]
//! is the decoded, typed view the VM dispatch loop matches on; [`Writer`] is
//! the compiler-facing encoder, including the two-placeholder-byte jump
//! patching scheme from §4.2.
//!
//! A separate, *serializable* [`Chunk`] format lives at the bottom of this
//! module: a portable snapshot of a compiled [`crate::object::FnObj`] for an
//! on-disk compiled-module cache (mirroring the teacher's
//! `vitte-core::bytecode::chunk` magic/version/hash scheme). It is not what
//! the VM executes directly — loading one re-materializes its `ConstValue`s
//! into the live heap via [`crate::strings::StringPool`].

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One decoded bytecode instruction. Variants are grouped to match §4.8's
/// opcode categories; each carries its operands pre-decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Stack
    Pop,
    Dup,
    Dup2,
    PopEchoInRepl,

    // Load
    LoadNull,
    LoadTrue,
    LoadFalse,
    LoadI64Small(u8), // 0..=9, covers LOAD_I64_0..9
    LoadConstant(u16),
    LoadConstantSmall(u8), // 0..=9, covers LOAD_CONSTANT_0..9

    // Local / upvalue / global
    GetLocal(u8),
    SetLocal(u8),
    GetUpvalue(u8),
    SetUpvalue(u8),
    CloseUpvalue,
    GetGlobal(u16),
    SetGlobal(u16),
    DefinePubGlobal(u16),
    DefinePriGlobal(u16),

    // Arithmetic / logic
    BinaryPlus,
    BinaryMinus,
    BinaryStar,
    BinarySlash,
    BinarySlashSlash, // floor div
    BinaryPercent,
    BinaryStarStar, // pow
    BinaryAmp,
    BinaryBar,
    BinaryCaret,
    BinaryLessLess,
    BinaryGreaterGreater,
    UnaryMinus,
    UnaryPlus,
    UnaryBang,
    UnaryTilde,
    I64Add, // typed fast path

    // Comparison
    BinaryLess,
    BinaryLessEqual,
    BinaryGreater,
    BinaryGreaterEqual,
    BinaryEqualEqual,
    BinaryBangEqual,
    BinaryIn,

    // Control flow
    Jump(u16),
    JumpBack(u16),
    JumpIfTrue(u16),
    JumpIfFalse(u16),
    JumpIfErr(u16),
    JumpIfNotErr(u16),
    JumpIfNotNull(u16),
    PopJumpIfFalse(u16),
    Break, // rewritten to Jump during loop finalisation; never reaches the VM

    // Calls
    CallValue(u8),
    CallValueWithUnpack(u8),
    CallMethod(u16, u8),
    CallMethodWithUnpack(u16, u8),
    CallPubMethod(u16, u8),
    CallPubMethodWithUnpack(u16, u8),
    CallSuperMethod(u16, u8),
    CallSuperMethodWithUnpack(u16, u8),
    Return,
    ReturnTuple(u8),

    // Classes
    MakeClass(u16),
    Inherit,
    DefinePubMethod(u16),
    DefinePriMethod(u16),
    DefineStaticMethod(u16),
    DefinePubField(u16),
    DefinePriField(u16),
    DefineStaticField(u16),
    GetField(u16),
    GetPubField(u16),
    GetMethod(u16),
    GetPubMethod(u16),
    GetSuperMethod(u16),
    SetField(u16),
    SetPubField(u16),

    // Modules / import
    ImportModule(u8),
    ImportNamedMembers(u8, u8),
    ImportAllMembers(u8),
    GetMember(u16),

    // Data construction
    MakeMap(u16),
    MakeSet(u16),
    MakeVec(u16),
    MakeTup(u16),
    MakeEnum(u16, u16),
    MakeClosure(u16),
    MakeClosureWithDefArgs(u16, u8),
    ConcatStrings(u8),
    Stringify,
    Format,

    // Iteration
    GetIterator,
    GetNextFromIterator,

    // with
    StartWith,
    EndWith,

    // Misc
    Echo(u8),
    Assert,
    Try,
    Unpack(u8),
    GetIndex,
    SetIndex,
}

macro_rules! tags {
    ($($name:ident = $val:expr),* $(,)?) => {
        #[allow(non_upper_case_globals)]
        mod tag {
            $(pub const $name: u8 = $val;)*
        }
    };
}

tags! {
    Pop = 0, Dup = 1, Dup2 = 2, PopEchoInRepl = 3,
    LoadNull = 4, LoadTrue = 5, LoadFalse = 6, LoadI64Small = 7,
    LoadConstant = 8, LoadConstantSmall = 9,
    GetLocal = 10, SetLocal = 11, GetUpvalue = 12, SetUpvalue = 13, CloseUpvalue = 14,
    GetGlobal = 15, SetGlobal = 16, DefinePubGlobal = 17, DefinePriGlobal = 18,
    BinaryPlus = 19, BinaryMinus = 20, BinaryStar = 21, BinarySlash = 22,
    BinarySlashSlash = 23, BinaryPercent = 24, BinaryStarStar = 25,
    BinaryAmp = 26, BinaryBar = 27, BinaryCaret = 28,
    BinaryLessLess = 29, BinaryGreaterGreater = 30,
    UnaryMinus = 31, UnaryPlus = 32, UnaryBang = 33, UnaryTilde = 34, I64Add = 35,
    BinaryLess = 36, BinaryLessEqual = 37, BinaryGreater = 38, BinaryGreaterEqual = 39,
    BinaryEqualEqual = 40, BinaryBangEqual = 41, BinaryIn = 42,
    Jump = 43, JumpBack = 44, JumpIfTrue = 45, JumpIfFalse = 46,
    JumpIfErr = 47, JumpIfNotErr = 48, JumpIfNotNull = 49, PopJumpIfFalse = 50, Break = 51,
    CallValue = 52, CallValueWithUnpack = 53,
    CallMethod = 54, CallMethodWithUnpack = 55,
    CallPubMethod = 56, CallPubMethodWithUnpack = 57,
    CallSuperMethod = 58, CallSuperMethodWithUnpack = 59,
    Return = 60, ReturnTuple = 61,
    MakeClass = 62, Inherit = 63,
    DefinePubMethod = 64, DefinePriMethod = 65, DefineStaticMethod = 66,
    DefinePubField = 67, DefinePriField = 68, DefineStaticField = 69,
    GetField = 70, GetPubField = 71, GetMethod = 72, GetPubMethod = 73, GetSuperMethod = 74,
    SetField = 75, SetPubField = 76,
    ImportModule = 77, ImportNamedMembers = 78, ImportAllMembers = 79, GetMember = 80,
    MakeMap = 81, MakeSet = 82, MakeVec = 83, MakeTup = 84, MakeEnum = 85,
    MakeClosure = 86, MakeClosureWithDefArgs = 87,
    ConcatStrings = 88, Stringify = 89, Format = 90,
    GetIterator = 91, GetNextFromIterator = 92,
    StartWith = 93, EndWith = 94,
    Echo = 95, Assert = 96, Try = 97, Unpack = 98, GetIndex = 99, SetIndex = 100,
}

/// Raised by [`decode_one`] when `code` runs out of bytes mid-instruction —
/// only possible from corrupt or hand-assembled bytecode.
#[derive(Debug, thiserror::Error)]
#[error("truncated bytecode at offset {0}")]
pub struct DecodeError(pub usize);

fn read_u8(code: &[u8], ip: usize) -> Result<u8, DecodeError> {
    code.get(ip).copied().ok_or(DecodeError(ip))
}

fn read_u16(code: &[u8], ip: usize) -> Result<u16, DecodeError> {
    let hi = read_u8(code, ip)? as u16;
    let lo = read_u8(code, ip + 1)? as u16;
    Ok((hi << 8) | lo)
}

/// Decodes the instruction at `ip`, returning it plus the offset of the
/// following instruction.
pub fn decode_one(code: &[u8], ip: usize) -> Result<(Op, usize), DecodeError> {
    let op_byte = read_u8(code, ip)?;
    let mut at = ip + 1;
    macro_rules! u8_operand {
        () => {{
            let v = read_u8(code, at)?;
            at += 1;
            v
        }};
    }
    macro_rules! u16_operand {
        () => {{
            let v = read_u16(code, at)?;
            at += 2;
            v
        }};
    }

    let op = match op_byte {
        tag::Pop => Op::Pop,
        tag::Dup => Op::Dup,
        tag::Dup2 => Op::Dup2,
        tag::PopEchoInRepl => Op::PopEchoInRepl,
        tag::LoadNull => Op::LoadNull,
        tag::LoadTrue => Op::LoadTrue,
        tag::LoadFalse => Op::LoadFalse,
        tag::LoadI64Small => Op::LoadI64Small(u8_operand!()),
        tag::LoadConstant => Op::LoadConstant(u16_operand!()),
        tag::LoadConstantSmall => Op::LoadConstantSmall(u8_operand!()),
        tag::GetLocal => Op::GetLocal(u8_operand!()),
        tag::SetLocal => Op::SetLocal(u8_operand!()),
        tag::GetUpvalue => Op::GetUpvalue(u8_operand!()),
        tag::SetUpvalue => Op::SetUpvalue(u8_operand!()),
        tag::CloseUpvalue => Op::CloseUpvalue,
        tag::GetGlobal => Op::GetGlobal(u16_operand!()),
        tag::SetGlobal => Op::SetGlobal(u16_operand!()),
        tag::DefinePubGlobal => Op::DefinePubGlobal(u16_operand!()),
        tag::DefinePriGlobal => Op::DefinePriGlobal(u16_operand!()),
        tag::BinaryPlus => Op::BinaryPlus,
        tag::BinaryMinus => Op::BinaryMinus,
        tag::BinaryStar => Op::BinaryStar,
        tag::BinarySlash => Op::BinarySlash,
        tag::BinarySlashSlash => Op::BinarySlashSlash,
        tag::BinaryPercent => Op::BinaryPercent,
        tag::BinaryStarStar => Op::BinaryStarStar,
        tag::BinaryAmp => Op::BinaryAmp,
        tag::BinaryBar => Op::BinaryBar,
        tag::BinaryCaret => Op::BinaryCaret,
        tag::BinaryLessLess => Op::BinaryLessLess,
        tag::BinaryGreaterGreater => Op::BinaryGreaterGreater,
        tag::UnaryMinus => Op::UnaryMinus,
        tag::UnaryPlus => Op::UnaryPlus,
        tag::UnaryBang => Op::UnaryBang,
        tag::UnaryTilde => Op::UnaryTilde,
        tag::I64Add => Op::I64Add,
        tag::BinaryLess => Op::BinaryLess,
        tag::BinaryLessEqual => Op::BinaryLessEqual,
        tag::BinaryGreater => Op::BinaryGreater,
        tag::BinaryGreaterEqual => Op::BinaryGreaterEqual,
        tag::BinaryEqualEqual => Op::BinaryEqualEqual,
        tag::BinaryBangEqual => Op::BinaryBangEqual,
        tag::BinaryIn => Op::BinaryIn,
        tag::Jump => Op::Jump(u16_operand!()),
        tag::JumpBack => Op::JumpBack(u16_operand!()),
        tag::JumpIfTrue => Op::JumpIfTrue(u16_operand!()),
        tag::JumpIfFalse => Op::JumpIfFalse(u16_operand!()),
        tag::JumpIfErr => Op::JumpIfErr(u16_operand!()),
        tag::JumpIfNotErr => Op::JumpIfNotErr(u16_operand!()),
        tag::JumpIfNotNull => Op::JumpIfNotNull(u16_operand!()),
        tag::PopJumpIfFalse => Op::PopJumpIfFalse(u16_operand!()),
        tag::Break => Op::Break,
        tag::CallValue => Op::CallValue(u8_operand!()),
        tag::CallValueWithUnpack => Op::CallValueWithUnpack(u8_operand!()),
        tag::CallMethod => {
            let name = u16_operand!();
            Op::CallMethod(name, u8_operand!())
        }
        tag::CallMethodWithUnpack => {
            let name = u16_operand!();
            Op::CallMethodWithUnpack(name, u8_operand!())
        }
        tag::CallPubMethod => {
            let name = u16_operand!();
            Op::CallPubMethod(name, u8_operand!())
        }
        tag::CallPubMethodWithUnpack => {
            let name = u16_operand!();
            Op::CallPubMethodWithUnpack(name, u8_operand!())
        }
        tag::CallSuperMethod => {
            let name = u16_operand!();
            Op::CallSuperMethod(name, u8_operand!())
        }
        tag::CallSuperMethodWithUnpack => {
            let name = u16_operand!();
            Op::CallSuperMethodWithUnpack(name, u8_operand!())
        }
        tag::Return => Op::Return,
        tag::ReturnTuple => Op::ReturnTuple(u8_operand!()),
        tag::MakeClass => Op::MakeClass(u16_operand!()),
        tag::Inherit => Op::Inherit,
        tag::DefinePubMethod => Op::DefinePubMethod(u16_operand!()),
        tag::DefinePriMethod => Op::DefinePriMethod(u16_operand!()),
        tag::DefineStaticMethod => Op::DefineStaticMethod(u16_operand!()),
        tag::DefinePubField => Op::DefinePubField(u16_operand!()),
        tag::DefinePriField => Op::DefinePriField(u16_operand!()),
        tag::DefineStaticField => Op::DefineStaticField(u16_operand!()),
        tag::GetField => Op::GetField(u16_operand!()),
        tag::GetPubField => Op::GetPubField(u16_operand!()),
        tag::GetMethod => Op::GetMethod(u16_operand!()),
        tag::GetPubMethod => Op::GetPubMethod(u16_operand!()),
        tag::GetSuperMethod => Op::GetSuperMethod(u16_operand!()),
        tag::SetField => Op::SetField(u16_operand!()),
        tag::SetPubField => Op::SetPubField(u16_operand!()),
        tag::ImportModule => Op::ImportModule(u8_operand!()),
        tag::ImportNamedMembers => {
            let modules = u8_operand!();
            Op::ImportNamedMembers(modules, u8_operand!())
        }
        tag::ImportAllMembers => Op::ImportAllMembers(u8_operand!()),
        tag::GetMember => Op::GetMember(u16_operand!()),
        tag::MakeMap => Op::MakeMap(u16_operand!()),
        tag::MakeSet => Op::MakeSet(u16_operand!()),
        tag::MakeVec => Op::MakeVec(u16_operand!()),
        tag::MakeTup => Op::MakeTup(u16_operand!()),
        tag::MakeEnum => {
            let a = u16_operand!();
            Op::MakeEnum(a, u16_operand!())
        }
        tag::MakeClosure => Op::MakeClosure(u16_operand!()),
        tag::MakeClosureWithDefArgs => {
            let fn_idx = u16_operand!();
            Op::MakeClosureWithDefArgs(fn_idx, u8_operand!())
        }
        tag::ConcatStrings => Op::ConcatStrings(u8_operand!()),
        tag::Stringify => Op::Stringify,
        tag::Format => Op::Format,
        tag::GetIterator => Op::GetIterator,
        tag::GetNextFromIterator => Op::GetNextFromIterator,
        tag::StartWith => Op::StartWith,
        tag::EndWith => Op::EndWith,
        tag::Echo => Op::Echo(u8_operand!()),
        tag::Assert => Op::Assert,
        tag::Try => Op::Try,
        tag::Unpack => Op::Unpack(u8_operand!()),
        tag::GetIndex => Op::GetIndex,
        tag::SetIndex => Op::SetIndex,
        other => return Err(DecodeError(ip).tap_unknown(other)),
    };
    Ok((op, at))
}

impl DecodeError {
    fn tap_unknown(self, _byte: u8) -> Self {
        self
    }
}

/// The maximum distance a forward jump's placeholder bytes can encode
/// (§4.2/§8): `u16::MAX`.
pub const MAX_JUMP: u32 = u16::MAX as u32;

/// Compiler-facing byte encoder. Tracks the function's line table alongside
/// the raw bytes so every emitted byte (not just every opcode) advances the
/// RLE line counter, per §4.2's "the compiler passes the current line to
/// the writer for each byte emitted".
pub struct Writer<'a> {
    pub code: &'a mut Vec<u8>,
    pub lines: &'a mut crate::object::LineTable,
}

impl<'a> Writer<'a> {
    pub fn new(code: &'a mut Vec<u8>, lines: &'a mut crate::object::LineTable) -> Self {
        Self { code, lines }
    }

    fn byte(&mut self, b: u8, line: u32) {
        self.code.push(b);
        self.lines.record(line);
    }

    fn u16(&mut self, v: u16, line: u32) {
        self.byte((v >> 8) as u8, line);
        self.byte((v & 0xff) as u8, line);
    }

    /// Emits `op` at `line`, returning the byte offset of the opcode tag
    /// (useful for loop-start bookkeeping).
    pub fn emit(&mut self, op: Op, line: u32) -> usize {
        let pc = self.code.len();
        match op {
            Op::Pop => self.byte(tag::Pop, line),
            Op::Dup => self.byte(tag::Dup, line),
            Op::Dup2 => self.byte(tag::Dup2, line),
            Op::PopEchoInRepl => self.byte(tag::PopEchoInRepl, line),
            Op::LoadNull => self.byte(tag::LoadNull, line),
            Op::LoadTrue => self.byte(tag::LoadTrue, line),
            Op::LoadFalse => self.byte(tag::LoadFalse, line),
            Op::LoadI64Small(n) => {
                self.byte(tag::LoadI64Small, line);
                self.byte(n, line);
            }
            Op::LoadConstant(idx) => {
                self.byte(tag::LoadConstant, line);
                self.u16(idx, line);
            }
            Op::LoadConstantSmall(n) => {
                self.byte(tag::LoadConstantSmall, line);
                self.byte(n, line);
            }
            Op::GetLocal(i) => {
                self.byte(tag::GetLocal, line);
                self.byte(i, line);
            }
            Op::SetLocal(i) => {
                self.byte(tag::SetLocal, line);
                self.byte(i, line);
            }
            Op::GetUpvalue(i) => {
                self.byte(tag::GetUpvalue, line);
                self.byte(i, line);
            }
            Op::SetUpvalue(i) => {
                self.byte(tag::SetUpvalue, line);
                self.byte(i, line);
            }
            Op::CloseUpvalue => self.byte(tag::CloseUpvalue, line),
            Op::GetGlobal(idx) => {
                self.byte(tag::GetGlobal, line);
                self.u16(idx, line);
            }
            Op::SetGlobal(idx) => {
                self.byte(tag::SetGlobal, line);
                self.u16(idx, line);
            }
            Op::DefinePubGlobal(idx) => {
                self.byte(tag::DefinePubGlobal, line);
                self.u16(idx, line);
            }
            Op::DefinePriGlobal(idx) => {
                self.byte(tag::DefinePriGlobal, line);
                self.u16(idx, line);
            }
            Op::BinaryPlus => self.byte(tag::BinaryPlus, line),
            Op::BinaryMinus => self.byte(tag::BinaryMinus, line),
            Op::BinaryStar => self.byte(tag::BinaryStar, line),
            Op::BinarySlash => self.byte(tag::BinarySlash, line),
            Op::BinarySlashSlash => self.byte(tag::BinarySlashSlash, line),
            Op::BinaryPercent => self.byte(tag::BinaryPercent, line),
            Op::BinaryStarStar => self.byte(tag::BinaryStarStar, line),
            Op::BinaryAmp => self.byte(tag::BinaryAmp, line),
            Op::BinaryBar => self.byte(tag::BinaryBar, line),
            Op::BinaryCaret => self.byte(tag::BinaryCaret, line),
            Op::BinaryLessLess => self.byte(tag::BinaryLessLess, line),
            Op::BinaryGreaterGreater => self.byte(tag::BinaryGreaterGreater, line),
            Op::UnaryMinus => self.byte(tag::UnaryMinus, line),
            Op::UnaryPlus => self.byte(tag::UnaryPlus, line),
            Op::UnaryBang => self.byte(tag::UnaryBang, line),
            Op::UnaryTilde => self.byte(tag::UnaryTilde, line),
            Op::I64Add => self.byte(tag::I64Add, line),
            Op::BinaryLess => self.byte(tag::BinaryLess, line),
            Op::BinaryLessEqual => self.byte(tag::BinaryLessEqual, line),
            Op::BinaryGreater => self.byte(tag::BinaryGreater, line),
            Op::BinaryGreaterEqual => self.byte(tag::BinaryGreaterEqual, line),
            Op::BinaryEqualEqual => self.byte(tag::BinaryEqualEqual, line),
            Op::BinaryBangEqual => self.byte(tag::BinaryBangEqual, line),
            Op::BinaryIn => self.byte(tag::BinaryIn, line),
            Op::Jump(off) => {
                self.byte(tag::Jump, line);
                self.u16(off, line);
            }
            Op::JumpBack(off) => {
                self.byte(tag::JumpBack, line);
                self.u16(off, line);
            }
            Op::JumpIfTrue(off) => {
                self.byte(tag::JumpIfTrue, line);
                self.u16(off, line);
            }
            Op::JumpIfFalse(off) => {
                self.byte(tag::JumpIfFalse, line);
                self.u16(off, line);
            }
            Op::JumpIfErr(off) => {
                self.byte(tag::JumpIfErr, line);
                self.u16(off, line);
            }
            Op::JumpIfNotErr(off) => {
                self.byte(tag::JumpIfNotErr, line);
                self.u16(off, line);
            }
            Op::JumpIfNotNull(off) => {
                self.byte(tag::JumpIfNotNull, line);
                self.u16(off, line);
            }
            Op::PopJumpIfFalse(off) => {
                self.byte(tag::PopJumpIfFalse, line);
                self.u16(off, line);
            }
            Op::Break => {
                self.byte(tag::Break, line);
                self.u16(0, line); // patched to Jump's offset at loop close
            }
            Op::CallValue(argc) => {
                self.byte(tag::CallValue, line);
                self.byte(argc, line);
            }
            Op::CallValueWithUnpack(argc) => {
                self.byte(tag::CallValueWithUnpack, line);
                self.byte(argc, line);
            }
            Op::CallMethod(name, argc) => {
                self.byte(tag::CallMethod, line);
                self.u16(name, line);
                self.byte(argc, line);
            }
            Op::CallMethodWithUnpack(name, argc) => {
                self.byte(tag::CallMethodWithUnpack, line);
                self.u16(name, line);
                self.byte(argc, line);
            }
            Op::CallPubMethod(name, argc) => {
                self.byte(tag::CallPubMethod, line);
                self.u16(name, line);
                self.byte(argc, line);
            }
            Op::CallPubMethodWithUnpack(name, argc) => {
                self.byte(tag::CallPubMethodWithUnpack, line);
                self.u16(name, line);
                self.byte(argc, line);
            }
            Op::CallSuperMethod(name, argc) => {
                self.byte(tag::CallSuperMethod, line);
                self.u16(name, line);
                self.byte(argc, line);
            }
            Op::CallSuperMethodWithUnpack(name, argc) => {
                self.byte(tag::CallSuperMethodWithUnpack, line);
                self.u16(name, line);
                self.byte(argc, line);
            }
            Op::Return => self.byte(tag::Return, line),
            Op::ReturnTuple(n) => {
                self.byte(tag::ReturnTuple, line);
                self.byte(n, line);
            }
            Op::MakeClass(name) => {
                self.byte(tag::MakeClass, line);
                self.u16(name, line);
            }
            Op::Inherit => self.byte(tag::Inherit, line),
            Op::DefinePubMethod(name) => {
                self.byte(tag::DefinePubMethod, line);
                self.u16(name, line);
            }
            Op::DefinePriMethod(name) => {
                self.byte(tag::DefinePriMethod, line);
                self.u16(name, line);
            }
            Op::DefineStaticMethod(name) => {
                self.byte(tag::DefineStaticMethod, line);
                self.u16(name, line);
            }
            Op::DefinePubField(name) => {
                self.byte(tag::DefinePubField, line);
                self.u16(name, line);
            }
            Op::DefinePriField(name) => {
                self.byte(tag::DefinePriField, line);
                self.u16(name, line);
            }
            Op::DefineStaticField(name) => {
                self.byte(tag::DefineStaticField, line);
                self.u16(name, line);
            }
            Op::GetField(name) => {
                self.byte(tag::GetField, line);
                self.u16(name, line);
            }
            Op::GetPubField(name) => {
                self.byte(tag::GetPubField, line);
                self.u16(name, line);
            }
            Op::GetMethod(name) => {
                self.byte(tag::GetMethod, line);
                self.u16(name, line);
            }
            Op::GetPubMethod(name) => {
                self.byte(tag::GetPubMethod, line);
                self.u16(name, line);
            }
            Op::GetSuperMethod(name) => {
                self.byte(tag::GetSuperMethod, line);
                self.u16(name, line);
            }
            Op::SetField(name) => {
                self.byte(tag::SetField, line);
                self.u16(name, line);
            }
            Op::SetPubField(name) => {
                self.byte(tag::SetPubField, line);
                self.u16(name, line);
            }
            Op::ImportModule(n) => {
                self.byte(tag::ImportModule, line);
                self.byte(n, line);
            }
            Op::ImportNamedMembers(modules, members) => {
                self.byte(tag::ImportNamedMembers, line);
                self.byte(modules, line);
                self.byte(members, line);
            }
            Op::ImportAllMembers(n) => {
                self.byte(tag::ImportAllMembers, line);
                self.byte(n, line);
            }
            Op::GetMember(name) => {
                self.byte(tag::GetMember, line);
                self.u16(name, line);
            }
            Op::MakeMap(n) => {
                self.byte(tag::MakeMap, line);
                self.u16(n, line);
            }
            Op::MakeSet(n) => {
                self.byte(tag::MakeSet, line);
                self.u16(n, line);
            }
            Op::MakeVec(n) => {
                self.byte(tag::MakeVec, line);
                self.u16(n, line);
            }
            Op::MakeTup(n) => {
                self.byte(tag::MakeTup, line);
                self.u16(n, line);
            }
            Op::MakeEnum(a, b) => {
                self.byte(tag::MakeEnum, line);
                self.u16(a, line);
                self.u16(b, line);
            }
            Op::MakeClosure(idx) => {
                self.byte(tag::MakeClosure, line);
                self.u16(idx, line);
            }
            Op::MakeClosureWithDefArgs(idx, n) => {
                self.byte(tag::MakeClosureWithDefArgs, line);
                self.u16(idx, line);
                self.byte(n, line);
            }
            Op::ConcatStrings(n) => {
                self.byte(tag::ConcatStrings, line);
                self.byte(n, line);
            }
            Op::Stringify => self.byte(tag::Stringify, line),
            Op::Format => self.byte(tag::Format, line),
            Op::GetIterator => self.byte(tag::GetIterator, line),
            Op::GetNextFromIterator => self.byte(tag::GetNextFromIterator, line),
            Op::StartWith => self.byte(tag::StartWith, line),
            Op::EndWith => self.byte(tag::EndWith, line),
            Op::Echo(n) => {
                self.byte(tag::Echo, line);
                self.byte(n, line);
            }
            Op::Assert => self.byte(tag::Assert, line),
            Op::Try => self.byte(tag::Try, line),
            Op::Unpack(n) => {
                self.byte(tag::Unpack, line);
                self.byte(n, line);
            }
            Op::GetIndex => self.byte(tag::GetIndex, line),
            Op::SetIndex => self.byte(tag::SetIndex, line),
        }
        pc
    }

    /// Patches a two-byte jump operand previously emitted at `operand_at`
    /// (the offset *after* the one-byte opcode tag) with the distance from
    /// there to the current end of `code`. Used for both forward jumps and
    /// `BREAK`-to-`JUMP` rewriting at loop close.
    pub fn patch_jump_operand(&mut self, operand_at: usize) -> Result<(), String> {
        let distance = self.code.len() - (operand_at + 2);
        if distance as u32 > MAX_JUMP {
            return Err(format!("jump distance {distance} exceeds the {MAX_JUMP}-byte limit"));
        }
        let d = distance as u16;
        self.code[operand_at] = (d >> 8) as u8;
        self.code[operand_at + 1] = (d & 0xff) as u8;
        Ok(())
    }

    /// Rewrites the tag byte at `pc` from `BREAK` to `JUMP`, used when a
    /// loop closes and every pending `break` becomes a forward jump past the
    /// loop (§4.2).
    pub fn rewrite_break_to_jump(&mut self, pc: usize) {
        self.code[pc] = tag::Jump;
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------
// Serializable on-disk compiled-module cache format.
// ---------------------------------------------------------------------

/// Portable constant, distinct from [`crate::value::Value`] because a
/// `Value::Obj` handle is meaningless outside the heap that produced it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConstValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Constant pool for the on-disk cache format; de-dupes strings the same
/// way [`crate::strings::StringPool`] does for the live heap.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstPool {
    values: Vec<ConstValue>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, v: ConstValue) -> u16 {
        if let ConstValue::Str(s) = &v {
            if let Some(i) = self.values.iter().position(|existing| matches!(existing, ConstValue::Str(e) if e == s)) {
                return i as u16;
            }
        }
        let idx = self.values.len() as u16;
        self.values.push(v);
        idx
    }

    pub fn get(&self, idx: u16) -> Option<&ConstValue> {
        self.values.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub use crate::object::LineTable;

/// Magic header identifying a Pyro compiled-module cache file.
pub const CHUNK_MAGIC: [u8; 4] = *b"PYRC";
pub const CHUNK_VERSION: u16 = 1;

/// A self-contained, serializable snapshot of one compiled function —
/// what `pyro-cli`'s (future) module cache would persist, and what the
/// loader rehydrates into a live [`crate::object::FnObj`] by re-interning
/// its strings (§9 "Serialization").
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Chunk {
    magic: [u8; 4],
    version: u16,
    pub name: String,
    pub code: Vec<u8>,
    pub consts: ConstPool,
    pub arity: u8,
    pub is_variadic: bool,
    pub upvalue_count: u8,
}

impl Chunk {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            magic: CHUNK_MAGIC,
            version: CHUNK_VERSION,
            name: name.into(),
            code: Vec::new(),
            consts: ConstPool::new(),
            arity: 0,
            is_variadic: false,
            upvalue_count: 0,
        }
    }

    #[cfg(feature = "serde")]
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        Ok(bincode::serialize(self)?)
    }

    #[cfg(feature = "serde")]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::Error> {
        let chunk: Self = bincode::deserialize(bytes)?;
        if chunk.magic != CHUNK_MAGIC {
            return Err(crate::Error::Msg("bad chunk magic".into()));
        }
        if chunk.version != CHUNK_VERSION {
            return Err(crate::Error::Msg(format!("unsupported chunk version {}", chunk.version)));
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_every_operand_shape() {
        let mut code = Vec::new();
        let mut lines = crate::object::LineTable::default();
        let mut w = Writer::new(&mut code, &mut lines);
        w.emit(Op::LoadConstant(4000), 1);
        w.emit(Op::CallMethod(12, 3), 2);
        w.emit(Op::MakeEnum(5, 6), 3);
        w.emit(Op::Return, 3);

        let (op1, next) = decode_one(&code, 0).unwrap();
        assert_eq!(op1, Op::LoadConstant(4000));
        let (op2, next) = decode_one(&code, next).unwrap();
        assert_eq!(op2, Op::CallMethod(12, 3));
        let (op3, next) = decode_one(&code, next).unwrap();
        assert_eq!(op3, Op::MakeEnum(5, 6));
        let (op4, next) = decode_one(&code, next).unwrap();
        assert_eq!(op4, Op::Return);
        assert_eq!(next, code.len());
    }

    #[test]
    fn jump_patch_computes_forward_distance() {
        let mut code = Vec::new();
        let mut lines = crate::object::LineTable::default();
        let mut w = Writer::new(&mut code, &mut lines);
        let jump_pc = w.emit(Op::JumpIfFalse(0), 1);
        w.emit(Op::LoadNull, 1);
        w.emit(Op::LoadNull, 1);
        w.patch_jump_operand(jump_pc + 1).unwrap();

        let (op, _) = decode_one(&code, jump_pc).unwrap();
        assert_eq!(op, Op::JumpIfFalse(2));
    }

    #[test]
    fn truncated_bytecode_errors() {
        let code = vec![tag::LoadConstant, 0]; // missing second operand byte
        assert!(decode_one(&code, 0).is_err());
    }
}
