// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instruction-related structs, enums and functions.
//!
//! [Instr] is the unit the decoder produces and the encoder consumes, and
//! [DecodedBasicBlock] a straight-line run of them ending at the first
//! control-flow instruction.

use crate::operand::{Operand, Width};

/// Semantic kind of an instruction.
///
/// Kinds after [Mul](InstrKind::Mul) are recognized by the decoder but not
/// modeled by the emulator; they carry a [Passthrough] record and are
/// re-emitted verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstrKind {
    /// Decode failure sentinel, terminates a block.
    Invalid,
    Nop,
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Mov,
    Movsx,
    Movzx,
    Lea,
    Imul,
    Inc,
    Dec,
    Neg,
    Not,
    Shl,
    Shr,
    Sar,
    Push,
    Pop,
    Leave,
    Call,
    Ret,
    Jmp,
    /// Indirect jump through a register or memory operand.
    JmpInd,
    Jo,
    Jno,
    Jb,
    Jae,
    Je,
    Jne,
    Jbe,
    Ja,
    Js,
    Jns,
    Jp,
    Jnp,
    Jl,
    Jge,
    Jle,
    Jg,
    // Decoded but unmodeled, passthrough only.
    Mul,
    Movsd,
    Addsd,
    Mulsd,
    Subsd,
    Ucomisd,
    Pxor,
    Pcmpeqb,
    Pminub,
    Pmovmskb,
    Movdqu,
    Movd,
    Movq,
}

/// The sixteen conditional jumps in condition-code order (`Jcc` = `0x70 + cc` short).
const JCC: [InstrKind; 16] = [
    InstrKind::Jo, InstrKind::Jno, InstrKind::Jb, InstrKind::Jae,
    InstrKind::Je, InstrKind::Jne, InstrKind::Jbe, InstrKind::Ja,
    InstrKind::Js, InstrKind::Jns, InstrKind::Jp, InstrKind::Jnp,
    InstrKind::Jl, InstrKind::Jge, InstrKind::Jle, InstrKind::Jg,
];

impl InstrKind {
    /// Returns true for the sixteen conditional jump kinds.
    #[inline(always)]
    pub const fn is_jcc(self) -> bool {
        self as usize >= Self::Jo as usize && self as usize <= Self::Jg as usize
    }

    /// Returns the conditional jump of the given x86 condition code.
    pub const fn from_cc(cc: u8) -> Self {
        JCC[cc as usize & 15]
    }

    /// Returns the x86 condition code of a conditional jump.
    ///
    /// Panics when `self` is not a `Jcc`.
    pub fn cc(self) -> u8 {
        assert!(self.is_jcc(), "[InstrKind::cc] {self} is not a conditional jump");
        self as usize as u8 - Self::Jo as usize as u8
    }

    /// Returns true if an instruction of this kind terminates a decoded block.
    pub const fn ends_block(self) -> bool {
        matches!(self, Self::Invalid | Self::Call | Self::Ret | Self::Jmp | Self::JmpInd) || self.is_jcc()
    }
}

impl std::fmt::Display for InstrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = format!("{self:?}").to_lowercase();
        match self {
            Self::Invalid => write!(f, "(invalid)"),
            Self::JmpInd => write!(f, "jmp*"),
            _ => write!(f, "{name}"),
        }
    }
}

bitflags::bitflags! {
    /// Legacy prefixes observed while decoding, kept for passthrough re-emission.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Prefixes: u8 {
        /// Operand-size override, `0x66`.
        const OSIZE = 1 << 0;
        /// `0xF3`.
        const REP = 1 << 1;
        /// `0xF2`.
        const REPNE = 1 << 2;
        /// `0x64`.
        const SEG_FS = 1 << 3;
        /// `0x65`.
        const SEG_GS = 1 << 4;
        /// `0x2E`, branch-not-taken hint on a `Jcc`.
        const BRANCH_HINT = 1 << 5;
    }
}

/// Operand encoding of an opcode, as named in the SDM instruction tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpEncoding {
    /// No ModR/M, no operands in the encoding.
    Np,
    /// ModR/M, r/m is the only operand.
    M,
    /// ModR/M r/m destination, immediate source.
    Mi,
    /// ModR/M r/m destination, reg source.
    Mr,
    /// ModR/M reg destination, r/m source.
    Rm,
    /// ModR/M reg destination, r/m source, immediate third operand.
    Rmi,
    /// Register encoded in the low opcode bits.
    O,
    /// Register in the low opcode bits, immediate source.
    Oi,
    /// Immediate only.
    I,
}

/// Raw encoding of an instruction whose semantics the emulator does not model.
///
/// The decoder fills this in so the instruction can be re-emitted verbatim,
/// with only its operand addressing recomputed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Passthrough {
    /// Opcode bytes, without prefixes.
    pub opcode: [u8; 3],
    /// Number of valid bytes in `opcode`.
    pub opcode_len: u8,
    /// Legacy prefixes to replay in front of the opcode.
    pub prefixes: Prefixes,
    /// REX.W requested by the original encoding.
    pub rex_w: bool,
    /// How the operands map onto ModR/M fields.
    pub encoding: OpEncoding,
    /// True when the instruction writes its destination (the only state
    /// change the emulator needs to account for).
    pub writes_dst: bool,
}

/// A decoded x86-64 instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instr {
    /// The address of the instruction.
    pub addr: u64,
    /// Encoded length in bytes.
    pub len: u8,
    pub kind: InstrKind,
    /// Operation width.
    pub width: Width,
    pub dst: Option<Operand>,
    pub src: Option<Operand>,
    pub src2: Option<Operand>,
    /// Raw encoding for unmodeled instructions.
    pub passthrough: Option<Passthrough>,
}

impl Instr {
    /// Operand-less instruction.
    pub const fn new0(kind: InstrKind, addr: u64, len: u8, width: Width) -> Self {
        Self { addr, len, kind, width, dst: None, src: None, src2: None, passthrough: None }
    }

    /// One-operand instruction.
    pub const fn new1(kind: InstrKind, addr: u64, len: u8, width: Width, dst: Operand) -> Self {
        Self { addr, len, kind, width, dst: Some(dst), src: None, src2: None, passthrough: None }
    }

    /// Two-operand instruction.
    pub const fn new2(kind: InstrKind, addr: u64, len: u8, width: Width, dst: Operand, src: Operand) -> Self {
        Self { addr, len, kind, width, dst: Some(dst), src: Some(src), src2: None, passthrough: None }
    }

    /// Three-operand instruction.
    pub const fn new3(kind: InstrKind, addr: u64, len: u8, width: Width, dst: Operand, src: Operand, src2: Operand) -> Self {
        Self { addr, len, kind, width, dst: Some(dst), src: Some(src), src2: Some(src2), passthrough: None }
    }

    /// Attaches a passthrough record.
    pub const fn with_passthrough(mut self, pt: Passthrough) -> Self {
        self.passthrough = Some(pt);
        self
    }

    /// Returns true for the sixteen conditional jump kinds.
    #[inline(always)]
    pub const fn is_jcc(&self) -> bool {
        self.kind.is_jcc()
    }

    /// The branch target of a direct jump, call or conditional jump.
    pub fn branch_target(&self) -> Option<u64> {
        match self.kind {
            InstrKind::Jmp | InstrKind::Call => self.dst.and_then(|o| o.as_imm()),
            k if k.is_jcc() => self.dst.and_then(|o| o.as_imm()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Instr {
    /// Disassembles the instruction in AT&T operand order (source first).
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        match (self.dst, self.src, self.src2) {
            (Some(d), Some(s), Some(s2)) => write!(f, " {s2}, {s}, {d}"),
            (Some(d), Some(s), None) => write!(f, " {s}, {d}"),
            (Some(d), None, None) => write!(f, " {d}"),
            _ => Ok(()),
        }
    }
}

/// A Decoded Basic Block: straight-line instructions ending at the first
/// control-flow instruction or decode failure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedBasicBlock {
    /// Address of the first instruction.
    pub addr: u64,
    /// Total length in bytes.
    pub len: usize,
    pub instrs: Vec<Instr>,
}

impl DecodedBasicBlock {
    /// Returns the terminating instruction of the block.
    pub fn terminator(&self) -> Option<&Instr> {
        self.instrs.last().filter(|i| i.kind.ends_block())
    }
}

impl std::fmt::Display for DecodedBasicBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "block {:#x} ({} bytes):", self.addr, self.len)?;
        for i in &self.instrs {
            writeln!(f, "  {:#x}: {i}", i.addr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jcc_range() {
        assert!(InstrKind::Jo.is_jcc());
        assert!(InstrKind::Jg.is_jcc());
        assert!(!InstrKind::Jmp.is_jcc());
        assert!(!InstrKind::Mul.is_jcc());
        for cc in 0..16 {
            assert_eq!(InstrKind::from_cc(cc).cc(), cc);
        }
    }

    #[test]
    fn block_terminators() {
        assert!(InstrKind::Ret.ends_block());
        assert!(InstrKind::Call.ends_block());
        assert!(InstrKind::Jne.ends_block());
        assert!(InstrKind::Invalid.ends_block());
        assert!(!InstrKind::Mov.ends_block());
    }
}
