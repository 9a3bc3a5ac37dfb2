// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! x86-64 instruction encoder.
//!
//! Re-synthesizes machine code from captured instructions: REX, ModR/M,
//! optional SIB and displacement are computed from the operands, immediates
//! are narrowed to the shortest legal form, and passthrough instructions
//! replay their recorded prefixes and opcode bytes around a freshly built
//! ModR/M.
//!
//! Control-flow tails (`Jcc`, `jmp`) are emitted by the block linker, not
//! here; see the `encode_jcc_*` and `encode_jmp` helpers at the bottom.

use crate::error::{Error, ErrorKind, Result};
use crate::instruction::{Instr, InstrKind, OpEncoding, Passthrough, Prefixes};
use crate::operand::{Operand, Segment, Width};
use crate::register::{Reg, RegClass};
use crate::utils::{fits_i8, fits_i32, sign_extend};

/// Growable byte buffer for one encoded instruction.
#[derive(Default)]
struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    #[inline(always)]
    fn put_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    #[inline(always)]
    fn put_all(&mut self, s: &[u8]) {
        self.bytes.extend_from_slice(s);
    }

    fn put_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }
}

/// Encodes one captured instruction into bytes.
pub fn encode_instr(instr: &Instr) -> Result<Vec<u8>> {
    let mut buf = CodeBuf::default();

    if let Some(pt) = &instr.passthrough {
        encode_passthrough(&mut buf, instr, pt)?;
        return Ok(buf.bytes);
    }

    match instr.kind {
        InstrKind::Nop => buf.put_u8(0x90),
        InstrKind::Ret => buf.put_u8(0xC3),
        InstrKind::Leave => buf.put_u8(0xC9),
        InstrKind::Mov => encode_mov(&mut buf, instr)?,
        InstrKind::Add | InstrKind::Or | InstrKind::Adc | InstrKind::Sbb
        | InstrKind::And | InstrKind::Sub | InstrKind::Xor | InstrKind::Cmp => {
            encode_alu(&mut buf, instr)?
        },
        InstrKind::Test => encode_test(&mut buf, instr)?,
        InstrKind::Lea => {
            let (dst, src) = operands2(instr)?;
            let reg = expect_reg(&dst, instr)?;
            if !src.is_ind() {
                return Err(bad_operands(instr, "lea needs a memory source"));
            }
            emit_modrm_op(&mut buf, instr.width, &[0x8D], reg.index, &src, false)?;
        },
        InstrKind::Movsx | InstrKind::Movzx => encode_movx(&mut buf, instr)?,
        InstrKind::Imul => encode_imul(&mut buf, instr)?,
        InstrKind::Inc | InstrKind::Dec => {
            let dst = operand1(instr)?;
            let digit = (instr.kind == InstrKind::Dec) as u8;
            let opcode = if instr.width.is_byte() { 0xFE } else { 0xFF };
            emit_modrm_op(&mut buf, instr.width, &[opcode], digit, &dst, op_needs_rex(&dst))?;
        },
        InstrKind::Neg | InstrKind::Not => {
            let dst = operand1(instr)?;
            let digit = if instr.kind == InstrKind::Neg { 3 } else { 2 };
            let opcode = if instr.width.is_byte() { 0xF6 } else { 0xF7 };
            emit_modrm_op(&mut buf, instr.width, &[opcode], digit, &dst, op_needs_rex(&dst))?;
        },
        InstrKind::Shl | InstrKind::Shr | InstrKind::Sar => encode_shift(&mut buf, instr)?,
        InstrKind::Push => encode_push(&mut buf, instr)?,
        InstrKind::Pop => {
            let dst = operand1(instr)?;
            match dst {
                Operand::Reg(r) => {
                    rex(&mut buf, false, 0, 0, r.rex_bit(), false);
                    buf.put_u8(0x58 + r.low3());
                },
                Operand::Ind(_) => emit_modrm_op(&mut buf, Width::Dword, &[0x8F], 0, &dst, false)?,
                _ => return Err(bad_operands(instr, "pop destination")),
            }
        },
        _ => {
            return Err(Error::generate(
                ErrorKind::UnsupportedInstr,
                instr.addr,
                format!("{} has no encoder form", instr.kind),
            ));
        },
    }

    Ok(buf.bytes)
}

fn operand1(instr: &Instr) -> Result<Operand> {
    instr.dst.ok_or_else(|| bad_operands(instr, "missing operand"))
}

fn operands2(instr: &Instr) -> Result<(Operand, Operand)> {
    match (instr.dst, instr.src) {
        (Some(d), Some(s)) => Ok((d, s)),
        _ => Err(bad_operands(instr, "missing operand")),
    }
}

fn expect_reg(op: &Operand, instr: &Instr) -> Result<Reg> {
    op.as_reg().ok_or_else(|| bad_operands(instr, "register operand expected"))
}

fn bad_operands(instr: &Instr, detail: &str) -> Error {
    Error::generate(ErrorKind::BadOperands, instr.addr, format!("{instr}: {detail}"))
}

/// True when the operand forces a REX byte even without extension bits
/// (SPL/BPL/SIL/DIL).
fn op_needs_rex(op: &Operand) -> bool {
    matches!(op, Operand::Reg(r) if r.class == RegClass::Gp8 && (4..=7).contains(&r.index))
}

/// Emits a REX prefix when any of its bits is set or `force` asks for one.
fn rex(buf: &mut CodeBuf, w: bool, r: u8, x: u8, b: u8, force: bool) {
    let mut rex = 0x40u8;
    if w {
        rex |= 0x08;
    }
    rex |= (r & 1) << 2 | (x & 1) << 1 | b & 1;
    if rex != 0x40 || force {
        buf.put_u8(rex);
    }
}

#[inline(always)]
fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md & 3) << 6 | (reg & 7) << 3 | rm & 7
}

#[inline(always)]
fn sib(scale: u8, index: u8, base: u8) -> u8 {
    let ss = match scale {
        2 => 1,
        4 => 2,
        8 => 3,
        _ => 0,
    };
    ss << 6 | (index & 7) << 3 | base & 7
}

/// REX.X and REX.B bits contributed by the r/m operand.
fn rex_xb(rm: &Operand) -> (u8, u8) {
    match rm {
        Operand::Reg(r) => (0, r.rex_bit()),
        Operand::Ind(a) => (
            a.index.map_or(0, |r| r.rex_bit()),
            a.base.map_or(0, |r| r.rex_bit()),
        ),
        Operand::Imm(_, _) => (0, 0),
    }
}

/// Emits ModR/M, optional SIB and displacement for the r/m operand.
///
/// Chooses disp8 over disp32 when the displacement fits, honouring the two
/// addressing quirks: RBP/R13 as base cannot use the no-displacement form,
/// and RSP/R12 as base always needs a SIB byte.
fn put_modrm_sib(buf: &mut CodeBuf, reg: u8, rm: &Operand) -> Result<()> {
    let a = match rm {
        Operand::Reg(r) => {
            buf.put_u8(modrm(3, reg, r.low3()));
            return Ok(());
        },
        Operand::Ind(a) => a,
        Operand::Imm(_, _) => panic!("[put_modrm_sib] immediate cannot be an r/m operand"),
    };

    if a.base == Some(Reg::RIP) {
        // The emulator resolves RIP-relative operands to absolute
        // addresses; one surviving to the encoder would silently change
        // meaning at the new location.
        return Err(Error::generate(
            ErrorKind::UnsupportedOperands,
            0,
            "RIP-relative operand reached the encoder",
        ));
    }

    let index_low3 = a.index.map_or(4, |r| r.low3());

    let Some(base) = a.base else {
        // No base: SIB with base 101, mod 00 and a 32-bit displacement.
        if !fits_i32(a.disp as u64) {
            return Err(Error::generate(ErrorKind::UnsupportedOperands, 0, "absolute displacement exceeds 32 bits"));
        }
        buf.put_u8(modrm(0, reg, 4));
        buf.put_u8(sib(a.scale, index_low3, 5));
        buf.put_u32(a.disp as u32);
        return Ok(());
    };

    if !fits_i32(a.disp as u64) {
        return Err(Error::generate(ErrorKind::UnsupportedOperands, 0, "displacement exceeds 32 bits"));
    }

    let b3 = base.low3();
    let need_sib = a.index.is_some() || b3 == 4;
    // [rbp]/[r13] has no disp-less encoding.
    let md = if a.disp == 0 && b3 != 5 {
        0
    } else if fits_i8(a.disp as u64) {
        1
    } else {
        2
    };

    if need_sib {
        buf.put_u8(modrm(md, reg, 4));
        buf.put_u8(sib(a.scale, index_low3, b3));
    } else {
        buf.put_u8(modrm(md, reg, b3));
    }

    match md {
        1 => buf.put_u8(a.disp as u8),
        2 => buf.put_u32(a.disp as u32),
        _ => {},
    }
    Ok(())
}

/// Emits prefixes, REX, the opcode bytes and the addressing bytes of a
/// ModR/M instruction. The caller appends any immediate.
fn emit_modrm_op(buf: &mut CodeBuf, width: Width, opcode: &[u8], reg: u8, rm: &Operand, force_rex: bool) -> Result<()> {
    if width == Width::Word {
        buf.put_u8(0x66);
    }
    if let Operand::Ind(a) = rm {
        match a.segment {
            Segment::Fs => buf.put_u8(0x64),
            Segment::Gs => buf.put_u8(0x65),
            Segment::None => {},
        }
    }
    let (x, b) = rex_xb(rm);
    rex(buf, width.is_qword(), reg >> 3, x, b, force_rex);
    buf.put_all(opcode);
    put_modrm_sib(buf, reg & 7, rm)
}

/// Appends an immediate of the given encoded width.
fn put_imm(buf: &mut CodeBuf, width: Width, value: u64) {
    match width {
        Width::Byte => buf.put_u8(value as u8),
        Width::Word => buf.put_u16(value as u16),
        _ => buf.put_u32(value as u32),
    }
}

fn encode_mov(buf: &mut CodeBuf, instr: &Instr) -> Result<()> {
    let (dst, src) = operands2(instr)?;
    let w = instr.width;
    let force = op_needs_rex(&dst) || op_needs_rex(&src);

    match (dst, src) {
        (_, Operand::Reg(r)) => {
            let opcode = if w.is_byte() { 0x88 } else { 0x89 };
            emit_modrm_op(buf, w, &[opcode], r.index, &dst, force)
        },
        (Operand::Reg(r), Operand::Ind(_)) => {
            let opcode = if w.is_byte() { 0x8A } else { 0x8B };
            emit_modrm_op(buf, w, &[opcode], r.index, &src, force)
        },
        (Operand::Reg(r), Operand::Imm(_, v)) => {
            if w.is_qword() && !fits_i32(v) {
                // movabs is the only form with a 64-bit immediate.
                rex(buf, true, 0, 0, r.rex_bit(), false);
                buf.put_u8(0xB8 + r.low3());
                buf.put_u64(v);
                return Ok(());
            }
            let opcode = if w.is_byte() { 0xC6 } else { 0xC7 };
            emit_modrm_op(buf, w, &[opcode], 0, &dst, force)?;
            put_imm(buf, w.min(Width::Dword), v);
            Ok(())
        },
        (Operand::Ind(_), Operand::Imm(_, v)) => {
            if w.is_qword() && !fits_i32(v) {
                return Err(Error::generate(
                    ErrorKind::UnsupportedOperands,
                    instr.addr,
                    "64-bit immediate store cannot be encoded",
                ));
            }
            let opcode = if w.is_byte() { 0xC6 } else { 0xC7 };
            emit_modrm_op(buf, w, &[opcode], 0, &dst, force)?;
            put_imm(buf, w.min(Width::Dword), v);
            Ok(())
        },
        _ => Err(bad_operands(instr, "mov form")),
    }
}

/// Opcode digit (and group-1 index) of the eight ALU operations.
fn alu_index(kind: InstrKind) -> u8 {
    match kind {
        InstrKind::Add => 0,
        InstrKind::Or => 1,
        InstrKind::Adc => 2,
        InstrKind::Sbb => 3,
        InstrKind::And => 4,
        InstrKind::Sub => 5,
        InstrKind::Xor => 6,
        _ => 7, // Cmp
    }
}

fn encode_alu(buf: &mut CodeBuf, instr: &Instr) -> Result<()> {
    let (dst, src) = operands2(instr)?;
    let w = instr.width;
    let idx = alu_index(instr.kind);
    let force = op_needs_rex(&dst) || op_needs_rex(&src);

    match (dst, src) {
        (_, Operand::Imm(_, v)) => {
            let sval = sign_extend(v, w.bytes());
            if w.is_qword() && !fits_i32(sval) {
                return Err(Error::generate(
                    ErrorKind::UnsupportedOperands,
                    instr.addr,
                    "64-bit ALU immediate cannot be encoded",
                ));
            }
            if w.is_byte() {
                emit_modrm_op(buf, w, &[0x80], idx, &dst, force)?;
                buf.put_u8(v as u8);
            } else if fits_i8(sval) {
                // The sign-extended imm8 form.
                emit_modrm_op(buf, w, &[0x83], idx, &dst, force)?;
                buf.put_u8(v as u8);
            } else {
                emit_modrm_op(buf, w, &[0x81], idx, &dst, force)?;
                put_imm(buf, w.min(Width::Dword), v);
            }
            Ok(())
        },
        (_, Operand::Reg(r)) => {
            let opcode = idx * 8 + if w.is_byte() { 0 } else { 1 };
            emit_modrm_op(buf, w, &[opcode], r.index, &dst, force)
        },
        (Operand::Reg(r), Operand::Ind(_)) => {
            let opcode = idx * 8 + if w.is_byte() { 2 } else { 3 };
            emit_modrm_op(buf, w, &[opcode], r.index, &src, force)
        },
        _ => Err(bad_operands(instr, "ALU form")),
    }
}

fn encode_test(buf: &mut CodeBuf, instr: &Instr) -> Result<()> {
    let (dst, src) = operands2(instr)?;
    let w = instr.width;
    let force = op_needs_rex(&dst) || op_needs_rex(&src);

    match src {
        Operand::Reg(r) => {
            let opcode = if w.is_byte() { 0x84 } else { 0x85 };
            emit_modrm_op(buf, w, &[opcode], r.index, &dst, force)
        },
        Operand::Imm(_, v) => {
            if w.is_qword() && !fits_i32(sign_extend(v, 8)) {
                return Err(Error::generate(ErrorKind::UnsupportedOperands, instr.addr, "64-bit test immediate"));
            }
            let opcode = if w.is_byte() { 0xF6 } else { 0xF7 };
            emit_modrm_op(buf, w, &[opcode], 0, &dst, force)?;
            put_imm(buf, w.min(Width::Dword), v);
            Ok(())
        },
        _ => Err(bad_operands(instr, "test form")),
    }
}

fn encode_movx(buf: &mut CodeBuf, instr: &Instr) -> Result<()> {
    let (dst, src) = operands2(instr)?;
    let reg = expect_reg(&dst, instr)?;
    let force = op_needs_rex(&src);

    let opcode: &[u8] = match (instr.kind, src.width()) {
        (InstrKind::Movzx, Width::Byte) => &[0x0F, 0xB6],
        (InstrKind::Movzx, Width::Word) => &[0x0F, 0xB7],
        (InstrKind::Movsx, Width::Byte) => &[0x0F, 0xBE],
        (InstrKind::Movsx, Width::Word) => &[0x0F, 0xBF],
        (InstrKind::Movsx, Width::Dword) => &[0x63],
        _ => return Err(bad_operands(instr, "widening move source")),
    };
    emit_modrm_op(buf, instr.width, opcode, reg.index, &src, force)
}

fn encode_imul(buf: &mut CodeBuf, instr: &Instr) -> Result<()> {
    let (dst, src) = operands2(instr)?;
    let reg = expect_reg(&dst, instr)?;

    match instr.src2 {
        None => emit_modrm_op(buf, instr.width, &[0x0F, 0xAF], reg.index, &src, false),
        Some(Operand::Imm(_, v)) => {
            let sval = sign_extend(v, instr.width.bytes());
            if instr.width.is_qword() && !fits_i32(sval) {
                return Err(Error::generate(ErrorKind::UnsupportedOperands, instr.addr, "64-bit imul immediate"));
            }
            if fits_i8(sval) {
                emit_modrm_op(buf, instr.width, &[0x6B], reg.index, &src, false)?;
                buf.put_u8(v as u8);
            } else {
                emit_modrm_op(buf, instr.width, &[0x69], reg.index, &src, false)?;
                put_imm(buf, instr.width.min(Width::Dword), v);
            }
            Ok(())
        },
        _ => Err(bad_operands(instr, "imul third operand")),
    }
}

fn encode_shift(buf: &mut CodeBuf, instr: &Instr) -> Result<()> {
    let (dst, src) = operands2(instr)?;
    let digit = match instr.kind {
        InstrKind::Shl => 4,
        InstrKind::Shr => 5,
        _ => 7, // Sar
    };
    let force = op_needs_rex(&dst);

    match src {
        Operand::Imm(_, 1) => {
            let opcode = if instr.width.is_byte() { 0xD0 } else { 0xD1 };
            emit_modrm_op(buf, instr.width, &[opcode], digit, &dst, force)
        },
        Operand::Imm(_, v) => {
            let opcode = if instr.width.is_byte() { 0xC0 } else { 0xC1 };
            emit_modrm_op(buf, instr.width, &[opcode], digit, &dst, force)?;
            buf.put_u8(v as u8);
            Ok(())
        },
        // Count in CL.
        Operand::Reg(r) if r.index == 1 => {
            let opcode = if instr.width.is_byte() { 0xD2 } else { 0xD3 };
            emit_modrm_op(buf, instr.width, &[opcode], digit, &dst, force)
        },
        _ => Err(bad_operands(instr, "shift count")),
    }
}

fn encode_push(buf: &mut CodeBuf, instr: &Instr) -> Result<()> {
    let dst = operand1(instr)?;
    match dst {
        Operand::Reg(r) => {
            rex(buf, false, 0, 0, r.rex_bit(), false);
            buf.put_u8(0x50 + r.low3());
            Ok(())
        },
        Operand::Imm(_, v) => {
            let sval = sign_extend(v, 8);
            if !fits_i32(sval) {
                return Err(Error::generate(ErrorKind::UnsupportedOperands, instr.addr, "64-bit push immediate"));
            }
            if fits_i8(sval) {
                buf.put_u8(0x6A);
                buf.put_u8(v as u8);
            } else {
                buf.put_u8(0x68);
                buf.put_u32(v as u32);
            }
            Ok(())
        },
        Operand::Ind(_) => emit_modrm_op(buf, Width::Dword, &[0xFF], 6, &dst, false),
    }
}

/// Re-emits an unmodeled instruction: recorded prefixes and opcode bytes
/// around a ModR/M rebuilt from the (possibly rewritten) operands.
fn encode_passthrough(buf: &mut CodeBuf, instr: &Instr, pt: &Passthrough) -> Result<()> {
    if pt.prefixes.contains(Prefixes::OSIZE) {
        buf.put_u8(0x66);
    }
    if pt.prefixes.contains(Prefixes::REP) {
        buf.put_u8(0xF3);
    }
    if pt.prefixes.contains(Prefixes::REPNE) {
        buf.put_u8(0xF2);
    }

    let (reg, rm) = match pt.encoding {
        OpEncoding::Rm => {
            let (dst, src) = operands2(instr)?;
            (expect_reg(&dst, instr)?.index, src)
        },
        OpEncoding::Mr => {
            let (dst, src) = operands2(instr)?;
            (expect_reg(&src, instr)?.index, dst)
        },
        OpEncoding::M => {
            let digit = instr.src2.and_then(|o| o.as_imm()).unwrap_or(0) as u8;
            (digit, operand1(instr)?)
        },
        _ => {
            return Err(Error::generate(
                ErrorKind::UnsupportedOperands,
                instr.addr,
                format!("passthrough encoding {:?}", pt.encoding),
            ));
        },
    };

    if let Operand::Ind(a) = rm {
        match a.segment {
            Segment::Fs => buf.put_u8(0x64),
            Segment::Gs => buf.put_u8(0x65),
            Segment::None => {},
        }
    }
    let (x, b) = rex_xb(&rm);
    rex(buf, pt.rex_w, reg >> 3, x, b, false);
    buf.put_all(&pt.opcode[..pt.opcode_len as usize]);
    put_modrm_sib(buf, reg & 7, &rm)
}

// Control-flow tails, used by the block linker.

/// Displacement range a short `Jcc`/`jmp` can reach.
pub const SHORT_JUMP_MIN: i64 = -120;
pub const SHORT_JUMP_MAX: i64 = 120;

/// Short conditional jump, 2 bytes.
pub fn encode_jcc_short(cc: u8, rel: i8) -> [u8; 2] {
    [0x70 + (cc & 15), rel as u8]
}

/// Near conditional jump, 6 bytes.
pub fn encode_jcc_near(cc: u8, rel: i32) -> [u8; 6] {
    let d = rel.to_le_bytes();
    [0x0F, 0x80 + (cc & 15), d[0], d[1], d[2], d[3]]
}

/// Unconditional near jump, 5 bytes.
pub fn encode_jmp(rel: i32) -> [u8; 5] {
    let d = rel.to_le_bytes();
    [0xE9, d[0], d[1], d[2], d[3]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::IndirectAddr;

    fn enc(i: Instr) -> Vec<u8> {
        encode_instr(&i).unwrap()
    }

    #[test]
    fn mov_reg_reg() {
        let i = Instr::new2(InstrKind::Mov, 0, 0, Width::Qword, Operand::reg(Reg::RAX), Operand::reg(Reg::RBX));
        assert_eq!(enc(i), vec![0x48, 0x89, 0xD8]);
    }

    #[test]
    fn mov_imm_narrows_and_widens() {
        // Fits in a sign-extended imm32: C7 form.
        let i = Instr::new2(InstrKind::Mov, 0, 0, Width::Qword, Operand::reg(Reg::RAX), Operand::imm64(1));
        assert_eq!(enc(i), vec![0x48, 0xC7, 0xC0, 1, 0, 0, 0]);

        // Needs movabs.
        let i = Instr::new2(InstrKind::Mov, 0, 0, Width::Qword, Operand::reg(Reg::R10), Operand::imm64(0x1122334455667788));
        assert_eq!(enc(i), vec![0x49, 0xBA, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn alu_imm8_narrowing() {
        // add $8, %rsp -> 0x83 sign-extended imm8 form.
        let i = Instr::new2(InstrKind::Add, 0, 0, Width::Qword, Operand::reg(Reg::RSP), Operand::imm(Width::Qword, 8));
        assert_eq!(enc(i), vec![0x48, 0x83, 0xC4, 0x08]);

        // 0x7FFFFFFF stays imm32.
        let i = Instr::new2(InstrKind::Add, 0, 0, Width::Qword, Operand::reg(Reg::RAX), Operand::imm(Width::Qword, 0x7FFF_FFFF));
        assert_eq!(enc(i), vec![0x48, 0x81, 0xC0, 0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn alu_imm64_is_rejected() {
        // 0x80000000 does not sign-extend from 32 bits.
        let i = Instr::new2(InstrKind::Add, 0, 0, Width::Qword, Operand::reg(Reg::RAX), Operand::imm(Width::Qword, 0x8000_0000));
        let err = encode_instr(&i).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedOperands);
    }

    #[test]
    fn rsp_base_forces_sib() {
        // mov 0x8(%rsp), %rax
        let i = Instr::new2(InstrKind::Mov, 0, 0, Width::Qword, Operand::reg(Reg::RAX), Operand::ind(Reg::RSP, 8, Width::Qword));
        assert_eq!(enc(i), vec![0x48, 0x8B, 0x44, 0x24, 0x08]);
    }

    #[test]
    fn rbp_base_forces_disp8() {
        // mov (%rbp), %rax has no disp-less encoding.
        let i = Instr::new2(InstrKind::Mov, 0, 0, Width::Qword, Operand::reg(Reg::RAX), Operand::ind(Reg::RBP, 0, Width::Qword));
        assert_eq!(enc(i), vec![0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn scaled_index() {
        // lea (%rdi,%rcx,4), %eax
        let i = Instr::new2(
            InstrKind::Lea,
            0,
            0,
            Width::Dword,
            Operand::reg(Reg::RAX.with_width(Width::Dword)),
            Operand::ind_indexed(Some(Reg::RDI), Reg::RCX, 4, 0, Width::Dword),
        );
        assert_eq!(enc(i), vec![0x8D, 0x04, 0x8F]);
    }

    #[test]
    fn extended_registers_set_rex_bits() {
        // add %r9, %r8
        let i = Instr::new2(InstrKind::Add, 0, 0, Width::Qword, Operand::reg(Reg::R8), Operand::reg(Reg::R9));
        assert_eq!(enc(i), vec![0x4D, 0x01, 0xC8]);
    }

    #[test]
    fn push_pop_forms() {
        let p = Instr::new1(InstrKind::Push, 0, 0, Width::Qword, Operand::reg(Reg::RBP));
        assert_eq!(enc(p), vec![0x55]);
        let p = Instr::new1(InstrKind::Push, 0, 0, Width::Qword, Operand::reg(Reg::R12));
        assert_eq!(enc(p), vec![0x41, 0x54]);
        let p = Instr::new1(InstrKind::Pop, 0, 0, Width::Qword, Operand::reg(Reg::RBP));
        assert_eq!(enc(p), vec![0x5D]);
    }

    #[test]
    fn rip_relative_is_rejected() {
        let src = Operand::Ind(IndirectAddr {
            base: Some(Reg::RIP),
            index: None,
            scale: 0,
            disp: 0x20,
            segment: Segment::None,
            width: Width::Qword,
        });
        let i = Instr::new2(InstrKind::Mov, 0, 0, Width::Qword, Operand::reg(Reg::RAX), src);
        let err = encode_instr(&i).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedOperands);
    }

    #[test]
    fn jump_tails() {
        assert_eq!(encode_jcc_short(4, -2), [0x74, 0xFE]);
        assert_eq!(encode_jcc_near(5, 0x100), [0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(encode_jmp(-5), [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }
}
