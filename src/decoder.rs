// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! x86-64 instruction decoder.
//!
//! [decode_block] lifts raw bytes into a [DecodedBasicBlock], stopping at
//! the first control-flow instruction so that downstream consumers only see
//! straight-line code. Opcodes with unmodeled semantics get a [Passthrough]
//! record so they can be re-emitted verbatim; unknown opcodes terminate the
//! block with an [InstrKind::Invalid] sentinel carrying the offending byte.

use crate::error::{Error, ErrorKind, Result};
use crate::instruction::{DecodedBasicBlock, Instr, InstrKind, OpEncoding, Passthrough, Prefixes};
use crate::operand::{IndirectAddr, Operand, Segment, Width};
use crate::register::{Reg, RegClass};
use crate::utils::{bit, bits, sign_extend};

/// Byte window a block may span before decoding gives up.
pub const BLOCK_WINDOW: usize = 4096;

/// Decodes a basic block from live process memory at `addr`.
///
/// # Safety
///
/// The caller guarantees that `addr` points at executable code of the
/// traced process, readable for up to [BLOCK_WINDOW] bytes.
pub unsafe fn decode_block(addr: u64) -> Result<DecodedBasicBlock> {
    let bytes = std::slice::from_raw_parts(addr as *const u8, BLOCK_WINDOW);
    decode_block_bytes(bytes, addr)
}

/// Decodes a basic block from the given bytes, `addr` being the address of
/// `bytes[0]`.
pub fn decode_block_bytes(bytes: &[u8], addr: u64) -> Result<DecodedBasicBlock> {
    let mut code = Code { bytes, pos: 0, addr };
    let mut dbb = DecodedBasicBlock { addr, len: 0, instrs: Vec::new() };

    loop {
        let instr = decode_instr(&mut code)?;
        let ends = instr.kind.ends_block();
        dbb.instrs.push(instr);
        if ends {
            break;
        }
    }

    dbb.len = code.pos;
    log::trace!("decoded {}", dbb);
    Ok(dbb)
}

/// Cursor over the bytes of one block.
struct Code<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Address of `bytes[0]`.
    addr: u64,
}

impl Code<'_> {
    /// Address of the next unread byte.
    fn cur_addr(&self) -> u64 {
        self.addr + self.pos as u64
    }

    fn next_u8(&mut self) -> Result<u8> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| {
            Error::decode(ErrorKind::BadOpcode, self.addr, self.pos, "block exceeds decode window")
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn next_u16(&mut self) -> Result<u64> {
        let lo = self.next_u8()? as u64;
        let hi = self.next_u8()? as u64;
        Ok(hi << 8 | lo)
    }

    fn next_u32(&mut self) -> Result<u64> {
        let lo = self.next_u16()?;
        let hi = self.next_u16()?;
        Ok(hi << 16 | lo)
    }

    fn next_u64(&mut self) -> Result<u64> {
        let lo = self.next_u32()?;
        let hi = self.next_u32()?;
        Ok(hi << 32 | lo)
    }
}

/// Prefix and REX state accumulated in front of an opcode.
#[derive(Clone, Copy, Default)]
struct PrefixSet {
    prefixes: Prefixes,
    rex: u8,
    has_rex: bool,
}

impl PrefixSet {
    #[inline(always)]
    fn rex_w(&self) -> bool {
        bit(self.rex, 3)
    }

    #[inline(always)]
    fn rex_r(&self) -> u8 {
        bits(self.rex, 2, 2)
    }

    #[inline(always)]
    fn rex_x(&self) -> u8 {
        bits(self.rex, 1, 1)
    }

    #[inline(always)]
    fn rex_b(&self) -> u8 {
        bits(self.rex, 0, 0)
    }

    /// Operation width selected by REX.W and the operand-size prefix.
    fn width(&self) -> Width {
        if self.rex_w() {
            Width::Qword
        } else if self.prefixes.contains(Prefixes::OSIZE) {
            Width::Word
        } else {
            Width::Dword
        }
    }

    fn segment(&self) -> Segment {
        if self.prefixes.contains(Prefixes::SEG_FS) {
            Segment::Fs
        } else if self.prefixes.contains(Prefixes::SEG_GS) {
            Segment::Gs
        } else {
            Segment::None
        }
    }
}

/// Consumes legacy prefixes and an optional REX, in any order.
///
/// A REX byte followed by another prefix is silently dropped by real
/// hardware; decoding mirrors that by only honouring the last one seen
/// before the opcode.
fn decode_prefixes(code: &mut Code) -> Result<PrefixSet> {
    let mut set = PrefixSet::default();

    loop {
        let b = *code.bytes.get(code.pos).ok_or_else(|| {
            Error::decode(ErrorKind::BadPrefix, code.addr, code.pos, "prefixes exceed decode window")
        })?;
        match b {
            0x66 => set.prefixes |= Prefixes::OSIZE,
            0xF2 => set.prefixes |= Prefixes::REPNE,
            0xF3 => set.prefixes |= Prefixes::REP,
            0x64 => set.prefixes |= Prefixes::SEG_FS,
            0x65 => set.prefixes |= Prefixes::SEG_GS,
            0x2E => set.prefixes |= Prefixes::BRANCH_HINT,
            0x40..=0x4F => {
                set.rex = b;
                set.has_rex = true;
            },
            _ => return Ok(set),
        }
        code.pos += 1;
    }
}

/// A parsed ModR/M byte (with optional SIB and displacement).
struct ModRm {
    /// The reg field extended by REX.R: a register index or an opcode digit.
    reg: u8,
    /// The r/m operand.
    rm: Operand,
}

/// General-purpose register of the given width and index. Byte registers
/// resolve to the legacy AH/CH/DH/BH set when no REX prefix is present.
fn gp_reg(width: Width, index: u8, has_rex: bool) -> Reg {
    if width.is_byte() && !has_rex {
        Reg { class: RegClass::Gp8Legacy, index }
    } else {
        Reg { class: RegClass::gp(width), index }
    }
}

/// Parses ModR/M, an optional SIB byte and displacement.
///
/// `width` is the access width the r/m operand gets. RIP-relative operands
/// (mod=00, r/m=101) keep their displacement with [Reg::RIP] as base; the
/// emulator resolves them against the instruction end address.
fn decode_modrm(code: &mut Code, set: &PrefixSet, width: Width) -> Result<ModRm> {
    let modrm = code.next_u8()?;
    let md = bits(modrm, 6, 7);
    let reg = bits(modrm, 3, 5) | set.rex_r() << 3;
    let rm = bits(modrm, 0, 2);

    if md == 3 {
        let r = gp_reg(width, rm | set.rex_b() << 3, set.has_rex);
        return Ok(ModRm { reg, rm: Operand::Reg(r) });
    }

    let mut base = None;
    let mut index = None;
    let mut scale = 0u8;

    if rm == 4 {
        // SIB byte.
        let sib = code.next_u8()?;
        let ss = bits(sib, 6, 7);
        let ix = bits(sib, 3, 5) | set.rex_x() << 3;
        let bs = bits(sib, 0, 2) | set.rex_b() << 3;

        // Index 100 (without REX.X) means no index register.
        if ix != 4 {
            index = Some(Reg::gp64(ix));
            scale = 1 << ss;
        }
        // Base 101 with mod=00 means disp32 and no base.
        if bits(sib, 0, 2) != 5 || md != 0 {
            base = Some(Reg::gp64(bs));
        }
    } else if rm == 5 && md == 0 {
        // RIP-relative.
        base = Some(Reg::RIP);
    } else {
        base = Some(Reg::gp64(rm | set.rex_b() << 3));
    }

    let disp = match md {
        1 => sign_extend(code.next_u8()? as u64, 1) as i64,
        2 => sign_extend(code.next_u32()?, 4) as i64,
        0 if base.is_none() || base == Some(Reg::RIP) => sign_extend(code.next_u32()?, 4) as i64,
        _ => 0,
    };

    let addr = IndirectAddr { base, index, scale, disp, segment: set.segment(), width };
    Ok(ModRm { reg, rm: Operand::Ind(addr) })
}

/// The eight one-byte-opcode ALU operations, indexed by bits 3-5 of the opcode.
const ALU_OPS: [InstrKind; 8] = [
    InstrKind::Add, InstrKind::Or, InstrKind::Adc, InstrKind::Sbb,
    InstrKind::And, InstrKind::Sub, InstrKind::Xor, InstrKind::Cmp,
];

/// Decodes one instruction at the cursor.
fn decode_instr(code: &mut Code) -> Result<Instr> {
    let start = code.pos;
    let addr = code.cur_addr();
    let set = decode_prefixes(code)?;
    let opcode = code.next_u8()?;

    let mut instr = match opcode {
        // ALU block: ADD, OR, ADC, SBB, AND, SUB, XOR, CMP.
        0x00..=0x3F if opcode & 7 <= 5 => decode_alu(code, &set, opcode)?,
        0x50..=0x57 => {
            let r = Reg::gp64(bits(opcode, 0, 2) | set.rex_b() << 3);
            Instr::new1(InstrKind::Push, addr, 0, Width::Qword, Operand::Reg(r))
        },
        0x58..=0x5F => {
            let r = Reg::gp64(bits(opcode, 0, 2) | set.rex_b() << 3);
            Instr::new1(InstrKind::Pop, addr, 0, Width::Qword, Operand::Reg(r))
        },
        0x63 => {
            // MOVSXD: source is always 32 bits, destination follows REX.W.
            let m = decode_modrm(code, &set, Width::Dword)?;
            let dst = Operand::Reg(gp_reg(set.width(), m.reg, set.has_rex));
            Instr::new2(InstrKind::Movsx, addr, 0, set.width(), dst, m.rm)
        },
        0x68 => {
            let imm = sign_extend(code.next_u32()?, 4);
            Instr::new1(InstrKind::Push, addr, 0, Width::Qword, Operand::imm64(imm))
        },
        0x69 | 0x6B => {
            let width = set.width();
            let m = decode_modrm(code, &set, width)?;
            let imm = if opcode == 0x6B {
                sign_extend(code.next_u8()? as u64, 1)
            } else {
                sign_extend(code.next_u32()?, 4)
            };
            let dst = Operand::Reg(gp_reg(width, m.reg, set.has_rex));
            Instr::new3(InstrKind::Imul, addr, 0, width, dst, m.rm, Operand::imm(width, imm))
        },
        0x6A => {
            let imm = sign_extend(code.next_u8()? as u64, 1);
            Instr::new1(InstrKind::Push, addr, 0, Width::Qword, Operand::imm64(imm))
        },
        0x70..=0x7F => {
            let disp = sign_extend(code.next_u8()? as u64, 1) as i64;
            let target = code.cur_addr().wrapping_add(disp as u64);
            Instr::new1(InstrKind::from_cc(opcode & 15), addr, 0, Width::Qword, Operand::imm64(target))
        },
        0x80 | 0x81 | 0x83 => decode_group1(code, &set, opcode)?,
        0x84 | 0x85 => {
            let width = if opcode == 0x84 { Width::Byte } else { set.width() };
            let m = decode_modrm(code, &set, width)?;
            let src = Operand::Reg(gp_reg(width, m.reg, set.has_rex));
            Instr::new2(InstrKind::Test, addr, 0, width, m.rm, src)
        },
        0x88 | 0x89 | 0x8A | 0x8B => {
            let width = if opcode & 1 == 0 { Width::Byte } else { set.width() };
            let m = decode_modrm(code, &set, width)?;
            let reg = Operand::Reg(gp_reg(width, m.reg, set.has_rex));
            if bit(opcode, 1) {
                Instr::new2(InstrKind::Mov, addr, 0, width, reg, m.rm)
            } else {
                Instr::new2(InstrKind::Mov, addr, 0, width, m.rm, reg)
            }
        },
        0x8D => {
            let width = set.width();
            let m = decode_modrm(code, &set, width)?;
            if !m.rm.is_ind() {
                return invalid(code, addr, start, opcode);
            }
            let dst = Operand::Reg(gp_reg(width, m.reg, set.has_rex));
            Instr::new2(InstrKind::Lea, addr, 0, width, dst, m.rm)
        },
        0x8F => {
            let m = decode_modrm(code, &set, Width::Qword)?;
            if m.reg & 7 != 0 {
                return invalid(code, addr, start, opcode);
            }
            Instr::new1(InstrKind::Pop, addr, 0, Width::Qword, m.rm)
        },
        0x90 => Instr::new0(InstrKind::Nop, addr, 0, Width::Dword),
        0xA8 => {
            let imm = code.next_u8()? as u64;
            let al = Operand::Reg(gp_reg(Width::Byte, 0, set.has_rex));
            Instr::new2(InstrKind::Test, addr, 0, Width::Byte, al, Operand::imm8(imm as u8))
        },
        0xA9 => {
            let width = set.width();
            let imm = decode_imm_wd(code, width)?;
            let acc = Operand::Reg(Reg::gp(width, 0));
            Instr::new2(InstrKind::Test, addr, 0, width, acc, Operand::imm(width, imm))
        },
        0xB0..=0xB7 => {
            let r = gp_reg(Width::Byte, bits(opcode, 0, 2) | set.rex_b() << 3, set.has_rex);
            let imm = code.next_u8()? as u64;
            Instr::new2(InstrKind::Mov, addr, 0, Width::Byte, Operand::Reg(r), Operand::imm8(imm as u8))
        },
        0xB8..=0xBF => {
            let width = set.width();
            let r = Reg::gp(width, bits(opcode, 0, 2) | set.rex_b() << 3);
            // The only x86-64 form with a full 64-bit immediate.
            let imm = if width.is_qword() { code.next_u64()? } else { decode_imm_wd(code, width)? };
            Instr::new2(InstrKind::Mov, addr, 0, width, Operand::Reg(r), Operand::Imm(width, imm))
        },
        0xC0 | 0xC1 | 0xD1 | 0xD3 => decode_group2(code, &set, opcode, addr, start)?,
        0xC3 => Instr::new0(InstrKind::Ret, addr, 0, Width::Qword),
        0xC6 | 0xC7 => {
            let width = if opcode == 0xC6 { Width::Byte } else { set.width() };
            let m = decode_modrm(code, &set, width)?;
            if m.reg & 7 != 0 {
                return invalid(code, addr, start, opcode);
            }
            // imm32 is sign-extended to 64 bits by the hardware.
            let raw = decode_imm_wd(code, width.min(Width::Dword))?;
            let imm = if width.is_qword() { sign_extend(raw, 4) } else { raw };
            Instr::new2(InstrKind::Mov, addr, 0, width, m.rm, Operand::Imm(width, width.truncate(imm)))
        },
        0xC9 => Instr::new0(InstrKind::Leave, addr, 0, Width::Qword),
        0xE8 => {
            let disp = sign_extend(code.next_u32()?, 4) as i64;
            let target = code.cur_addr().wrapping_add(disp as u64);
            Instr::new1(InstrKind::Call, addr, 0, Width::Qword, Operand::imm64(target))
        },
        0xE9 => {
            let disp = sign_extend(code.next_u32()?, 4) as i64;
            let target = code.cur_addr().wrapping_add(disp as u64);
            Instr::new1(InstrKind::Jmp, addr, 0, Width::Qword, Operand::imm64(target))
        },
        0xEB => {
            let disp = sign_extend(code.next_u8()? as u64, 1) as i64;
            let target = code.cur_addr().wrapping_add(disp as u64);
            Instr::new1(InstrKind::Jmp, addr, 0, Width::Qword, Operand::imm64(target))
        },
        0xF6 | 0xF7 => decode_group3(code, &set, opcode, addr, start)?,
        0xFE | 0xFF => decode_group45(code, &set, opcode, addr, start)?,
        0x0F => decode_0f(code, &set, addr, start)?,
        _ => return invalid(code, addr, start, opcode),
    };

    instr.addr = addr;
    instr.len = (code.pos - start) as u8;
    Ok(instr)
}

/// Terminates decoding with an `Invalid` sentinel carrying the offending byte.
fn invalid(code: &Code, addr: u64, start: usize, opcode: u8) -> Result<Instr> {
    let mut i = Instr::new1(InstrKind::Invalid, addr, (code.pos - start) as u8, Width::Byte, Operand::imm8(opcode));
    i.len = i.len.max(1);
    Ok(i)
}

/// Immediate of the operation width (16- and 32-bit ops read their width,
/// 64-bit ops read a sign-extended imm32).
fn decode_imm_wd(code: &mut Code, width: Width) -> Result<u64> {
    match width {
        Width::Byte => code.next_u8().map(|b| b as u64),
        Width::Word => code.next_u16(),
        Width::Dword => code.next_u32(),
        Width::Qword => code.next_u32().map(|v| sign_extend(v, 4)),
    }
}

/// `00-3D`: the MR/RM/accumulator-immediate ALU forms.
fn decode_alu(code: &mut Code, set: &PrefixSet, opcode: u8) -> Result<Instr> {
    let kind = ALU_OPS[bits(opcode, 3, 5) as usize];
    let byte_op = opcode & 1 == 0;
    let width = if byte_op { Width::Byte } else { set.width() };

    match opcode & 7 {
        // MR: r/m, reg.
        0 | 1 => {
            let m = decode_modrm(code, set, width)?;
            let src = Operand::Reg(gp_reg(width, m.reg, set.has_rex));
            Ok(Instr::new2(kind, 0, 0, width, m.rm, src))
        },
        // RM: reg, r/m.
        2 | 3 => {
            let m = decode_modrm(code, set, width)?;
            let dst = Operand::Reg(gp_reg(width, m.reg, set.has_rex));
            Ok(Instr::new2(kind, 0, 0, width, dst, m.rm))
        },
        // Accumulator, immediate.
        4 | 5 => {
            let imm = decode_imm_wd(code, width)?;
            let acc = Operand::Reg(gp_reg(width, 0, set.has_rex));
            Ok(Instr::new2(kind, 0, 0, width, acc, Operand::imm(width, imm)))
        },
        _ => unreachable!(),
    }
}

/// Group 1: `80/81/83 /digit`, ALU r/m, imm.
fn decode_group1(code: &mut Code, set: &PrefixSet, opcode: u8) -> Result<Instr> {
    let width = if opcode == 0x80 { Width::Byte } else { set.width() };
    let m = decode_modrm(code, set, width)?;
    let kind = ALU_OPS[(m.reg & 7) as usize];

    let imm = match opcode {
        0x80 => code.next_u8()? as u64,
        // Sign-extended imm8 variant.
        0x83 => sign_extend(code.next_u8()? as u64, 1),
        _ => decode_imm_wd(code, width.min(Width::Dword))?,
    };
    let imm = if width.is_qword() && opcode == 0x81 { sign_extend(imm, 4) } else { imm };

    Ok(Instr::new2(kind, 0, 0, width, m.rm, Operand::imm(width, imm)))
}

/// Group 2: the shift group. Only SHL (4), SHR (5) and SAR (7) are handled.
fn decode_group2(code: &mut Code, set: &PrefixSet, opcode: u8, addr: u64, start: usize) -> Result<Instr> {
    let width = if opcode == 0xC0 { Width::Byte } else { set.width() };
    let m = decode_modrm(code, set, width)?;
    let kind = match m.reg & 7 {
        4 => InstrKind::Shl,
        5 => InstrKind::Shr,
        7 => InstrKind::Sar,
        _ => return invalid(code, addr, start, opcode),
    };

    let count = match opcode {
        0xD1 => Operand::imm8(1),
        0xD3 => Operand::Reg(Reg::gp(Width::Byte, 1)),
        _ => Operand::imm8(code.next_u8()?),
    };
    Ok(Instr::new2(kind, 0, 0, width, m.rm, count))
}

/// Group 3: `F6/F7 /digit`. TEST, NOT and NEG are modeled; one-operand
/// MUL/IMUL pass through with their RDX:RAX side effect flagged.
fn decode_group3(code: &mut Code, set: &PrefixSet, opcode: u8, addr: u64, start: usize) -> Result<Instr> {
    let width = if opcode == 0xF6 { Width::Byte } else { set.width() };
    let m = decode_modrm(code, set, width)?;

    match m.reg & 7 {
        0 => {
            let raw = decode_imm_wd(code, width.min(Width::Dword))?;
            let imm = if width.is_qword() { sign_extend(raw, 4) } else { raw };
            Ok(Instr::new2(InstrKind::Test, 0, 0, width, m.rm, Operand::imm(width, imm)))
        },
        2 => Ok(Instr::new1(InstrKind::Not, 0, 0, width, m.rm)),
        3 => Ok(Instr::new1(InstrKind::Neg, 0, 0, width, m.rm)),
        4 | 5 => {
            let pt = Passthrough {
                opcode: [opcode, 0, 0],
                opcode_len: 1,
                prefixes: set.prefixes & Prefixes::OSIZE,
                rex_w: set.rex_w(),
                encoding: OpEncoding::M,
                writes_dst: false,
            };
            let mut i = Instr::new1(InstrKind::Mul, 0, 0, width, m.rm);
            // Keep the /digit in src2 so the encoder can rebuild ModR/M.
            i.src2 = Some(Operand::imm8(m.reg & 7));
            Ok(i.with_passthrough(pt))
        },
        _ => invalid(code, addr, start, opcode),
    }
}

/// Groups 4 and 5: `FE/FF /digit`. INC, DEC, indirect JMP and PUSH.
fn decode_group45(code: &mut Code, set: &PrefixSet, opcode: u8, addr: u64, start: usize) -> Result<Instr> {
    let width = if opcode == 0xFE { Width::Byte } else { set.width() };

    match opcode {
        0xFE => {
            let m = decode_modrm(code, set, width)?;
            match m.reg & 7 {
                0 => Ok(Instr::new1(InstrKind::Inc, 0, 0, width, m.rm)),
                1 => Ok(Instr::new1(InstrKind::Dec, 0, 0, width, m.rm)),
                _ => invalid(code, addr, start, opcode),
            }
        },
        _ => {
            // Peek the digit first: JMP and PUSH operate on 64 bits
            // regardless of REX.W.
            let digit = bits(*code.bytes.get(code.pos).ok_or_else(|| {
                Error::decode(ErrorKind::BadOpcode, code.addr, code.pos, "block exceeds decode window")
            })?, 3, 5);
            let w = match digit {
                4 | 6 => Width::Qword,
                _ => width,
            };
            let m = decode_modrm(code, set, w)?;
            match m.reg & 7 {
                0 => Ok(Instr::new1(InstrKind::Inc, 0, 0, w, m.rm)),
                1 => Ok(Instr::new1(InstrKind::Dec, 0, 0, w, m.rm)),
                4 => Ok(Instr::new1(InstrKind::JmpInd, 0, 0, Width::Qword, m.rm)),
                6 => Ok(Instr::new1(InstrKind::Push, 0, 0, Width::Qword, m.rm)),
                _ => invalid(code, addr, start, opcode),
            }
        },
    }
}

/// Rewrites a GP register operand into the XMM register of the same index.
fn as_xmm(op: Operand) -> Operand {
    match op {
        Operand::Reg(r) if r.is_gp() => Operand::Reg(Reg::xmm(r.index)),
        _ => op,
    }
}

/// Two-byte opcodes (`0F xx`).
fn decode_0f(code: &mut Code, set: &PrefixSet, addr: u64, start: usize) -> Result<Instr> {
    let opcode = code.next_u8()?;
    let repne = set.prefixes.contains(Prefixes::REPNE);
    let rep = set.prefixes.contains(Prefixes::REP);
    let osize = set.prefixes.contains(Prefixes::OSIZE);

    // SSE passthrough helper: operands in RM or MR order on XMM registers.
    let sse = |code: &mut Code, kind, mandatory: Prefixes, mr: bool| -> Result<Instr> {
        let m = decode_modrm(code, set, Width::Qword)?;
        let reg = Operand::Reg(Reg::xmm(m.reg));
        let rm = as_xmm(m.rm);
        let pt = Passthrough {
            opcode: [0x0F, opcode, 0],
            opcode_len: 2,
            prefixes: mandatory,
            rex_w: set.rex_w(),
            encoding: if mr { OpEncoding::Mr } else { OpEncoding::Rm },
            writes_dst: true,
        };
        let i = if mr {
            Instr::new2(kind, 0, 0, Width::Qword, rm, reg)
        } else {
            Instr::new2(kind, 0, 0, Width::Qword, reg, rm)
        };
        Ok(i.with_passthrough(pt))
    };

    match opcode {
        0x10 if repne => sse(code, InstrKind::Movsd, Prefixes::REPNE, false),
        0x11 if repne => sse(code, InstrKind::Movsd, Prefixes::REPNE, true),
        0x1F => {
            // Multi-byte NOP; the operand only pads the encoding.
            let m = decode_modrm(code, set, set.width())?;
            if m.reg & 7 != 0 {
                return invalid(code, addr, start, opcode);
            }
            Ok(Instr::new0(InstrKind::Nop, 0, 0, set.width()))
        },
        0x2E if osize => sse(code, InstrKind::Ucomisd, Prefixes::OSIZE, false),
        0x58 if repne => sse(code, InstrKind::Addsd, Prefixes::REPNE, false),
        0x59 if repne => sse(code, InstrKind::Mulsd, Prefixes::REPNE, false),
        0x5C if repne => sse(code, InstrKind::Subsd, Prefixes::REPNE, false),
        0x6E if osize => {
            // MOVD/MOVQ xmm, r/m32|64.
            let w = if set.rex_w() { Width::Qword } else { Width::Dword };
            let m = decode_modrm(code, set, w)?;
            let kind = if set.rex_w() { InstrKind::Movq } else { InstrKind::Movd };
            let pt = Passthrough {
                opcode: [0x0F, 0x6E, 0],
                opcode_len: 2,
                prefixes: Prefixes::OSIZE,
                rex_w: set.rex_w(),
                encoding: OpEncoding::Rm,
                writes_dst: true,
            };
            Ok(Instr::new2(kind, 0, 0, w, Operand::Reg(Reg::xmm(m.reg)), m.rm).with_passthrough(pt))
        },
        0x6F if rep => sse(code, InstrKind::Movdqu, Prefixes::REP, false),
        0x74 if osize => sse(code, InstrKind::Pcmpeqb, Prefixes::OSIZE, false),
        0x7E if osize => {
            // MOVD/MOVQ r/m32|64, xmm.
            let w = if set.rex_w() { Width::Qword } else { Width::Dword };
            let m = decode_modrm(code, set, w)?;
            let kind = if set.rex_w() { InstrKind::Movq } else { InstrKind::Movd };
            let pt = Passthrough {
                opcode: [0x0F, 0x7E, 0],
                opcode_len: 2,
                prefixes: Prefixes::OSIZE,
                rex_w: set.rex_w(),
                encoding: OpEncoding::Mr,
                writes_dst: true,
            };
            Ok(Instr::new2(kind, 0, 0, w, m.rm, Operand::Reg(Reg::xmm(m.reg))).with_passthrough(pt))
        },
        0x7F if rep => sse(code, InstrKind::Movdqu, Prefixes::REP, true),
        0x80..=0x8F => {
            let disp = sign_extend(code.next_u32()?, 4) as i64;
            let target = code.cur_addr().wrapping_add(disp as u64);
            Ok(Instr::new1(InstrKind::from_cc(opcode & 15), 0, 0, Width::Qword, Operand::imm64(target)))
        },
        0xAF => {
            let width = set.width();
            let m = decode_modrm(code, set, width)?;
            let dst = Operand::Reg(gp_reg(width, m.reg, set.has_rex));
            Ok(Instr::new2(InstrKind::Imul, 0, 0, width, dst, m.rm))
        },
        0xB6 | 0xB7 | 0xBE | 0xBF => {
            // MOVZX/MOVSX from a byte or word source.
            let src_width = if opcode & 1 == 0 { Width::Byte } else { Width::Word };
            let kind = if opcode >= 0xBE { InstrKind::Movsx } else { InstrKind::Movzx };
            let m = decode_modrm(code, set, src_width)?;
            let dst = Operand::Reg(gp_reg(set.width(), m.reg, set.has_rex));
            Ok(Instr::new2(kind, 0, 0, set.width(), dst, m.rm))
        },
        0xD7 if osize => {
            // PMOVMSKB r32, xmm.
            let m = decode_modrm(code, set, Width::Dword)?;
            let pt = Passthrough {
                opcode: [0x0F, 0xD7, 0],
                opcode_len: 2,
                prefixes: Prefixes::OSIZE,
                rex_w: false,
                encoding: OpEncoding::Rm,
                writes_dst: true,
            };
            let dst = Operand::Reg(Reg::gp(Width::Dword, m.reg));
            Ok(Instr::new2(InstrKind::Pmovmskb, 0, 0, Width::Dword, dst, as_xmm(m.rm)).with_passthrough(pt))
        },
        0xDA if osize => sse(code, InstrKind::Pminub, Prefixes::OSIZE, false),
        0xEF if osize => sse(code, InstrKind::Pxor, Prefixes::OSIZE, false),
        _ => invalid(code, addr, start, opcode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Instr {
        let dbb = decode_block_bytes(bytes, 0x1000).unwrap();
        dbb.instrs[0]
    }

    #[test]
    fn alu_mr_form() {
        // add %rsi, %rdi
        let i = decode_one(&[0x48, 0x01, 0xF7, 0xC3]);
        assert_eq!(i.kind, InstrKind::Add);
        assert_eq!(i.width, Width::Qword);
        assert_eq!(i.dst, Some(Operand::reg(Reg::RDI)));
        assert_eq!(i.src, Some(Operand::reg(Reg::RSI)));
        assert_eq!(i.len, 3);
    }

    #[test]
    fn group1_sign_extended_imm8() {
        // sub $8, %rsp
        let i = decode_one(&[0x48, 0x83, 0xEC, 0x08, 0xC3]);
        assert_eq!(i.kind, InstrKind::Sub);
        assert_eq!(i.dst, Some(Operand::reg(Reg::RSP)));
        assert_eq!(i.src, Some(Operand::imm(Width::Qword, 8)));
    }

    #[test]
    fn sib_and_disp() {
        // mov 0x10(%rdi,%rcx,8), %rax
        let i = decode_one(&[0x48, 0x8B, 0x44, 0xCF, 0x10, 0xC3]);
        assert_eq!(i.kind, InstrKind::Mov);
        assert_eq!(i.dst, Some(Operand::reg(Reg::RAX)));
        assert_eq!(i.src, Some(Operand::ind_indexed(Some(Reg::RDI), Reg::RCX, 8, 0x10, Width::Qword)));
    }

    #[test]
    fn rip_relative_base() {
        // mov 0x20(%rip), %eax
        let i = decode_one(&[0x8B, 0x05, 0x20, 0x00, 0x00, 0x00, 0xC3]);
        let src = i.src.unwrap();
        match src {
            Operand::Ind(a) => {
                assert_eq!(a.base, Some(Reg::RIP));
                assert_eq!(a.disp, 0x20);
            },
            _ => panic!("expected indirect source, got {src}"),
        }
    }

    #[test]
    fn jcc_short_computes_absolute_target() {
        // je +4 at 0x1000 (2-byte instruction, so target 0x1006)
        let i = decode_one(&[0x74, 0x04, 0xC3]);
        assert_eq!(i.kind, InstrKind::Je);
        assert_eq!(i.dst, Some(Operand::imm64(0x1006)));
    }

    #[test]
    fn block_ends_at_control_flow() {
        // xor %eax, %eax; ret; (garbage after)
        let dbb = decode_block_bytes(&[0x31, 0xC0, 0xC3, 0xFF, 0xFF], 0x2000).unwrap();
        assert_eq!(dbb.instrs.len(), 2);
        assert_eq!(dbb.len, 3);
        assert_eq!(dbb.terminator().unwrap().kind, InstrKind::Ret);
    }

    #[test]
    fn unknown_opcode_is_invalid_sentinel() {
        // 0x0E is not a valid opcode in 64-bit mode.
        let dbb = decode_block_bytes(&[0x90, 0x0E], 0x3000).unwrap();
        assert_eq!(dbb.instrs.len(), 2);
        let last = dbb.instrs.last().unwrap();
        assert_eq!(last.kind, InstrKind::Invalid);
        assert_eq!(last.dst, Some(Operand::imm8(0x0E)));
    }

    #[test]
    fn movabs_keeps_full_immediate() {
        // movabs $0x1122334455667788, %r10
        let i = decode_one(&[0x49, 0xBA, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xC3]);
        assert_eq!(i.kind, InstrKind::Mov);
        assert_eq!(i.dst, Some(Operand::reg(Reg::R10)));
        assert_eq!(i.src, Some(Operand::imm64(0x1122334455667788)));
    }

    #[test]
    fn sse_passthrough_records_encoding() {
        // addsd %xmm1, %xmm0
        let i = decode_one(&[0xF2, 0x0F, 0x58, 0xC1, 0xC3]);
        assert_eq!(i.kind, InstrKind::Addsd);
        let pt = i.passthrough.unwrap();
        assert_eq!(&pt.opcode[..2], &[0x0F, 0x58]);
        assert_eq!(pt.encoding, OpEncoding::Rm);
        assert!(pt.prefixes.contains(Prefixes::REPNE));
    }
}
