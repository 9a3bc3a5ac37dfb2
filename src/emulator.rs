// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The tracing emulator and its capture decisions.
//!
//! Every instruction is executed concretely against the emulator state
//! while its meta-states decide what reaches the generated code: fully
//! known results propagate symbolically and emit nothing, unknown results
//! are re-emitted with their known source operands folded to immediates,
//! and locations whose runtime content has drifted from the traced content
//! are re-materialized with an immediate load first.

use crate::engine::Flow;
use crate::error::{Error, ErrorKind, Result};
use crate::instruction::{Instr, InstrKind};
use crate::operand::{IndirectAddr, Operand, Width};
use crate::register::Reg;
use crate::state::{CaptureState, EmuState, Flag};
use crate::utils::{fits_i32, parity, sign_extend};
use crate::{marker_dynamic_addr, marker_static_addr, Rewriter, CALL_DEPTH_MAX};

/// A concrete value observed by the trace, together with its meta-state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EmuValue {
    pub value: u64,
    pub state: CaptureState,
}

impl EmuValue {
    fn new(value: u64, state: CaptureState) -> Self {
        Self { value, state }
    }

    #[inline(always)]
    fn is_static(&self) -> bool {
        self.state.is_static()
    }
}

/// Reads `width` bytes of real process memory.
///
/// # Safety
///
/// The caller has classified `addr` as outside the virtual stack; the
/// traced function is responsible for only dereferencing mapped memory.
unsafe fn read_memory(addr: u64, width: Width) -> u64 {
    match width {
        Width::Byte => (addr as *const u8).read_unaligned() as u64,
        Width::Word => (addr as *const u16).read_unaligned() as u64,
        Width::Dword => (addr as *const u32).read_unaligned() as u64,
        Width::Qword => (addr as *const u64).read_unaligned(),
    }
}

impl Rewriter {
    /// Emulates one instruction: mutates the state, captures whatever the
    /// generated code needs, and reports where control continues.
    pub(crate) fn step(&mut self, instr: &Instr) -> Result<Flow> {
        log::trace!("step {:#x}: {instr}", instr.addr);
        match instr.kind {
            InstrKind::Invalid => {
                let byte = instr.dst.and_then(|o| o.as_imm()).unwrap_or(0);
                Err(Error::decode(
                    ErrorKind::BadOpcode,
                    instr.addr,
                    0,
                    format!("unknown opcode {byte:#04x}"),
                ))
            },
            InstrKind::Nop => Ok(Flow::Next),
            InstrKind::Mov => self.exec_mov(instr),
            InstrKind::Movsx | InstrKind::Movzx => self.exec_movx(instr),
            InstrKind::Lea => self.exec_lea(instr),
            InstrKind::Add | InstrKind::Adc | InstrKind::Sub | InstrKind::Sbb
            | InstrKind::And | InstrKind::Or | InstrKind::Xor => self.exec_alu(instr),
            InstrKind::Cmp | InstrKind::Test => self.exec_cmp_test(instr),
            InstrKind::Imul => self.exec_imul(instr),
            InstrKind::Inc | InstrKind::Dec => self.exec_incdec(instr),
            InstrKind::Neg | InstrKind::Not => self.exec_neg_not(instr),
            InstrKind::Shl | InstrKind::Shr | InstrKind::Sar => self.exec_shift(instr),
            InstrKind::Push => self.exec_push(instr),
            InstrKind::Pop => self.exec_pop(instr),
            InstrKind::Leave => self.exec_leave(instr),
            InstrKind::Call => self.exec_call(instr),
            InstrKind::Ret => self.exec_ret(instr),
            InstrKind::Jmp => {
                let target = self.branch_target(instr)?;
                Ok(Flow::Jump(target))
            },
            InstrKind::JmpInd => self.exec_jmp_ind(instr),
            k if k.is_jcc() => self.exec_jcc(instr),
            _ => self.exec_passthrough(instr),
        }
    }

    fn op1(instr: &Instr) -> Result<Operand> {
        instr.dst.ok_or_else(|| Error::emulate(ErrorKind::BadOperands, instr.addr, "missing operand"))
    }

    fn op2(instr: &Instr) -> Result<(Operand, Operand)> {
        match (instr.dst, instr.src) {
            (Some(d), Some(s)) => Ok((d, s)),
            _ => Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "missing operand")),
        }
    }

    fn branch_target(&self, instr: &Instr) -> Result<u64> {
        instr
            .branch_target()
            .ok_or_else(|| Error::emulate(ErrorKind::BadOperands, instr.addr, "branch without target"))
    }

    // Operand evaluation.

    /// Computes the address of an indirect operand. RIP-relative bases
    /// resolve against the end of the instruction and are fully known.
    fn compute_addr(&self, instr: &Instr, a: &IndirectAddr) -> EmuValue {
        if a.base == Some(Reg::RIP) {
            let addr = (instr.addr + instr.len as u64).wrapping_add(a.disp as u64);
            return EmuValue::new(addr, CaptureState::Static);
        }

        let mut value = a.disp as u64;
        let mut state = CaptureState::Static;
        if let Some(base) = a.base {
            value = value.wrapping_add(self.state.get_reg(Reg::gp64(base.index)));
            state = state.combine_additive(self.state.get_reg_state(base));
        }
        if let Some(index) = a.index {
            if a.scale > 0 {
                value = value.wrapping_add(self.state.get_reg(Reg::gp64(index.index)).wrapping_mul(a.scale as u64));
                state = state.combine_additive(self.state.get_reg_state(index));
            }
        }
        EmuValue::new(value, state)
    }

    /// Address of the operand when it is indirect.
    fn operand_addr(&self, instr: &Instr, op: &Operand) -> Option<EmuValue> {
        match op {
            Operand::Ind(a) => Some(self.compute_addr(instr, a)),
            _ => None,
        }
    }

    /// Loads the value behind an address, classifying it as a tracked
    /// stack access or a real-memory access.
    fn load(&mut self, instr: &Instr, addr: EmuValue, width: Width) -> Result<EmuValue> {
        let n = width.bytes() as usize;
        if self.state.on_stack(addr.value, n) {
            let (value, state, _) = self.state.read_stack(addr.value, width);
            // Behind an unknown pointer even known bytes are unknown.
            let state = if addr.state.is_live() && addr.state != CaptureState::Dynamic {
                state
            } else {
                CaptureState::Dynamic
            };
            return Ok(EmuValue::new(value, state));
        }
        if addr.value < self.state.stack_top && addr.value + n as u64 > self.state.stack_start.saturating_sub(self.state.stack_size() as u64) {
            return Err(Error::emulate(
                ErrorKind::BadOperands,
                instr.addr,
                format!("access at {:#x} outside the virtual stack", addr.value),
            ));
        }
        if addr.value < 4096 {
            return Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "null dereference during trace"));
        }

        let value = width.truncate(unsafe { read_memory(addr.value, width) });
        let state = if addr.state == CaptureState::Static2 {
            CaptureState::Static2
        } else {
            CaptureState::Dynamic
        };
        Ok(EmuValue::new(value, state))
    }

    /// Reads the value of an operand (with `addr` as computed by
    /// [operand_addr](Self::operand_addr) for indirect ones).
    fn read_loc(&mut self, instr: &Instr, op: &Operand, addr: Option<EmuValue>) -> Result<EmuValue> {
        match op {
            Operand::Imm(w, v) => Ok(EmuValue::new(w.truncate(*v), CaptureState::Static)),
            Operand::Reg(r) => Ok(EmuValue::new(self.state.get_reg(*r), self.state.get_reg_state(*r))),
            Operand::Ind(a) => {
                let addr = addr.expect("[Rewriter::read_loc] indirect operand without address");
                self.load(instr, addr, a.width)
            },
        }
    }

    fn read_operand(&mut self, instr: &Instr, op: &Operand) -> Result<EmuValue> {
        let addr = self.operand_addr(instr, op);
        self.read_loc(instr, op, addr)
    }

    // Materialization: re-synchronizing runtime state with traced state.

    /// Emits `mov reg, imm` so the runtime register holds its traced value.
    fn materialize_reg(&mut self, reg: Reg, at: u64) -> Result<()> {
        let full = Reg::gp64(reg.index);
        let value = self.state.get_reg(full);
        let mov = Instr::new2(InstrKind::Mov, at, 0, Width::Qword, Operand::Reg(full), Operand::imm64(value));
        self.capture(mov)?;
        self.state.set_reg_synced(full, true);
        Ok(())
    }

    /// Materializes the registers an emitted address expression reads.
    fn ensure_addr_regs(&mut self, a: &IndirectAddr, at: u64) -> Result<()> {
        let mut regs = [a.base, if a.scale > 0 { a.index } else { None }];
        for reg in regs.iter_mut().flatten() {
            if reg.is_ip() {
                continue;
            }
            let full = Reg::gp64(reg.index);
            if self.state.get_reg_state(full).is_static() && !self.state.reg_is_synced(full) {
                self.materialize_reg(full, at)?;
            }
        }
        Ok(())
    }

    /// Emits byte stores for the unsynced statically-known bytes of a
    /// stack window that an emitted instruction is about to observe.
    fn materialize_stack(&mut self, a: &IndirectAddr, base_addr: u64, width: Width, at: u64) -> Result<()> {
        for k in 0..width.bytes() as u64 {
            let (byte, state, synced) = self.state.read_stack(base_addr + k, Width::Byte);
            if synced || !state.is_static() {
                continue;
            }
            let mut slot = *a;
            slot.disp += k as i64;
            slot.width = Width::Byte;
            let mov = Instr::new2(InstrKind::Mov, at, 0, Width::Byte, Operand::Ind(slot), Operand::imm8(byte as u8));
            self.capture(mov)?;
            self.state.sync_stack(base_addr + k, Width::Byte);
        }
        Ok(())
    }

    /// Prepares an indirect operand for emission: resolves RIP-relative
    /// bases to absolutes, folds a known index into the displacement and
    /// re-synchronizes everything the runtime instruction will read.
    fn prepare_mem(&mut self, instr: &Instr, a: IndirectAddr, addr: EmuValue, observes_content: bool) -> Result<Operand> {
        if a.base == Some(Reg::RIP) {
            let mut abs = a;
            abs.base = None;
            abs.index = None;
            abs.scale = 0;
            abs.disp = addr.value as i64;
            return Ok(Operand::Ind(abs));
        }

        let mut a = a;
        if let Some(index) = a.index {
            if a.scale > 0 && self.state.get_reg_state(Reg::gp64(index.index)).is_static() {
                let scaled = self.state.get_reg(Reg::gp64(index.index)).wrapping_mul(a.scale as u64);
                a.disp = a.disp.wrapping_add(scaled as i64);
                a.index = None;
                a.scale = 0;
            }
        }

        self.ensure_addr_regs(&a, instr.addr)?;
        if observes_content && addr.state.is_live() && self.state.on_stack(addr.value, a.width.bytes() as usize) {
            self.materialize_stack(&a, addr.value, a.width, instr.addr)?;
        }
        Ok(Operand::Ind(a))
    }

    /// Folds a known source operand into an immediate where the target
    /// instruction form accepts one; otherwise materializes the operand's
    /// carrier so it can be emitted unchanged.
    fn fold_src(&mut self, instr: &Instr, op: Operand, v: EmuValue, allow_imm64: bool) -> Result<Operand> {
        if v.is_static() {
            let foldable = allow_imm64 || !instr.width.is_qword() || fits_i32(sign_extend(v.value, 8));
            if foldable {
                return Ok(Operand::imm(instr.width, v.value));
            }
            match op {
                Operand::Reg(r) => {
                    let full = Reg::gp64(r.index);
                    if !self.state.reg_is_synced(full) {
                        self.materialize_reg(full, instr.addr)?;
                    }
                    return Ok(op);
                },
                Operand::Ind(a) => {
                    let addr = self.compute_addr(instr, &a);
                    return self.prepare_mem(instr, a, addr, true);
                },
                Operand::Imm(_, _) => return Ok(op),
            }
        }

        match op {
            Operand::Ind(a) => {
                let addr = self.compute_addr(instr, &a);
                self.prepare_mem(instr, a, addr, true)
            },
            _ => Ok(op),
        }
    }

    // The capture decision.

    /// Writes `result` to `dst` and decides what reaches the generated
    /// code. `build` is only invoked when an instruction must be emitted;
    /// it returns the instruction with operands already folded (or None
    /// when an algebraic identity makes the emission unnecessary).
    fn capture_result(
        &mut self,
        instr: &Instr,
        dst: Operand,
        dst_addr: Option<EmuValue>,
        mut result: EmuValue,
        rmw: bool,
        build: impl FnOnce(&mut Self) -> Result<Option<Instr>>,
    ) -> Result<()> {
        let mut forced = false;
        if self.config.force_unknown[self.state.call_depth.min(CALL_DEPTH_MAX)] && result.is_static() {
            result.state = CaptureState::Dynamic;
            forced = true;
        }

        match dst {
            Operand::Reg(r) => {
                // A known result is only elided when the whole register
                // stays known afterwards; a sub-dword write merging into
                // an unknown register must still reach the runtime.
                if result.is_static() && self.merged_reg_state(r, result.state).is_static() {
                    self.state.set_reg(r, result.value);
                    self.set_written_reg_state(r, result.state, false);
                    return Ok(());
                }
                // A stale destination the instruction reads must be
                // re-materialized before the instruction runs.
                if rmw && self.state.get_reg_state(r).is_static() && !self.state.reg_is_synced(Reg::gp64(r.index)) {
                    self.materialize_reg(Reg::gp64(r.index), instr.addr)?;
                }
                let emitted = if forced {
                    self.capture_imm_store(instr, dst, result.value)?
                } else if let Some(i) = build(self)? {
                    self.capture(i)?;
                    true
                } else {
                    false
                };
                self.state.set_reg(r, result.value);
                self.set_written_reg_state(r, result.state, emitted);
                Ok(())
            },
            Operand::Ind(a) => {
                let addr = dst_addr.expect("[Rewriter::capture_result] memory destination without address");
                let tracked = addr.state.is_live()
                    && addr.state != CaptureState::Dynamic
                    && self.state.on_stack(addr.value, a.width.bytes() as usize);

                if result.is_static() && tracked {
                    self.state.write_stack(addr.value, a.width, result.value, result.state, false);
                    return Ok(());
                }
                if result.is_static() {
                    // Known value leaving the tracked world: store it as
                    // an immediate.
                    self.capture_imm_store(instr, dst, result.value)?;
                    if self.state.on_stack(addr.value, a.width.bytes() as usize) {
                        self.state.write_stack(addr.value, a.width, result.value, CaptureState::Dynamic, true);
                    }
                    return Ok(());
                }

                if tracked && rmw {
                    self.materialize_stack(&a, addr.value, a.width, instr.addr)?;
                }
                if forced {
                    self.capture_imm_store(instr, dst, result.value)?;
                } else if let Some(i) = build(self)? {
                    self.capture(i)?;
                }
                if self.state.on_stack(addr.value, a.width.bytes() as usize) {
                    let st = if tracked { result.state } else { CaptureState::Dynamic };
                    self.state.write_stack(addr.value, a.width, result.value, st, true);
                }
                Ok(())
            },
            Operand::Imm(_, _) => Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "immediate destination")),
        }
    }

    /// Meta-state of the full register after writing `state` at the width
    /// of `r`: sub-dword writes merge with the old register content, so
    /// their knowledge merges too.
    fn merged_reg_state(&self, r: Reg, state: CaptureState) -> CaptureState {
        let old = self.state.get_reg_state(Reg::gp64(r.index));
        match r.width() {
            Width::Dword | Width::Qword => state,
            _ if old == CaptureState::Dead => state,
            _ => state.combine(old),
        }
    }

    /// State bookkeeping for a register write.
    fn set_written_reg_state(&mut self, r: Reg, state: CaptureState, emitted: bool) {
        let full = Reg::gp64(r.index);
        let new = self.merged_reg_state(r, state);
        self.state.set_reg_state(r, new);
        let synced = match r.width() {
            Width::Dword | Width::Qword => emitted,
            _ => emitted && self.state.reg_is_synced(full),
        };
        self.state.set_reg_synced(full, synced);
    }

    /// Emits `mov dst, imm` materializing a known value.
    fn capture_imm_store(&mut self, instr: &Instr, dst: Operand, value: u64) -> Result<bool> {
        let dst = match dst {
            Operand::Ind(a) => {
                let addr = self.compute_addr(instr, &a);
                self.prepare_mem(instr, a, addr, false)?
            },
            d => d,
        };
        let mov = Instr::new2(InstrKind::Mov, instr.addr, 0, instr.width, dst, Operand::imm(instr.width, value));
        self.capture(mov)?;
        Ok(true)
    }

    // Flag computation.

    /// Applies the `force_unknown` demotion to a freshly computed flag
    /// state. Without it a known comparison would still fold its branch,
    /// defeating the point of forcing results unknown.
    fn flag_demote(&self, state: CaptureState) -> CaptureState {
        if self.config.force_unknown[self.state.call_depth.min(CALL_DEPTH_MAX)] && state.for_flag().is_static() {
            CaptureState::Dynamic
        } else {
            state
        }
    }

    /// Sets a computed flag, honouring `force_unknown`.
    fn put_flag(&mut self, f: Flag, value: bool, state: CaptureState) {
        let state = self.flag_demote(state);
        self.state.set_flag(f, value, state);
    }

    fn set_result_flags(&mut self, width: Width, res: u64, state: CaptureState) {
        let zf = res == 0;
        let sf = res & width.sign_bit() != 0;
        self.put_flag(Flag::Zero, zf, state);
        self.put_flag(Flag::Sign, sf, state);
        self.put_flag(Flag::Parity, parity(res), state);
    }

    fn set_flags_add(&mut self, width: Width, a: u64, b: u64, carry_in: u64, res: u64, state: CaptureState) {
        let wide = a as u128 + b as u128 + carry_in as u128;
        let cf = wide > width.mask() as u128;
        let of = (a ^ res) & (b ^ res) & width.sign_bit() != 0;
        self.put_flag(Flag::Carry, cf, state);
        self.put_flag(Flag::Overflow, of, state);
        self.set_result_flags(width, res, state);
    }

    fn set_flags_sub(&mut self, width: Width, a: u64, b: u64, borrow_in: u64, res: u64, state: CaptureState) {
        let cf = (b as u128 + borrow_in as u128) > a as u128;
        let of = (a ^ b) & (a ^ res) & width.sign_bit() != 0;
        self.put_flag(Flag::Carry, cf, state);
        self.put_flag(Flag::Overflow, of, state);
        self.set_result_flags(width, res, state);
    }

    /// Bitwise operations clear carry and overflow as known-zero.
    fn set_flags_logic(&mut self, width: Width, res: u64, state: CaptureState) {
        self.put_flag(Flag::Carry, false, CaptureState::Static);
        self.put_flag(Flag::Overflow, false, CaptureState::Static);
        self.set_result_flags(width, res, state);
    }

    // Instruction semantics.

    fn exec_mov(&mut self, instr: &Instr) -> Result<Flow> {
        let (dst, src_op) = Self::op2(instr)?;
        let src = self.read_operand(instr, &src_op)?;
        let result = EmuValue::new(instr.width.truncate(src.value), src.state);
        let dst_addr = self.operand_addr(instr, &dst);

        self.capture_result(instr, dst, dst_addr, result, false, |rw| {
            let s = rw.fold_src(instr, src_op, src, dst.is_reg())?;
            let d = rw.prepare_dst(instr, dst, dst_addr)?;
            Ok(Some(Instr::new2(InstrKind::Mov, instr.addr, 0, instr.width, d, s)))
        })?;
        Ok(Flow::Next)
    }

    fn exec_movx(&mut self, instr: &Instr) -> Result<Flow> {
        let (dst, src_op) = Self::op2(instr)?;
        let src = self.read_operand(instr, &src_op)?;
        let value = if instr.kind == InstrKind::Movsx {
            instr.width.truncate(sign_extend(src.value, src_op.width().bytes()))
        } else {
            src.value
        };
        let result = EmuValue::new(value, src.state);

        self.capture_result(instr, dst, None, result, false, |rw| {
            // The widening form has no immediate variant; a known source
            // folds through a plain mov of the extended value.
            if src.is_static() {
                let d = rw.prepare_dst(instr, dst, None)?;
                return Ok(Some(Instr::new2(InstrKind::Mov, instr.addr, 0, instr.width, d, Operand::imm(instr.width, value))));
            }
            let s = rw.fold_src(instr, src_op, src, false)?;
            Ok(Some(Instr::new2(instr.kind, instr.addr, 0, instr.width, dst, s)))
        })?;
        Ok(Flow::Next)
    }

    fn exec_lea(&mut self, instr: &Instr) -> Result<Flow> {
        let (dst, src_op) = Self::op2(instr)?;
        let a = match src_op {
            Operand::Ind(a) => a,
            _ => return Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "lea needs a memory source")),
        };
        let addr = self.compute_addr(instr, &a);
        let result = EmuValue::new(instr.width.truncate(addr.value), addr.state);

        self.capture_result(instr, dst, None, result, false, |rw| {
            rw.ensure_addr_regs(&a, instr.addr)?;
            Ok(Some(Instr::new2(InstrKind::Lea, instr.addr, 0, instr.width, dst, src_op)))
        })?;
        Ok(Flow::Next)
    }

    fn exec_alu(&mut self, instr: &Instr) -> Result<Flow> {
        let (dst, src_op) = Self::op2(instr)?;
        let src = self.read_operand(instr, &src_op)?;
        let dst_addr = self.operand_addr(instr, &dst);
        let dstv = self.read_loc(instr, &dst, dst_addr)?;

        let w = instr.width;
        let (a, b) = (w.truncate(dstv.value), w.truncate(src.value));

        let (res, state) = match instr.kind {
            InstrKind::Add => {
                let res = w.truncate(a.wrapping_add(b));
                let state = dstv.state.combine_additive(src.state);
                self.set_flags_add(w, a, b, 0, res, state);
                (res, state)
            },
            InstrKind::Adc => {
                let c = self.state.flag(Flag::Carry) as u64;
                let res = w.truncate(a.wrapping_add(b).wrapping_add(c));
                let state = dstv.state.combine_additive(src.state).combine(self.state.flag_state(Flag::Carry));
                self.set_flags_add(w, a, b, c, res, state);
                (res, state)
            },
            InstrKind::Sub => {
                let res = w.truncate(a.wrapping_sub(b));
                let state = dstv.state.combine_additive(src.state);
                self.set_flags_sub(w, a, b, 0, res, state);
                (res, state)
            },
            InstrKind::Sbb => {
                let c = self.state.flag(Flag::Carry) as u64;
                let res = w.truncate(a.wrapping_sub(b).wrapping_sub(c));
                let state = dstv.state.combine_additive(src.state).combine(self.state.flag_state(Flag::Carry));
                self.set_flags_sub(w, a, b, c, res, state);
                (res, state)
            },
            InstrKind::And | InstrKind::Or | InstrKind::Xor => {
                let res = match instr.kind {
                    InstrKind::And => a & b,
                    InstrKind::Or => a | b,
                    _ => a ^ b,
                };
                // Clearing a register with itself produces a known zero.
                let state = if instr.kind == InstrKind::Xor && dst == src_op {
                    CaptureState::Static
                } else {
                    dstv.state.combine(src.state)
                };
                self.set_flags_logic(w, res, state);
                (res, state)
            },
            _ => unreachable!(),
        };

        let kind = instr.kind;
        self.capture_result(instr, dst, dst_addr, EmuValue::new(res, state), true, |rw| {
            let s = rw.fold_src(instr, src_op, src, false)?;
            // add $0 is an identity.
            if kind == InstrKind::Add && s.as_imm() == Some(0) {
                return Ok(None);
            }
            let d = rw.prepare_dst(instr, dst, dst_addr)?;
            Ok(Some(Instr::new2(kind, instr.addr, 0, instr.width, d, s)))
        })?;
        Ok(Flow::Next)
    }

    /// CMP and TEST only produce flags; nothing is emitted while the
    /// controlling operands are known.
    fn exec_cmp_test(&mut self, instr: &Instr) -> Result<Flow> {
        let (dst, src_op) = Self::op2(instr)?;
        let src = self.read_operand(instr, &src_op)?;
        let dst_addr = self.operand_addr(instr, &dst);
        let dstv = self.read_loc(instr, &dst, dst_addr)?;

        let w = instr.width;
        let (a, b) = (w.truncate(dstv.value), w.truncate(src.value));
        let state = dstv.state.combine(src.state);

        if instr.kind == InstrKind::Cmp {
            let res = w.truncate(a.wrapping_sub(b));
            self.set_flags_sub(w, a, b, 0, res, state);
        } else {
            self.set_flags_logic(w, a & b, state);
        }

        if self.flag_demote(state).for_flag().is_static() {
            return Ok(Flow::Next);
        }

        // Dynamic comparison: emit it, folding whichever side is known.
        // Both operands are read, so stale known state must be
        // re-materialized first.
        let s = self.fold_src(instr, src_op, src, false)?;
        let d = match dst {
            Operand::Ind(a) => {
                let addr = dst_addr.expect("[Rewriter::exec_cmp_test] memory operand without address");
                self.prepare_mem(instr, a, addr, true)?
            },
            Operand::Reg(r) if dstv.is_static() => {
                let full = Reg::gp64(r.index);
                if !self.state.reg_is_synced(full) {
                    self.materialize_reg(full, instr.addr)?;
                }
                dst
            },
            _ => dst,
        };
        self.capture(Instr::new2(instr.kind, instr.addr, 0, w, d, s))?;
        Ok(Flow::Next)
    }

    fn exec_imul(&mut self, instr: &Instr) -> Result<Flow> {
        let (dst, src_op) = Self::op2(instr)?;
        let src = self.read_operand(instr, &src_op)?;
        let w = instr.width;

        // Two-operand form multiplies into dst, three-operand into src2.
        let (fa, fb) = match instr.src2 {
            Some(imm_op) => (src, self.read_operand(instr, &imm_op)?),
            None => (self.read_operand(instr, &dst)?, src),
        };
        let (a, b) = (w.truncate(fa.value), w.truncate(fb.value));

        // Multiplying by a known zero gives a known zero, whatever the
        // other factor is.
        let zeroed = fa.is_static() && a == 0 || fb.is_static() && b == 0;
        let state = if zeroed {
            CaptureState::Static
        } else {
            fa.state.combine(fb.state)
        };

        let sa = sign_extend(a, w.bytes()) as i64 as i128;
        let sb = sign_extend(b, w.bytes()) as i64 as i128;
        let full = sa * sb;
        let res = w.truncate(full as u64);
        let of = full != sign_extend(res, w.bytes()) as i64 as i128;

        self.put_flag(Flag::Carry, of, state);
        self.put_flag(Flag::Overflow, of, state);
        self.set_result_flags(w, res, state);

        let has_imm = instr.src2.is_some();
        self.capture_result(instr, dst, None, EmuValue::new(res, state), !has_imm, |rw| {
            let s = rw.fold_src(instr, src_op, src, false)?;
            // Multiplying by one is an identity (or a plain move in the
            // three-operand form).
            if has_imm {
                if instr.src2.and_then(|o| o.as_imm()) == Some(1) {
                    return Ok(Some(Instr::new2(InstrKind::Mov, instr.addr, 0, w, dst, s)));
                }
                let mut i = Instr::new2(InstrKind::Imul, instr.addr, 0, w, dst, s);
                i.src2 = instr.src2;
                return Ok(Some(i));
            }
            if s.as_imm() == Some(1) {
                return Ok(None);
            }
            Ok(Some(Instr::new2(InstrKind::Imul, instr.addr, 0, w, dst, s)))
        })?;
        Ok(Flow::Next)
    }

    fn exec_incdec(&mut self, instr: &Instr) -> Result<Flow> {
        let dst = Self::op1(instr)?;
        let dst_addr = self.operand_addr(instr, &dst);
        let dstv = self.read_loc(instr, &dst, dst_addr)?;
        let w = instr.width;
        let a = w.truncate(dstv.value);
        let state = dstv.state.combine_additive(CaptureState::Static);

        // INC and DEC leave the carry flag untouched.
        let (cf, cf_state) = (self.state.flag(Flag::Carry), self.state.flag_state(Flag::Carry));
        let res = if instr.kind == InstrKind::Inc {
            let r = w.truncate(a.wrapping_add(1));
            self.set_flags_add(w, a, 1, 0, r, state);
            r
        } else {
            let r = w.truncate(a.wrapping_sub(1));
            self.set_flags_sub(w, a, 1, 0, r, state);
            r
        };
        self.state.set_flag(Flag::Carry, cf, cf_state);

        let kind = instr.kind;
        self.capture_result(instr, dst, dst_addr, EmuValue::new(res, state), true, |rw| {
            let d = rw.prepare_dst(instr, dst, dst_addr)?;
            Ok(Some(Instr::new1(kind, instr.addr, 0, w, d)))
        })?;
        Ok(Flow::Next)
    }

    fn exec_neg_not(&mut self, instr: &Instr) -> Result<Flow> {
        let dst = Self::op1(instr)?;
        let dst_addr = self.operand_addr(instr, &dst);
        let dstv = self.read_loc(instr, &dst, dst_addr)?;
        let w = instr.width;
        let a = w.truncate(dstv.value);
        let state = CaptureState::Static.combine(dstv.state);

        let res = if instr.kind == InstrKind::Neg {
            let r = w.truncate(0u64.wrapping_sub(a));
            self.set_flags_sub(w, 0, a, 0, r, state);
            r
        } else {
            w.truncate(!a)
        };

        let kind = instr.kind;
        self.capture_result(instr, dst, dst_addr, EmuValue::new(res, state), true, |rw| {
            let d = rw.prepare_dst(instr, dst, dst_addr)?;
            Ok(Some(Instr::new1(kind, instr.addr, 0, w, d)))
        })?;
        Ok(Flow::Next)
    }

    fn exec_shift(&mut self, instr: &Instr) -> Result<Flow> {
        let (dst, count_op) = Self::op2(instr)?;
        let count_v = self.read_operand(instr, &count_op)?;
        let dst_addr = self.operand_addr(instr, &dst);
        let dstv = self.read_loc(instr, &dst, dst_addr)?;

        let w = instr.width;
        let a = w.truncate(dstv.value);
        let count = count_v.value & if w.is_qword() { 63 } else { 31 };
        let bits = w.bits() as u64;

        let state = dstv.state.combine(count_v.state);
        let res = if count == 0 {
            a
        } else {
            let r = match instr.kind {
                InstrKind::Shl => {
                    if count < 64 { a.wrapping_shl(count as u32) } else { 0 }
                },
                InstrKind::Shr => {
                    if count < bits { a >> count } else { 0 }
                },
                _ => {
                    let sa = sign_extend(a, w.bytes()) as i64;
                    w.truncate((sa >> count.min(bits - 1)) as u64)
                },
            };
            let r = w.truncate(r);

            let cf = match instr.kind {
                InstrKind::Shl => count <= bits && a >> (bits - count) & 1 != 0,
                _ => count <= bits && a >> (count - 1) & 1 != 0
                    || instr.kind == InstrKind::Sar && count > bits && a & w.sign_bit() != 0,
            };
            let of = match instr.kind {
                InstrKind::Shl => (r & w.sign_bit() != 0) != cf,
                InstrKind::Shr => a & w.sign_bit() != 0,
                _ => false,
            };
            self.put_flag(Flag::Carry, cf, state);
            self.put_flag(Flag::Overflow, of, state);
            self.set_result_flags(w, r, state);
            r
        };

        let kind = instr.kind;
        let skip = count == 0 && count_v.is_static();
        self.capture_result(instr, dst, dst_addr, EmuValue::new(res, state), true, |rw| {
            // A shift by a known zero disappears.
            if skip {
                return Ok(None);
            }
            let c = if count_v.is_static() {
                Operand::imm8(count as u8)
            } else {
                count_op
            };
            let d = rw.prepare_dst(instr, dst, dst_addr)?;
            Ok(Some(Instr::new2(kind, instr.addr, 0, w, d, c)))
        })?;
        Ok(Flow::Next)
    }

    /// Prepares the destination operand of an emitted instruction.
    fn prepare_dst(&mut self, instr: &Instr, dst: Operand, dst_addr: Option<EmuValue>) -> Result<Operand> {
        match dst {
            Operand::Ind(a) => {
                let addr = dst_addr.unwrap_or_else(|| self.compute_addr(instr, &a));
                self.prepare_mem(instr, a, addr, false)
            },
            d => Ok(d),
        }
    }

    fn exec_push(&mut self, instr: &Instr) -> Result<Flow> {
        let src_op = Self::op1(instr)?;
        let v = self.read_operand(instr, &src_op)?;

        let rsp = self.state.get_reg(Reg::RSP).wrapping_sub(8);
        if !self.state.on_stack(rsp, 8) {
            return Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "virtual stack overflow on push"));
        }
        self.state.set_reg(Reg::RSP, rsp);
        self.state.write_stack(rsp, Width::Qword, v.value, v.state, true);

        // The push itself is always emitted so the runtime stack pointer
        // stays in lockstep with the emulated one.
        let s = self.fold_src(instr, src_op, v, false)?;
        self.capture(Instr::new1(InstrKind::Push, instr.addr, 0, Width::Qword, s))?;
        Ok(Flow::Next)
    }

    fn exec_pop(&mut self, instr: &Instr) -> Result<Flow> {
        let dst = Self::op1(instr)?;
        let rsp = self.state.get_reg(Reg::RSP);
        if !self.state.on_stack(rsp, 8) {
            return Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "virtual stack underflow on pop"));
        }
        let (value, state, _) = self.state.read_stack(rsp, Width::Qword);
        self.state.set_reg(Reg::RSP, rsp.wrapping_add(8));

        match dst {
            Operand::Reg(r) => {
                self.state.set_reg(r, value);
                if state.is_static() {
                    // Keep the stack pointer moving but skip the load.
                    self.set_written_reg_state(r, state, false);
                    self.capture_rsp_adjust(instr, 8)?;
                } else {
                    self.set_written_reg_state(r, state, true);
                    self.capture(Instr::new1(InstrKind::Pop, instr.addr, 0, Width::Qword, dst))?;
                }
                Ok(Flow::Next)
            },
            Operand::Ind(_) => {
                let dst_addr = self.operand_addr(instr, &dst);
                self.capture_result(instr, dst, dst_addr, EmuValue::new(value, CaptureState::Dynamic), false, |rw| {
                    let d = rw.prepare_dst(instr, dst, dst_addr)?;
                    Ok(Some(Instr::new1(InstrKind::Pop, instr.addr, 0, Width::Qword, d)))
                })?;
                Ok(Flow::Next)
            },
            _ => Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "pop destination")),
        }
    }

    /// Emits `add/sub $n, %rsp` to mirror an elided stack-pointer move.
    fn capture_rsp_adjust(&mut self, instr: &Instr, delta: i64) -> Result<()> {
        let kind = if delta < 0 { InstrKind::Sub } else { InstrKind::Add };
        let i = Instr::new2(
            kind,
            instr.addr,
            0,
            Width::Qword,
            Operand::Reg(Reg::RSP),
            Operand::imm(Width::Qword, delta.unsigned_abs()),
        );
        self.capture(i)
    }

    fn exec_leave(&mut self, instr: &Instr) -> Result<Flow> {
        let rbp = EmuValue::new(self.state.get_reg(Reg::RBP), self.state.get_reg_state(Reg::RBP));
        if !self.state.on_stack(rbp.value, 8) {
            return Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "leave with frame pointer off the virtual stack"));
        }
        let (value, state, _) = self.state.read_stack(rbp.value, Width::Qword);
        self.state.set_reg(Reg::RSP, rbp.value.wrapping_add(8));
        self.state.set_reg_state(Reg::RSP, rbp.state);
        self.state.set_reg(Reg::RBP, value);
        self.set_written_reg_state(Reg::RBP, state, true);

        self.capture(Instr::new0(InstrKind::Leave, instr.addr, 0, Width::Qword))?;
        Ok(Flow::Next)
    }

    fn exec_call(&mut self, instr: &Instr) -> Result<Flow> {
        let target = self.branch_target(instr)?;
        let ret_addr = instr.addr + instr.len as u64;

        // The two marker functions are meta-state coercions, not calls.
        if target == marker_dynamic_addr() {
            let v = EmuValue::new(self.state.get_reg(Reg::RDI), self.state.get_reg_state(Reg::RDI));
            if v.is_static() && !self.state.reg_is_synced(Reg::RDI) {
                self.materialize_reg(Reg::RDI, instr.addr)?;
            }
            self.state.set_reg_state(Reg::RDI, CaptureState::Dynamic);
            self.capture(Instr::new2(
                InstrKind::Mov,
                instr.addr,
                0,
                Width::Qword,
                Operand::Reg(Reg::RAX),
                Operand::Reg(Reg::RDI),
            ))?;
            self.state.set_reg(Reg::RAX, v.value);
            self.set_written_reg_state(Reg::RAX, CaptureState::Dynamic, true);
            log::debug!("marker: {:#x} lowered to dynamic", v.value);
            return Ok(Flow::Jump(ret_addr));
        }
        if target == marker_static_addr() {
            let v = self.state.get_reg(Reg::RDI);
            self.state.set_reg_state(Reg::RDI, CaptureState::Static2);
            self.state.set_reg(Reg::RAX, v);
            self.state.set_reg_state(Reg::RAX, CaptureState::Static2);
            self.state.set_reg_synced(Reg::RAX, false);
            log::debug!("marker: {v:#x} raised to static");
            return Ok(Flow::Jump(ret_addr));
        }

        if self.state.call_depth >= CALL_DEPTH_MAX {
            return Err(Error::emulate(
                ErrorKind::UnsupportedInstr,
                instr.addr,
                format!("call depth exceeds {CALL_DEPTH_MAX}"),
            ));
        }

        // Calls are always inlined: the return address lands on the
        // emulated stack, the trace continues at the callee, and the
        // generated code only keeps the stack-pointer move.
        let rsp = self.state.get_reg(Reg::RSP).wrapping_sub(8);
        if !self.state.on_stack(rsp, 8) {
            return Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "virtual stack overflow on call"));
        }
        self.state.set_reg(Reg::RSP, rsp);
        self.state.write_stack(rsp, Width::Qword, ret_addr, CaptureState::Dynamic, false);
        self.state.ret_stack.push(ret_addr);
        self.state.call_depth += 1;
        self.capture_rsp_adjust(instr, -8)?;
        log::debug!("inlining call to {target:#x} at depth {}", self.state.call_depth);
        Ok(Flow::Jump(target))
    }

    fn exec_ret(&mut self, instr: &Instr) -> Result<Flow> {
        let rsp = self.state.get_reg(Reg::RSP);

        if self.state.call_depth > 0 {
            if !self.state.on_stack(rsp, 8) {
                return Err(Error::emulate(ErrorKind::BadOperands, instr.addr, "virtual stack underflow on ret"));
            }
            let (value, _, _) = self.state.read_stack(rsp, Width::Qword);
            self.state.set_reg(Reg::RSP, rsp.wrapping_add(8));
            self.state.call_depth -= 1;
            let expected = self.state.ret_stack.pop();
            if expected != Some(value) {
                log::warn!("return address {value:#x} does not match inlined call");
            }
            self.capture_rsp_adjust(instr, 8)?;
            return Ok(Flow::Jump(value));
        }

        // Leaving the traced function: the return value register must
        // hold its traced value for real.
        if !self.config.return_fp
            && self.state.get_reg_state(Reg::RAX).is_static()
            && !self.state.reg_is_synced(Reg::RAX)
        {
            self.materialize_reg(Reg::RAX, instr.addr)?;
        }
        self.capture(Instr::new0(InstrKind::Ret, instr.addr, 0, Width::Qword))?;
        self.finish_cbb_ret();
        Ok(Flow::End)
    }

    fn exec_jmp_ind(&mut self, instr: &Instr) -> Result<Flow> {
        let dst = Self::op1(instr)?;
        let v = self.read_operand(instr, &dst)?;
        if v.is_static() {
            return Ok(Flow::Jump(v.value));
        }
        Err(Error::emulate(
            ErrorKind::UnsupportedInstr,
            instr.addr,
            "indirect jump with unknown target",
        ))
    }

    fn exec_jcc(&mut self, instr: &Instr) -> Result<Flow> {
        let target = self.branch_target(instr)?;
        let fall = instr.addr + instr.len as u64;
        let cc = instr.kind.cc();
        let taken = self.state.condition(cc);

        let known = self.config.branches_known
            || EmuState::condition_flags(cc)
                .iter()
                .all(|f| self.state.flag_state(*f).is_static());
        if known {
            log::trace!("{} at {:#x} resolves {}", instr.kind, instr.addr, if taken { "taken" } else { "not taken" });
            return Ok(Flow::Jump(if taken { target } else { fall }));
        }

        self.finish_cbb_jcc(instr.kind, target, fall, taken)?;
        Ok(Flow::End)
    }

    /// Unmodeled instructions: replay them verbatim, with memory operands
    /// prepared and every written location demoted to dynamic.
    fn exec_passthrough(&mut self, instr: &Instr) -> Result<Flow> {
        if instr.kind == InstrKind::Mul {
            return self.exec_mul_widening(instr);
        }
        let pt = instr.passthrough.ok_or_else(|| {
            Error::emulate(ErrorKind::UnsupportedInstr, instr.addr, format!("{} cannot be emulated", instr.kind))
        })?;

        let mut emit = *instr;
        if let Some(Operand::Ind(a)) = instr.src {
            let addr = self.compute_addr(instr, &a);
            emit.src = Some(self.prepare_mem(instr, a, addr, true)?);
        }
        if let Some(Operand::Ind(a)) = instr.dst {
            let addr = self.compute_addr(instr, &a);
            emit.dst = Some(self.prepare_mem(instr, a, addr, !pt.writes_dst)?);
            if pt.writes_dst && self.state.on_stack(addr.value, a.width.bytes() as usize) {
                self.state.write_stack(addr.value, a.width, 0, CaptureState::Dynamic, true);
            }
        } else if let (true, Some(Operand::Reg(r))) = (pt.writes_dst, instr.dst) {
            if r.is_gp() {
                self.state.set_reg(r, 0);
                self.set_written_reg_state(r, CaptureState::Dynamic, true);
            }
        }

        self.capture(emit)?;
        Ok(Flow::Next)
    }

    /// One-operand MUL/IMUL: modeled values (the trace needs RDX:RAX to
    /// stay concrete), passthrough emission.
    fn exec_mul_widening(&mut self, instr: &Instr) -> Result<Flow> {
        let src_op = Self::op1(instr)?;
        let src = self.read_operand(instr, &src_op)?;
        let rax = EmuValue::new(self.state.get_reg(Reg::RAX), self.state.get_reg_state(Reg::RAX));
        let w = instr.width;
        let signed = instr.src2.and_then(|o| o.as_imm()) == Some(5);

        let (a, b) = (w.truncate(rax.value), w.truncate(src.value));
        let full = if signed {
            (sign_extend(a, w.bytes()) as i64 as i128 * sign_extend(b, w.bytes()) as i64 as i128) as u128
        } else {
            a as u128 * b as u128
        };
        let lo = w.truncate(full as u64);
        let hi = w.truncate((full >> w.bits()) as u64);
        let state = if rax.is_static() && a == 0 || src.is_static() && b == 0 {
            CaptureState::Static
        } else {
            rax.state.combine(src.state)
        };

        let overflow = if signed {
            full as i128 != sign_extend(lo, w.bytes()) as i64 as i128
        } else {
            hi != 0
        };
        self.put_flag(Flag::Carry, overflow, state);
        self.put_flag(Flag::Overflow, overflow, state);
        self.set_result_flags(w, lo, state);

        if state.is_static() && !self.config.force_unknown[self.state.call_depth.min(CALL_DEPTH_MAX)] {
            self.state.set_reg(Reg::RAX, lo);
            self.set_written_reg_state(Reg::RAX, state, false);
            if !w.is_byte() {
                self.state.set_reg(Reg::RDX, hi);
                self.set_written_reg_state(Reg::RDX, state, false);
            }
            return Ok(Flow::Next);
        }

        if rax.is_static() && !self.state.reg_is_synced(Reg::RAX) {
            self.materialize_reg(Reg::RAX, instr.addr)?;
        }
        let mut emit = *instr;
        if let Operand::Ind(a) = src_op {
            let addr = self.compute_addr(instr, &a);
            emit.dst = Some(self.prepare_mem(instr, a, addr, true)?);
        } else if let Operand::Reg(r) = src_op {
            let full_reg = Reg::gp64(r.index);
            if src.is_static() && !self.state.reg_is_synced(full_reg) {
                self.materialize_reg(full_reg, instr.addr)?;
            }
        }
        self.capture(emit)?;

        self.state.set_reg(Reg::RAX, lo);
        self.set_written_reg_state(Reg::RAX, CaptureState::Dynamic, true);
        if !w.is_byte() {
            self.state.set_reg(Reg::RDX, hi);
            self.set_written_reg_state(Reg::RDX, CaptureState::Dynamic, true);
        }
        Ok(Flow::Next)
    }
}
