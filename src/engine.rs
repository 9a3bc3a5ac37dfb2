// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rewrite engine.
//!
//! Drives the decoder and emulator over a work list of captured basic
//! blocks, each keyed by `(address, emulator-state id)`, then lays the
//! blocks out, encodes them into executable memory and patches the
//! conditional and unconditional jumps between them.

use crate::decoder;
use crate::encoder::{encode_instr, encode_jcc_near, encode_jcc_short, encode_jmp, SHORT_JUMP_MAX, SHORT_JUMP_MIN};
use crate::error::{Error, ErrorKind, Result};
use crate::instruction::{Instr, InstrKind};
use crate::register::Reg;
use crate::state::CaptureState;
use crate::{Rewriter, MAX_PARAMETERS};

/// Index of a captured basic block in the rewriter's arena.
pub(crate) type CbbId = usize;

/// Bounded pool sizes. Exceeding them means the function is too complex
/// for the configured specialization, which is a fatal rewrite error.
pub(crate) const SAVED_STATE_MAX: usize = 20;
pub(crate) const WORK_STACK_MAX: usize = 20;
pub(crate) const GEN_ORDER_MAX: usize = 20;
pub(crate) const CBB_CAPTURE_MAX: usize = 256;

/// The System V integer parameter registers, in order.
pub(crate) const PARAM_REGS: [Reg; MAX_PARAMETERS] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8];

/// A Captured Basic Block.
#[derive(Clone, Debug, Default)]
pub(crate) struct Cbb {
    /// Decoded address this block was traced from.
    pub addr: u64,
    /// Saved-state id the trace started with.
    pub es_id: usize,
    /// Captured instructions.
    pub instrs: Vec<Instr>,
    /// Kind of the instruction that ended the block (`Ret` or a `Jcc`).
    pub end_kind: Option<InstrKind>,
    /// Observed branch direction of the terminating `Jcc`.
    pub prefer_branch: bool,
    pub next_branch: Option<CbbId>,
    pub next_fallthrough: Option<CbbId>,
    /// Encoded body bytes (filled by the link passes).
    pub body: Vec<u8>,
    /// Preliminary offset during layout, final address after linking.
    pub layout_off: usize,
    pub addr_final: u64,
    pub short_jcc: bool,
}

impl Cbb {
    fn new(addr: u64, es_id: usize) -> Self {
        Self { addr, es_id, ..Self::default() }
    }
}

/// Control-flow outcome of emulating one instruction.
pub(crate) enum Flow {
    /// Fall through to the next instruction.
    Next,
    /// Continue the trace at the given address.
    Jump(u64),
    /// The current captured block is complete.
    End,
}

impl Rewriter {
    /// Traces the configured function with the given argument values and
    /// generates a specialized copy of it.
    ///
    /// Returns the entry address of the generated code. On failure the
    /// error is also retained for [last_error](Rewriter::last_error).
    pub fn rewrite(&mut self, args: &[u64]) -> Result<u64> {
        match self.rewrite_inner(args) {
            Ok(addr) => {
                self.last_error = None;
                Ok(addr)
            },
            Err(e) => {
                log::warn!("rewrite failed: {e}");
                self.last_error = Some(e.clone());
                Err(e)
            },
        }
    }

    fn rewrite_inner(&mut self, args: &[u64]) -> Result<u64> {
        if self.config.func == 0 {
            return Err(Error::capture(ErrorKind::BadOperands, 0, "no function configured"));
        }

        self.saved.clear();
        self.cbbs.clear();
        self.cbb_index.clear();
        self.work.clear();
        self.gen_order.clear();
        self.dbb_cache.clear();
        self.code.clear();
        self.entry = 0;
        self.generated_size = 0;
        self.state.reset();

        // Parameters per the System V ABI; everything else enters the
        // trace as an unknown value.
        for i in 0..self.state.regs.len() {
            self.state.reg_state[i] = CaptureState::Dynamic;
        }
        for i in 0..self.state.flag_state.len() {
            self.state.flag_state[i] = CaptureState::Dynamic;
        }
        for (i, reg) in PARAM_REGS.iter().enumerate().take(self.config.par_count) {
            let value = args.get(i).copied().unwrap_or(0);
            self.state.set_reg(*reg, value);
            self.state.set_reg_state(*reg, self.config.par_state[i]);
            log::debug!("parameter {i} = {value:#x} ({:?})", self.config.par_state[i]);
        }
        self.state.set_reg(Reg::RSP, self.state.stack_top);
        self.state.set_reg_state(Reg::RSP, CaptureState::StackRelative);
        self.state.rip = self.config.func;

        let es0 = self.save_state()?;
        let entry = self.get_or_create_cbb(self.config.func, es0)?;
        self.push_work(entry)?;

        while let Some(id) = self.work.pop() {
            if self.cbbs[id].end_kind.is_some() {
                continue;
            }
            self.current = Some(id);
            let snap = self.saved[self.cbbs[id].es_id].clone();
            self.state.restore_from(&snap);
            self.state.parent = Some(self.cbbs[id].es_id);
            self.state.rip = self.cbbs[id].addr;
            log::debug!("tracing block {:#x} with state {}", self.cbbs[id].addr, self.cbbs[id].es_id);
            self.trace_current()?;
        }
        self.current = None;

        for id in 0..self.cbbs.len() {
            self.opt_pass(id);
        }

        self.compute_gen_order(entry)?;
        let addr = self.generate()?;
        self.entry = addr;
        log::debug!("generated {} bytes at {addr:#x}", self.generated_size);
        Ok(addr)
    }

    /// Decodes and emulates instructions until the current block ends.
    fn trace_current(&mut self) -> Result<()> {
        loop {
            let instrs = self.decode_cached(self.state.rip)?;
            let mut jumped = false;
            for instr in instrs {
                self.state.rip = instr.addr + instr.len as u64;
                match self.step(&instr)? {
                    Flow::Next => {},
                    Flow::Jump(target) => {
                        self.state.rip = target;
                        jumped = true;
                        break;
                    },
                    Flow::End => return Ok(()),
                }
            }
            if !jumped {
                // Decoded blocks always end at a control-flow instruction,
                // and those never fall through.
                return Err(Error::emulate(ErrorKind::UnsupportedInstr, self.state.rip, "block fell off its terminator"));
            }
        }
    }

    /// Decodes the block starting at `addr`, reusing a cached decode of
    /// the same address.
    fn decode_cached(&mut self, addr: u64) -> Result<Vec<Instr>> {
        if let Some(dbb) = self.dbb_cache.get(&addr) {
            return Ok(dbb.instrs.clone());
        }
        let dbb = unsafe { decoder::decode_block(addr)? };
        let instrs = dbb.instrs.clone();
        self.dbb_cache.insert(addr, dbb);
        Ok(instrs)
    }

    /// Saves the current emulator state, returning the id of an existing
    /// equal snapshot when there is one.
    pub(crate) fn save_state(&mut self) -> Result<usize> {
        for (i, snap) in self.saved.iter().enumerate() {
            if self.state.matches(snap) {
                log::trace!("state save reuses id {i}");
                return Ok(i);
            }
        }
        if self.saved.len() >= SAVED_STATE_MAX {
            return Err(Error::capture(ErrorKind::BufferOverflow, self.state.rip, "out of saved-state slots"));
        }
        self.saved.push(self.state.snapshot());
        log::trace!("state saved as id {}", self.saved.len() - 1);
        Ok(self.saved.len() - 1)
    }

    /// Returns the block for `(addr, es_id)`, creating it on first use.
    pub(crate) fn get_or_create_cbb(&mut self, addr: u64, es_id: usize) -> Result<CbbId> {
        if let Some(&id) = self.cbb_index.get(&(addr, es_id)) {
            return Ok(id);
        }
        let id = self.cbbs.len();
        self.cbbs.push(Cbb::new(addr, es_id));
        self.cbb_index.insert((addr, es_id), id);
        Ok(id)
    }

    fn push_work(&mut self, id: CbbId) -> Result<()> {
        if self.cbbs[id].end_kind.is_some() || self.work.contains(&id) {
            return Ok(());
        }
        if self.work.len() >= WORK_STACK_MAX {
            return Err(Error::capture(ErrorKind::BufferOverflow, self.cbbs[id].addr, "work stack overflow"));
        }
        self.work.push(id);
        Ok(())
    }

    /// Appends a captured instruction to the block being traced.
    pub(crate) fn capture(&mut self, instr: Instr) -> Result<()> {
        let id = self.current.expect("[Rewriter::capture] no block is being traced");
        if self.cbbs[id].instrs.len() >= CBB_CAPTURE_MAX {
            return Err(Error::capture(ErrorKind::BufferOverflow, instr.addr, "captured block overflow"));
        }
        log::trace!("capture: {instr}");
        self.cbbs[id].instrs.push(instr);
        Ok(())
    }

    /// Ends the current block with a `ret`.
    pub(crate) fn finish_cbb_ret(&mut self) {
        let id = self.current.expect("[Rewriter::finish_cbb_ret] no block is being traced");
        self.cbbs[id].end_kind = Some(InstrKind::Ret);
    }

    /// Ends the current block at a conditional jump whose flags are
    /// dynamic: saves the state, queues both successors (not-taken first,
    /// so the observed direction is processed first) and records the
    /// observed direction as the layout preference.
    pub(crate) fn finish_cbb_jcc(&mut self, kind: InstrKind, target: u64, fall: u64, taken: bool) -> Result<()> {
        let es = self.save_state()?;
        let branch = self.get_or_create_cbb(target, es)?;
        let fallthrough = self.get_or_create_cbb(fall, es)?;

        let id = self.current.expect("[Rewriter::finish_cbb_jcc] no block is being traced");
        let cbb = &mut self.cbbs[id];
        cbb.end_kind = Some(kind);
        cbb.next_branch = Some(branch);
        cbb.next_fallthrough = Some(fallthrough);
        cbb.prefer_branch = taken;

        let (first, second) = if taken { (fallthrough, branch) } else { (branch, fallthrough) };
        self.push_work(first)?;
        self.push_work(second)?;
        Ok(())
    }

    /// Optimization pass hook.
    ///
    /// The only supplied pass is a copy pass: it rebuilds the instruction
    /// list unchanged and exists as the seam where real passes would go.
    fn opt_pass(&mut self, id: CbbId) {
        let mut copied = Vec::with_capacity(self.cbbs[id].instrs.len());
        for instr in &self.cbbs[id].instrs {
            copied.push(*instr);
        }
        self.cbbs[id].instrs = copied;
    }

    /// Computes the emission order: depth-first from the entry block,
    /// following the observed branch direction first.
    fn compute_gen_order(&mut self, entry: CbbId) -> Result<()> {
        let mut stack = vec![entry];
        let mut seen = vec![false; self.cbbs.len()];

        while let Some(id) = stack.pop() {
            if seen[id] {
                continue;
            }
            seen[id] = true;
            if self.gen_order.len() >= GEN_ORDER_MAX {
                return Err(Error::generate(ErrorKind::BufferOverflow, self.cbbs[id].addr, "generation order overflow"));
            }
            self.gen_order.push(id);

            let cbb = &self.cbbs[id];
            let (first, second) = if cbb.prefer_branch {
                (cbb.next_branch, cbb.next_fallthrough)
            } else {
                (cbb.next_fallthrough, cbb.next_branch)
            };
            // Pushed in reverse so `first` is visited first.
            if let Some(s) = second {
                stack.push(s);
            }
            if let Some(f) = first {
                stack.push(f);
            }
        }
        Ok(())
    }

    /// Encodes the blocks in layout order and links them: five passes of
    /// body encoding, preliminary layout, short/long jump selection, final
    /// placement and tail patching.
    fn generate(&mut self) -> Result<u64> {
        // Pass 1: encode the body of every block.
        for k in 0..self.gen_order.len() {
            let id = self.gen_order[k];
            let mut body = Vec::new();
            for instr in &self.cbbs[id].instrs {
                body.extend(encode_instr(instr)?);
            }
            self.cbbs[id].body = body;
        }

        // Pass 2: preliminary offsets, assuming worst-case (near) jumps.
        let mut off = 0usize;
        for k in 0..self.gen_order.len() {
            let id = self.gen_order[k];
            self.cbbs[id].layout_off = off;
            off += self.cbbs[id].body.len() + self.tail_size(k, false);
        }

        // Pass 3: choose short encodings where the preliminary distance
        // fits; the window is conservative against later shrinkage.
        for k in 0..self.gen_order.len() {
            let id = self.gen_order[k];
            if let Some(branch) = self.cbbs[id].next_branch {
                let tail = self.cbbs[id].layout_off + self.cbbs[id].body.len();
                let dist = self.cbbs[branch].layout_off as i64 - (tail + 2) as i64;
                self.cbbs[id].short_jcc = (SHORT_JUMP_MIN..=SHORT_JUMP_MAX).contains(&dist);
            }
        }

        // Pass 4: final placement and body copy.
        let mut off = 0usize;
        for k in 0..self.gen_order.len() {
            let id = self.gen_order[k];
            self.cbbs[id].layout_off = off;
            off += self.cbbs[id].body.len() + self.tail_size(k, true);
        }
        let base = self.code.reserve(off)?;
        self.generated_size = off;
        for k in 0..self.gen_order.len() {
            let id = self.gen_order[k];
            self.cbbs[id].addr_final = base + self.cbbs[id].layout_off as u64;
            let body = std::mem::take(&mut self.cbbs[id].body);
            self.code.write(self.cbbs[id].addr_final, &body);
            self.cbbs[id].body = body;
        }

        // Pass 5: patch the jump tails.
        for k in 0..self.gen_order.len() {
            let id = self.gen_order[k];
            let cbb = &self.cbbs[id];
            let Some(end) = cbb.end_kind else { continue };
            if !end.is_jcc() {
                continue;
            }
            let branch = cbb.next_branch.expect("[Rewriter::generate] Jcc block without branch target");
            let fall = cbb.next_fallthrough.expect("[Rewriter::generate] Jcc block without fall-through");
            let mut at = cbb.addr_final + cbb.body.len() as u64;

            let target = self.cbbs[branch].addr_final;
            if cbb.short_jcc {
                let rel = target as i64 - (at + 2) as i64;
                self.code.write(at, &encode_jcc_short(end.cc(), rel as i8));
                at += 2;
            } else {
                let rel = target as i64 - (at + 6) as i64;
                self.code.write(at, &encode_jcc_near(end.cc(), rel as i32));
                at += 6;
            }

            if !self.is_next_in_layout(k, fall) {
                let target = self.cbbs[fall].addr_final;
                let rel = target as i64 - (at + 5) as i64;
                self.code.write(at, &encode_jmp(rel as i32));
            }
        }

        Ok(self.cbbs[self.gen_order[0]].addr_final)
    }

    /// Tail bytes reserved after the body of `gen_order[k]`.
    fn tail_size(&self, k: usize, use_short: bool) -> usize {
        let id = self.gen_order[k];
        let cbb = &self.cbbs[id];
        let Some(end) = cbb.end_kind else { return 0 };
        if !end.is_jcc() {
            return 0;
        }
        let jcc = if use_short && cbb.short_jcc { 2 } else { 6 };
        let jmp = match cbb.next_fallthrough {
            Some(fall) if self.is_next_in_layout(k, fall) => 0,
            _ => 5,
        };
        jcc + jmp
    }

    fn is_next_in_layout(&self, k: usize, id: CbbId) -> bool {
        self.gen_order.get(k + 1) == Some(&id)
    }
}
