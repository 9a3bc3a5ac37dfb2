// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! x86-64 dynamic binary rewriting and runtime partial evaluation.
//!
//! Given the address of a compiled function and a specialization
//! configuration naming which parameters are fixed, a [Rewriter] produces
//! a new executable function with the same calling convention in which
//! everything derivable from the fixed parameters has been folded away:
//! a symbolic emulator traces the function along every reachable path,
//! classifies each register, flag and stack byte as known or unknown at
//! rewrite time, captures only the unknown operations, and re-emits them
//! as machine code.
//!
//! # How to use
//!
//! Configure a rewriter with the function address and the static
//! parameters, then call [rewrite](Rewriter::rewrite) with the argument
//! values to specialize for:
//!
//! ```ignore
//! let mut rw = dbrew::Rewriter::new()?;
//! rw.set_function(apply as usize as u64);
//! rw.set_par_count(3);
//! rw.set_par_static(2); // the coefficient table is fixed
//! let addr = rw.rewrite(&[0, 0, coeffs.as_ptr() as u64])?;
//! let fast: extern "C" fn(i64, *const f64, *const f64) -> f64 =
//!     unsafe { std::mem::transmute(addr) };
//! ```
//!
//! The generated function is valid for the lifetime of the rewriter and
//! returns the same results as the original whenever the static
//! parameters are passed the values used during rewriting.
//!
//! # Limits
//!
//! Tracing executes the target function's loads for real, so the function
//! must be safely executable with the given arguments. At most
//! [MAX_PARAMETERS] integer parameters are modeled; floating-point
//! parameters pass through untouched. A rewriter is single-threaded and
//! not reentrant, but the generated code may be called from any number of
//! threads.

pub mod code_storage;
pub mod decoder;
mod emulator;
pub mod encoder;
mod engine;
pub mod error;
pub mod instruction;
pub mod operand;
pub mod register;
pub mod state;
pub mod utils;

use std::collections::BTreeMap;

use code_storage::CodeStorage;
pub use error::{Error, ErrorKind, ErrorModule, Result};
use engine::{Cbb, CbbId};
use instruction::DecodedBasicBlock;
pub use operand::{Operand, Width};
pub use register::{Reg, RegClass};
use state::EmuState;
pub use state::CaptureState;

/// Number of integer parameters the rewriter models, per the System V ABI
/// register assignment.
pub const MAX_PARAMETERS: usize = 5;

/// Maximum depth of inlined calls.
pub const CALL_DEPTH_MAX: usize = 5;

/// Default size of the virtual stack a trace runs on.
pub const DEFAULT_STACK_SIZE: usize = 512;

/// Specialization configuration of the function being rewritten.
#[derive(Clone, Debug)]
pub struct FunctionConfig {
    /// Entry address of the function to rewrite.
    pub func: u64,
    /// Size of the function in bytes, when known. Zero means unknown.
    pub size: usize,
    /// Optional name used in diagnostics.
    pub name: Option<String>,
    /// Number of integer parameters.
    pub par_count: usize,
    /// Initial meta-state per parameter.
    pub par_state: [CaptureState; MAX_PARAMETERS],
    /// The function returns its result in XMM0 rather than RAX.
    pub return_fp: bool,
    /// Trust every conditional branch to resolve statically.
    pub branches_known: bool,
    /// Demote all results at the given call depth to dynamic.
    pub force_unknown: [bool; CALL_DEPTH_MAX + 1],
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            func: 0,
            size: 0,
            name: None,
            par_count: 0,
            par_state: [CaptureState::Dynamic; MAX_PARAMETERS],
            return_fp: false,
            branches_known: false,
            force_unknown: [false; CALL_DEPTH_MAX + 1],
        }
    }
}

/// The rewriter: owner of everything a rewrite allocates.
///
/// Holds the decoded-block cache, the captured-block arena, the emulator
/// state with its saved snapshots, the work stack and the executable
/// buffer. Dropping the rewriter frees the generated code.
pub struct Rewriter {
    pub(crate) config: FunctionConfig,
    pub(crate) state: EmuState,
    pub(crate) saved: Vec<EmuState>,
    pub(crate) dbb_cache: BTreeMap<u64, DecodedBasicBlock>,
    pub(crate) cbbs: Vec<Cbb>,
    pub(crate) cbb_index: BTreeMap<(u64, usize), CbbId>,
    pub(crate) work: Vec<CbbId>,
    pub(crate) gen_order: Vec<CbbId>,
    pub(crate) code: CodeStorage,
    /// Block currently being traced into.
    pub(crate) current: Option<CbbId>,
    pub(crate) entry: u64,
    pub(crate) generated_size: usize,
    pub(crate) last_error: Option<Error>,
}

impl Rewriter {
    /// Creates a rewriter with the default executable-buffer capacity.
    pub fn new() -> Result<Self> {
        Self::with_capacity(CodeStorage::DEFAULT_CAPACITY)
    }

    /// Creates a rewriter with room for `code_bytes` of generated code.
    pub fn with_capacity(code_bytes: usize) -> Result<Self> {
        Ok(Self {
            config: FunctionConfig::default(),
            state: EmuState::new(DEFAULT_STACK_SIZE),
            saved: Vec::new(),
            dbb_cache: BTreeMap::new(),
            cbbs: Vec::new(),
            cbb_index: BTreeMap::new(),
            work: Vec::new(),
            gen_order: Vec::new(),
            code: CodeStorage::new(code_bytes)?,
            current: None,
            entry: 0,
            generated_size: 0,
            last_error: None,
        })
    }

    /// Sets the function to rewrite.
    pub fn set_function(&mut self, addr: u64) {
        self.config.func = addr;
    }

    /// Sets the function to rewrite together with a diagnostic name.
    pub fn set_function_named(&mut self, addr: u64, name: &str) {
        self.config.func = addr;
        self.config.name = Some(name.to_string());
    }

    /// Resizes the virtual stack traces run on.
    pub fn set_stack_size(&mut self, bytes: usize) {
        self.state = EmuState::new(bytes);
    }

    /// Declares the number of integer parameters.
    ///
    /// At most [MAX_PARAMETERS] are supported; more would require
    /// modeling the caller stack.
    pub fn set_par_count(&mut self, n: usize) {
        assert!(n <= MAX_PARAMETERS, "[Rewriter::set_par_count] at most {MAX_PARAMETERS} parameters, got {n}");
        self.config.par_count = n;
    }

    /// Marks parameter `i` as fixed: its rewrite-time value is assumed to
    /// hold for every future call, including memory reached through it.
    pub fn set_par_static(&mut self, i: usize) {
        assert!(i < MAX_PARAMETERS, "[Rewriter::set_par_static] parameter index {i} out of range");
        self.config.par_state[i] = CaptureState::Static2;
    }

    /// Declares that the function returns a floating-point value, so no
    /// integer return-value materialization happens at `ret`.
    pub fn set_return_fp(&mut self) {
        self.config.return_fp = true;
    }

    /// Demotes every result computed at the given inline depth to
    /// dynamic. Breaks loop unrolling at that depth.
    pub fn set_force_unknown(&mut self, depth: usize) {
        assert!(depth <= CALL_DEPTH_MAX, "[Rewriter::set_force_unknown] depth {depth} out of range");
        self.config.force_unknown[depth] = true;
    }

    /// Trusts every conditional branch to resolve from the traced flag
    /// values, known or not.
    pub fn set_branches_known(&mut self, known: bool) {
        self.config.branches_known = known;
    }

    /// Entry address and size of the most recently generated code.
    pub fn generated_code(&self) -> (u64, usize) {
        (self.entry, self.generated_size)
    }

    /// The error that failed the last rewrite, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}

impl std::fmt::Debug for Rewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewriter")
            .field("config", &self.config)
            .field("entry", &self.entry)
            .field("generated_size", &self.generated_size)
            .field("cbbs", &self.cbbs.len())
            .finish()
    }
}

// The marker functions are recognized by address during tracing and
// re-interpreted as meta-state coercions; their bodies only need to be
// distinct so the linker cannot fold them into one symbol.

static DYNAMIC_TAG: u8 = 0;
static STATIC_TAG: u8 = 1;

/// Identity function that makes the traced value opaque: the rewriter
/// treats everything passed through it as unknown.
#[inline(never)]
pub extern "C" fn marker_dynamic(v: u64) -> u64 {
    unsafe { std::ptr::read_volatile(&DYNAMIC_TAG) };
    v
}

/// Identity function that asserts the traced value is a fixed constant,
/// including memory reachable through it.
#[inline(never)]
pub extern "C" fn marker_static(v: u64) -> u64 {
    unsafe { std::ptr::read_volatile(&STATIC_TAG) };
    v
}

pub(crate) fn marker_dynamic_addr() -> u64 {
    marker_dynamic as extern "C" fn(u64) -> u64 as usize as u64
}

pub(crate) fn marker_static_addr() -> u64 {
    marker_static as extern "C" fn(u64) -> u64 as usize as u64
}
