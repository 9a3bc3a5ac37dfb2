// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error model of the rewriter.
//!
//! Errors are categorized by the component that raised them and carry the
//! address of the offending block plus a byte offset into it, so a failed
//! rewrite can be diagnosed without re-tracing.

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The component an error originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorModule {
    Decoder,
    Emulator,
    Generator,
    Capture,
    Unknown,
}

impl std::fmt::Display for ErrorModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decoder => write!(f, "decoder"),
            Self::Emulator => write!(f, "emulator"),
            Self::Generator => write!(f, "generator"),
            Self::Capture => write!(f, "capture"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    BadPrefix,
    BadOpcode,
    BadOperands,
    UnsupportedInstr,
    UnsupportedOperands,
    BufferOverflow,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadPrefix => write!(f, "bad prefix"),
            Self::BadOpcode => write!(f, "bad opcode"),
            Self::BadOperands => write!(f, "bad operands"),
            Self::UnsupportedInstr => write!(f, "unsupported instruction"),
            Self::UnsupportedOperands => write!(f, "unsupported operands"),
            Self::BufferOverflow => write!(f, "buffer overflow"),
        }
    }
}

/// An error raised during a rewrite.
///
/// `addr` is the start of the decoded or captured block the error occured
/// in, `offset` the byte offset of the offending instruction within it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{module} error at {addr:#x}+{offset}: {kind} ({detail})")]
pub struct Error {
    pub module: ErrorModule,
    pub kind: ErrorKind,
    pub addr: u64,
    pub offset: usize,
    pub detail: String,
}

impl Error {
    pub fn new(module: ErrorModule, kind: ErrorKind, addr: u64, offset: usize, detail: impl Into<String>) -> Self {
        Self {
            module,
            kind,
            addr,
            offset,
            detail: detail.into(),
        }
    }

    /// Decoder error at the given block address and byte offset.
    pub fn decode(kind: ErrorKind, addr: u64, offset: usize, detail: impl Into<String>) -> Self {
        Self::new(ErrorModule::Decoder, kind, addr, offset, detail)
    }

    /// Emulator error at the given instruction address.
    pub fn emulate(kind: ErrorKind, addr: u64, detail: impl Into<String>) -> Self {
        Self::new(ErrorModule::Emulator, kind, addr, 0, detail)
    }

    /// Code generator error at the given instruction address.
    pub fn generate(kind: ErrorKind, addr: u64, detail: impl Into<String>) -> Self {
        Self::new(ErrorModule::Generator, kind, addr, 0, detail)
    }

    /// Capture engine error (work stack, saved states, generation order).
    pub fn capture(kind: ErrorKind, addr: u64, detail: impl Into<String>) -> Self {
        Self::new(ErrorModule::Capture, kind, addr, 0, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_module_and_location() {
        let e = Error::decode(ErrorKind::BadOpcode, 0x401000, 3, "opcode 0x0e");
        assert_eq!(e.to_string(), "decoder error at 0x401000+3: bad opcode (opcode 0x0e)");
    }
}
