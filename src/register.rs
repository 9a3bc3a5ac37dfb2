// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register model of the x86-64 architecture.
//!
//! A register is a pair of a class and an encoding index. Classes share
//! encoding indices but represent different widths, so `Reg::RAX` and the
//! 32-bit `eax` are distinct registers with the same index.

use crate::operand::Width;

/// Register classes.
///
/// `Gp8Legacy` is the REX-less byte set (AH/CH/DH/BH at indices 4-7),
/// `Gp8` the uniform byte set addressable with a REX prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegClass {
    Gp8Legacy,
    Gp8,
    Gp16,
    Gp32,
    Gp64,
    Flag,
    Ip,
    Mmx,
    Xmm,
    Ymm,
    Zmm,
}

impl RegClass {
    /// Returns the operand width of a register of this class, if it maps to one.
    pub const fn width(self) -> Option<Width> {
        match self {
            Self::Gp8Legacy | Self::Gp8 => Some(Width::Byte),
            Self::Gp16 => Some(Width::Word),
            Self::Gp32 => Some(Width::Dword),
            Self::Gp64 | Self::Ip => Some(Width::Qword),
            _ => None,
        }
    }

    /// Returns the general-purpose class of the given width.
    pub const fn gp(width: Width) -> Self {
        match width {
            Width::Byte => Self::Gp8,
            Width::Word => Self::Gp16,
            Width::Dword => Self::Gp32,
            Width::Qword => Self::Gp64,
        }
    }
}

/// A machine register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reg {
    pub class: RegClass,
    pub index: u8,
}

/// Names of the 64-bit general-purpose registers, in encoding order.
const GP64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

const GP32_NAMES: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi",
    "r8d", "r9d", "r10d", "r11d", "r12d", "r13d", "r14d", "r15d",
];

const GP16_NAMES: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di",
    "r8w", "r9w", "r10w", "r11w", "r12w", "r13w", "r14w", "r15w",
];

const GP8_NAMES: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil",
    "r8b", "r9b", "r10b", "r11b", "r12b", "r13b", "r14b", "r15b",
];

const GP8_LEGACY_NAMES: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];

impl Reg {
    pub const RAX: Reg = Reg::gp64(0);
    pub const RCX: Reg = Reg::gp64(1);
    pub const RDX: Reg = Reg::gp64(2);
    pub const RBX: Reg = Reg::gp64(3);
    pub const RSP: Reg = Reg::gp64(4);
    pub const RBP: Reg = Reg::gp64(5);
    pub const RSI: Reg = Reg::gp64(6);
    pub const RDI: Reg = Reg::gp64(7);
    pub const R8: Reg = Reg::gp64(8);
    pub const R9: Reg = Reg::gp64(9);
    pub const R10: Reg = Reg::gp64(10);
    pub const R11: Reg = Reg::gp64(11);
    pub const R12: Reg = Reg::gp64(12);
    pub const R13: Reg = Reg::gp64(13);
    pub const R14: Reg = Reg::gp64(14);
    pub const R15: Reg = Reg::gp64(15);

    /// The instruction pointer, used as the base of RIP-relative operands.
    pub const RIP: Reg = Reg { class: RegClass::Ip, index: 0 };

    pub const XMM0: Reg = Reg::xmm(0);

    /// Creates a 64-bit general-purpose register from its encoding index.
    pub const fn gp64(index: u8) -> Self {
        Self { class: RegClass::Gp64, index }
    }

    /// Creates a general-purpose register of the given width from its encoding index.
    pub const fn gp(width: Width, index: u8) -> Self {
        Self { class: RegClass::gp(width), index }
    }

    /// Creates an XMM register from its encoding index.
    pub const fn xmm(index: u8) -> Self {
        Self { class: RegClass::Xmm, index }
    }

    /// Returns the width of the register.
    pub fn width(self) -> Width {
        self.class.width().unwrap_or(Width::Qword)
    }

    /// Returns true for any general-purpose class.
    pub const fn is_gp(self) -> bool {
        matches!(self.class, RegClass::Gp8Legacy | RegClass::Gp8 | RegClass::Gp16 | RegClass::Gp32 | RegClass::Gp64)
    }

    /// Returns true if this is the instruction pointer.
    pub const fn is_ip(self) -> bool {
        matches!(self.class, RegClass::Ip)
    }

    /// The low 3 bits of the encoding index, as placed in ModR/M and SIB fields.
    #[inline(always)]
    pub const fn low3(self) -> u8 {
        self.index & 7
    }

    /// The high bit of the encoding index, as placed in a REX prefix.
    #[inline(always)]
    pub const fn rex_bit(self) -> u8 {
        self.index >> 3 & 1
    }

    /// The same encoding index in another general-purpose class.
    pub const fn with_width(self, width: Width) -> Self {
        Self { class: RegClass::gp(width), index: self.index }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let i = self.index as usize;
        match self.class {
            RegClass::Gp64 => write!(f, "%{}", GP64_NAMES[i & 15]),
            RegClass::Gp32 => write!(f, "%{}", GP32_NAMES[i & 15]),
            RegClass::Gp16 => write!(f, "%{}", GP16_NAMES[i & 15]),
            RegClass::Gp8 => write!(f, "%{}", GP8_NAMES[i & 15]),
            RegClass::Gp8Legacy => write!(f, "%{}", GP8_LEGACY_NAMES[i & 7]),
            RegClass::Ip => write!(f, "%rip"),
            RegClass::Flag => write!(f, "%flags"),
            RegClass::Mmx => write!(f, "%mm{i}"),
            RegClass::Xmm => write!(f, "%xmm{i}"),
            RegClass::Ymm => write!(f, "%ymm{i}"),
            RegClass::Zmm => write!(f, "%zmm{i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_fields() {
        assert_eq!(Reg::RAX.low3(), 0);
        assert_eq!(Reg::RAX.rex_bit(), 0);
        assert_eq!(Reg::R8.low3(), 0);
        assert_eq!(Reg::R8.rex_bit(), 1);
        assert_eq!(Reg::R15.low3(), 7);
        assert_eq!(Reg::R15.rex_bit(), 1);
    }

    #[test]
    fn display_follows_class() {
        assert_eq!(Reg::RSP.to_string(), "%rsp");
        assert_eq!(Reg::R10.with_width(Width::Dword).to_string(), "%r10d");
        assert_eq!(Reg::RIP.to_string(), "%rip");
    }
}
