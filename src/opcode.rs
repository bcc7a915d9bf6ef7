// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DSA operation codes.
//!
//! Values match the Intel DSA Architecture Specification and the Linux
//! kernel's `include/uapi/linux/idxd.h`.

/// Opcodes the engine submits or recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DsaOpcode {
    /// No operation.
    Noop = 0x00,

    /// Drain - wait for all previous operations to complete.
    Drain = 0x03,

    /// Memory move (copy) operation.
    MemMove = 0x04,

    /// Memory fill operation.
    MemFill = 0x05,

    /// Memory compare operation.
    Compare = 0x06,
}

impl DsaOpcode {
    /// Returns the opcode as a u8 value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Noop => "NOOP",
            Self::Drain => "DRAIN",
            Self::MemMove => "MEMMOVE",
            Self::MemFill => "MEMFILL",
            Self::Compare => "COMPARE",
        }
    }
}

impl std::fmt::Display for DsaOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}
