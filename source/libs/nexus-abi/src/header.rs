// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One-word message header shared by every LMP message.

use bitflags::bitflags;

use crate::{AbiError, Result};

/// Number of header bits holding the opcode.
pub const OPCODE_BITS: u32 = 8;
/// Mask selecting the opcode from a header word.
pub const OPCODE_MASK: usize = (1 << OPCODE_BITS) - 1;

bitflags! {
    /// Transport flags stored above the opcode.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MsgFlags: usize {
        /// Message acknowledges the previous request.
        const ACK = 1 << 0;
        /// More chunks of the same request follow.
        const INCOMPLETE = 1 << 1;
        /// Request failed; word 1 carries the error code.
        const ERROR = 1 << 2;
    }
}

/// Decoded header word: `opcode | flags << 8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    /// Operation selector; 0 is reserved as "null".
    pub opcode: u8,
    /// Transport flags.
    pub flags: MsgFlags,
}

impl MsgHeader {
    /// Creates a header from its parts.
    pub const fn new(opcode: u8, flags: MsgFlags) -> Self {
        Self { opcode, flags }
    }

    /// Header for a plain request.
    pub const fn request(opcode: u8) -> Self {
        Self::new(opcode, MsgFlags::empty())
    }

    /// Header acknowledging `opcode`.
    pub const fn ack(opcode: u8) -> Self {
        Self::new(opcode, MsgFlags::ACK)
    }

    /// Header reporting a failed `opcode`.
    pub const fn error(opcode: u8) -> Self {
        Self::new(opcode, MsgFlags::ERROR.union(MsgFlags::ACK))
    }

    /// Encodes the header into a machine word.
    pub const fn to_word(self) -> usize {
        self.opcode as usize | (self.flags.bits() << OPCODE_BITS)
    }

    /// Decodes a header word, rejecting undefined flag bits.
    pub fn from_word(word: usize) -> Result<Self> {
        let opcode = (word & OPCODE_MASK) as u8;
        let flags =
            MsgFlags::from_bits(word >> OPCODE_BITS).ok_or(AbiError::MalformedHeader(word))?;
        Ok(Self { opcode, flags })
    }

    /// Returns true if the ACK flag is set.
    pub const fn is_ack(&self) -> bool {
        self.flags.contains(MsgFlags::ACK)
    }

    /// Returns true if the ERROR flag is set.
    pub const fn is_error(&self) -> bool {
        self.flags.contains(MsgFlags::ERROR)
    }

    /// Returns true if further chunks follow.
    pub const fn is_incomplete(&self) -> bool {
        self.flags.contains(MsgFlags::INCOMPLETE)
    }
}
