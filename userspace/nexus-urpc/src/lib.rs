// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory polling RPC ("URPC") for cross-core traffic
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/urpc_duplex.rs
//!
//! PUBLIC API:
//!   - UrpcBuffer: single-slot mailbox `{status, data_len, opcode, data}` in a frame
//!   - UrpcChannel: one frame split into two mailboxes (full duplex) plus a handler table
//!   - UrpcClient / UrpcServer: the two halves of a channel; the server runs on its own thread
//!   - proto: PRINT / SPAWN typed calls and their init-backed handlers
//!
//! INVARIANTS:
//!   - Mailbox status cycles NoData -> ClientSent -> ServerReplied{,Error} -> NoData
//!   - Payload writes happen before the status store (release fence); status loads are
//!     followed by an acquire fence before the payload is read
//!   - A request received by the server is always answered (data, error, or zero-length)
//!
//! ERROR CONDITIONS:
//!   - UrpcError::WrongStatus / UnknownStatus: protocol violation, fatal for the channel
//!   - UrpcError::BufferTooSmall: payload or answer exceeds the mailbox, recoverable
//!   - UrpcError::Remote: the server answered with an error code
//!   - UrpcError::Timeout: a bounded poll expired

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::time::Duration;

use nexus_abi::AbiError;
use nexus_marshal::MarshalError;
use nexus_rpc::{ErrorCode, RpcError};

pub mod channel;
pub mod mailbox;
pub mod proto;

pub use channel::{UrpcChannel, UrpcClient, UrpcHandler, UrpcServer, UrpcServerHandle};
pub use mailbox::{Message, Role, Status, UrpcBuffer, HEADER_BYTES};

/// Result type returned by URPC operations.
pub type Result<T> = core::result::Result<T, UrpcError>;

/// Errors produced by the URPC transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UrpcError {
    /// The mailbox was not in the state the operation requires.
    #[error("mailbox status is {found:?}, expected {expected:?}")]
    WrongStatus {
        /// Status the operation requires.
        expected: Status,
        /// Status found.
        found: Status,
    },
    /// The status word holds a value outside the protocol.
    #[error("mailbox status word {0} is undefined")]
    UnknownStatus(u32),
    /// Payload does not fit the mailbox.
    #[error("payload of {len} bytes exceeds the {capacity}-byte mailbox")]
    BufferTooSmall {
        /// Bytes required.
        len: usize,
        /// Mailbox capacity.
        capacity: usize,
    },
    /// Operation belongs to the other side of the mailbox.
    #[error("operation not allowed for the {0:?} role")]
    WrongRole(Role),
    /// A bounded poll expired.
    #[error("timed out polling the mailbox")]
    Timeout,
    /// The server answered with an error code.
    #[error("server reported {0:?}")]
    Remote(ErrorCode),
    /// Opcode outside the handler table or reserved.
    #[error("opcode {0} is outside the handler table")]
    InvalidOpcode(u32),
    /// Mailbox contents or layout did not match the protocol.
    #[error("malformed mailbox: {0}")]
    Malformed(&'static str),
    /// The server thread could not be started.
    #[error("server thread: {0}")]
    Thread(String),
    /// Frame access failed.
    #[error("kernel: {0}")]
    Abi(#[from] AbiError),
    /// Capability channel or mapping failure.
    #[error("rpc: {0}")]
    Rpc(RpcError),
    /// Payload could not be decoded.
    #[error("marshal: {0}")]
    Marshal(#[from] MarshalError),
}

impl From<RpcError> for UrpcError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout => Self::Timeout,
            other => Self::Rpc(other),
        }
    }
}

impl UrpcError {
    /// Returns true for protocol violations after which the mailbox cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WrongStatus { .. } | Self::UnknownStatus(_))
    }

    /// Code written into the error slot when a handler fails with this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Remote(code) => *code,
            Self::Rpc(err) => err.code(),
            Self::BufferTooSmall { .. } => ErrorCode::PayloadTooLarge,
            Self::InvalidOpcode(_) => ErrorCode::UnknownOpcode,
            Self::Malformed(_) | Self::Marshal(_) => ErrorCode::Malformed,
            _ => ErrorCode::Internal,
        }
    }
}

/// Channel tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UrpcConfig {
    /// Bytes per mailbox (header included); a channel frame holds two.
    pub mailbox_size: usize,
    /// Budget for one poll (reply on the client side, request on the server side).
    pub reply_budget: Duration,
    /// Size of the opcode -> handler table.
    pub handler_slots: usize,
}

impl UrpcConfig {
    /// Defaults: 4 KiB mailboxes, 5 s poll budget, 16 handler slots.
    pub const fn new() -> Self {
        Self { mailbox_size: 4096, reply_budget: Duration::from_secs(5), handler_slots: 16 }
    }

    /// Overrides the mailbox size.
    pub const fn with_mailbox_size(mut self, size: usize) -> Self {
        self.mailbox_size = size;
        self
    }

    /// Overrides the poll budget.
    pub const fn with_reply_budget(mut self, budget: Duration) -> Self {
        self.reply_budget = budget;
        self
    }

    /// Overrides the handler table size.
    pub const fn with_handler_slots(mut self, slots: usize) -> Self {
        self.handler_slots = slots;
        self
    }
}

impl Default for UrpcConfig {
    fn default() -> Self {
        Self::new()
    }
}
