// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability RPC runtime on top of LMP channels
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/rpc_roundtrip.rs
//!
//! PUBLIC API:
//!   - RpcSession: client role; single-flight request/ack/response over one channel
//!   - RpcServer / ServerHandle: listening endpoint, per-client sessions, accept loop
//!   - HandlerRegistry / RpcHandler / Reply: opcode -> handler dispatch table
//!   - SharedBuffer: negotiated bulk-data frame, owned by exactly one session
//!   - InitBackend / HostInitBackend: reference handlers for the init services
//!   - RpcConfig: buffer size, wait budgets, endpoint depth
//!
//! ERROR CONDITIONS:
//!   - RpcError::Timeout: a bounded wait expired; the session stays busy
//!   - RpcError::Remote: the peer answered with the ERROR flag and a code
//!   - RpcError::MissingAck / UnexpectedOpcode: protocol violations in a reply
//!   - RpcError::NoSharedBuffer / PayloadTooLarge: bulk path unavailable or too small
//!
//! DEPENDENCIES:
//!   - nexus-abi: channels, wait set, capabilities, header word
//!   - nexus-vm: mappings backing the shared buffer
//!   - nexus-marshal: string and string-array payloads

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::time::Duration;

use nexus_abi::{AbiError, LmpError, DEFAULT_ENDPOINT_DEPTH};
use nexus_marshal::MarshalError;
use nexus_vm::VmError;

pub mod budget;
pub mod buffer;
pub mod client;
pub mod handler;
pub mod init;
pub mod opcode;
pub mod server;
pub mod session;

pub use budget::{Clock, HostClock};
pub use buffer::SharedBuffer;
pub use handler::{HandlerRegistry, Reply, Request, RpcHandler};
pub use init::{register_init_handlers, HostInitBackend, InitBackend};
pub use server::{RpcServer, ServerHandle};
pub use session::{Response, RpcSession};

/// Result type returned by RPC operations.
pub type Result<T> = core::result::Result<T, RpcError>;

/// Error code carried in word 1 of an ERROR reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ErrorCode {
    /// No handler is registered for the opcode.
    UnknownOpcode = 1,
    /// The request needs a shared buffer and none was negotiated.
    NoSharedBuffer = 2,
    /// The payload does not fit the shared buffer.
    PayloadTooLarge = 3,
    /// Request arguments were rejected.
    InvalidArgs = 4,
    /// The server ran out of memory.
    OutOfMemory = 5,
    /// No domain with the requested pid.
    DomainNotFound = 6,
    /// No service registered under the requested name.
    NameNotFound = 7,
    /// The name is already registered.
    NameTaken = 8,
    /// The request was malformed.
    Malformed = 9,
    /// Nothing to return (for example no input character pending).
    Unavailable = 10,
    /// Any other failure.
    Internal = 11,
}

impl ErrorCode {
    /// Wire value.
    pub const fn to_word(self) -> usize {
        self as usize
    }

    /// Decodes a wire value; unknown values map to [`ErrorCode::Internal`].
    pub fn from_word(word: usize) -> Self {
        match word {
            1 => Self::UnknownOpcode,
            2 => Self::NoSharedBuffer,
            3 => Self::PayloadTooLarge,
            4 => Self::InvalidArgs,
            5 => Self::OutOfMemory,
            6 => Self::DomainNotFound,
            7 => Self::NameNotFound,
            8 => Self::NameTaken,
            9 => Self::Malformed,
            10 => Self::Unavailable,
            _ => Self::Internal,
        }
    }
}

/// Errors produced by the RPC runtime.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Operation could not progress without waiting.
    #[error("operation would block")]
    WouldBlock,
    /// A bounded wait expired.
    #[error("timed out waiting for the peer")]
    Timeout,
    /// A previous request on this session is still outstanding.
    #[error("a request is already outstanding on this session")]
    Busy,
    /// Reply lacked the ACK flag.
    #[error("reply did not carry the ACK flag")]
    MissingAck,
    /// Reply carried an opcode other than the one the call expects.
    #[error("unexpected opcode {got} in reply (expected {expected})")]
    UnexpectedOpcode {
        /// Opcode required by the call.
        expected: u8,
        /// Opcode received.
        got: u8,
    },
    /// Peer answered with the ERROR flag.
    #[error("peer reported {0:?}")]
    Remote(ErrorCode),
    /// A handler rejected a request with the given code.
    #[error("request rejected: {0:?}")]
    Rejected(ErrorCode),
    /// No shared buffer was negotiated.
    #[error("no shared buffer negotiated")]
    NoSharedBuffer,
    /// Payload exceeds the shared buffer.
    #[error("payload of {len} bytes exceeds the {capacity}-byte shared buffer")]
    PayloadTooLarge {
        /// Payload size.
        len: usize,
        /// Buffer capacity.
        capacity: usize,
    },
    /// Message did not match the protocol.
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    /// Opcode 0 cannot be registered.
    #[error("opcode {0} is reserved")]
    ReservedOpcode(u8),
    /// No clock is available to compute a deadline.
    #[error("no clock available for a bounded wait")]
    Unsupported,
    /// The server thread could not be started.
    #[error("server thread: {0}")]
    Thread(String),
    /// Channel failure other than a transient condition.
    #[error("channel: {0}")]
    Channel(LmpError),
    /// Kernel operation failed.
    #[error("kernel: {0}")]
    Abi(#[from] AbiError),
    /// Mapping failed.
    #[error("vm: {0}")]
    Vm(#[from] VmError),
    /// Payload could not be decoded.
    #[error("marshal: {0}")]
    Marshal(#[from] MarshalError),
}

impl From<LmpError> for RpcError {
    fn from(err: LmpError) -> Self {
        match err {
            LmpError::Transient => Self::WouldBlock,
            other => Self::Channel(other),
        }
    }
}

impl RpcError {
    /// Code reported to the peer when a handler fails with this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Remote(code) | Self::Rejected(code) => *code,
            Self::NoSharedBuffer => ErrorCode::NoSharedBuffer,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::Malformed(_) | Self::Marshal(_) | Self::UnexpectedOpcode { .. } => {
                ErrorCode::Malformed
            }
            Self::Abi(AbiError::OutOfMemory { .. })
            | Self::Vm(VmError::OutOfVirtualMemory { .. }) => ErrorCode::OutOfMemory,
            Self::Abi(AbiError::InvalidArgs(_)) | Self::Vm(VmError::InvalidArgs(_)) => {
                ErrorCode::InvalidArgs
            }
            Self::Abi(AbiError::NameNotFound(_)) => ErrorCode::NameNotFound,
            Self::Abi(AbiError::NameTaken(_)) => ErrorCode::NameTaken,
            _ => ErrorCode::Internal,
        }
    }
}

/// Session and server tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcConfig {
    /// Shared buffer requested right after the handshake; 0 skips the request.
    pub shared_buffer_size: usize,
    /// Budget for the channel to become writable and accept the message.
    pub send_budget: Duration,
    /// Budget for the reply to arrive.
    pub reply_budget: Duration,
    /// Queue depth of endpoints created by the runtime.
    pub endpoint_depth: usize,
}

impl RpcConfig {
    /// Defaults: 4 KiB shared buffer, 1 s send budget, 5 s reply budget.
    pub const fn new() -> Self {
        Self {
            shared_buffer_size: 4096,
            send_budget: Duration::from_secs(1),
            reply_budget: Duration::from_secs(5),
            endpoint_depth: DEFAULT_ENDPOINT_DEPTH,
        }
    }

    /// Overrides the shared buffer size.
    pub const fn with_shared_buffer_size(mut self, size: usize) -> Self {
        self.shared_buffer_size = size;
        self
    }

    /// Overrides both wait budgets.
    pub const fn with_budgets(mut self, send: Duration, reply: Duration) -> Self {
        self.send_budget = send;
        self.reply_budget = reply;
        self
    }

    /// Overrides the endpoint queue depth.
    pub const fn with_endpoint_depth(mut self, depth: usize) -> Self {
        self.endpoint_depth = depth;
        self
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::new()
    }
}
