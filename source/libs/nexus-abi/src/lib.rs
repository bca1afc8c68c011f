// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Kernel-facing contracts consumed by the messaging substrate, plus their host model
//! OWNERS: @runtime
//! PUBLIC API: MsgHeader/MsgFlags, Capability, Frame/FrameMemory, LmpChannel, WaitSet,
//!             MemoryServices/HostKernel, NameService/HostNameService
//! DEPENDS_ON: bitflags, parking_lot, thiserror, log
//! INVARIANTS: Header is one machine word (`opcode | flags << 8`); LMP messages carry at most
//!             9 words and one capability; every inbound capability consumes one armed slot
//!
//! The kernel primitives (endpoints, frames, RAM, the name registry) are modelled in memory so
//! the RPC and URPC layers above can be exercised host-first without a kernel.

pub mod cap;
pub mod frame;
pub mod header;
pub mod kernel;
pub mod lmp;
pub mod names;
pub mod waitset;

pub use cap::{CapId, CapKind, Capability, DeviceCap, RamCap, SpecialCapKind};
pub use frame::{Frame, FrameIdentity, FrameMemory};
pub use header::{MsgFlags, MsgHeader, OPCODE_BITS, OPCODE_MASK};
pub use kernel::{HostKernel, MemoryServices};
pub use lmp::{EndpointCap, LmpChannel, LmpError, LmpMessage, DEFAULT_ENDPOINT_DEPTH, LMP_MSG_WORDS};
pub use names::{HostNameService, NameService};
pub use waitset::{Event, WaitSet};

/// Size of a base page in bytes.
pub const BASE_PAGE_SIZE: usize = 4096;

/// Result type returned by ABI helpers.
pub type Result<T> = core::result::Result<T, AbiError>;

/// Errors surfaced by the kernel-facing contracts.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    /// No physical memory is left to satisfy the request.
    #[error("out of physical memory (requested {requested} bytes)")]
    OutOfMemory {
        /// Bytes requested by the caller.
        requested: usize,
    },
    /// Capability was destroyed or never issued by this kernel.
    #[error("invalid or destroyed capability {0}")]
    InvalidCap(CapId),
    /// Capability has the wrong kind for the requested operation.
    #[error("capability {id} has kind {found:?}, expected {expected:?}")]
    WrongCapKind {
        /// Offending capability.
        id: CapId,
        /// Kind required by the operation.
        expected: CapKind,
        /// Kind actually held.
        found: CapKind,
    },
    /// Arguments were rejected (zero size, non power-of-two alignment, ...).
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),
    /// Access outside the bounds of a frame.
    #[error("access [{offset:#x}, +{len:#x}) outside frame of {size:#x} bytes")]
    OutOfBounds {
        /// First byte accessed.
        offset: usize,
        /// Number of bytes accessed.
        len: usize,
        /// Size of the frame.
        size: usize,
    },
    /// Word access was not naturally aligned.
    #[error("misaligned word access at offset {0:#x}")]
    Misaligned(usize),
    /// Header word carried flag bits outside the defined set.
    #[error("malformed message header word {0:#x}")]
    MalformedHeader(usize),
    /// Name is already bound in the registry.
    #[error("name '{0}' already registered")]
    NameTaken(String),
    /// Name is not bound in the registry.
    #[error("name '{0}' not found")]
    NameNotFound(String),
}
