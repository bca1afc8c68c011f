// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Virtual address-space management for user domains
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + property tests (block allocator)
//!
//! PUBLIC API:
//!   - BlockAllocator: first-fit block list with split/merge/coalesce over one window
//!   - PagingState: block allocator + two-level page tables + demand-fault handler
//!   - PagingConfig: window, metadata pool sizing and safety margin
//!
//! INVARIANTS:
//!   - Blocks are sorted, contiguous, non-overlapping and sum to the window
//!   - No two adjacent blocks are Free after any operation returns
//!   - The metadata pool holds at least `margin` free nodes before an allocating call mutates
//!   - Block mutation and fault handling are serialized per address space

use nexus_abi::AbiError;

pub mod block;
pub mod page_table;
pub mod paging;
pub mod pool;

#[cfg(test)]
mod tests_prop;

pub use block::{BlockAllocator, BlockState, VRange, VmBlock};
pub use page_table::{MapFlags, PageTables, Pte, L2_ENTRIES, LARGE_PAGE_SIZE};
pub use paging::{FaultOutcome, PagingState};
pub use pool::NodePool;

pub use nexus_abi::BASE_PAGE_SIZE;

/// Free metadata nodes required before any allocating call.
///
/// One request can need a split plus the fault handler's own bookkeeping.
pub const METADATA_MARGIN: usize = 20;

/// Result alias for VM operations.
pub type Result<T> = core::result::Result<T, VmError>;

/// Errors produced by the block allocator and the paging layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No Free block is large enough.
    #[error("out of virtual memory (requested {requested:#x} bytes)")]
    OutOfVirtualMemory {
        /// Page-rounded request.
        requested: usize,
    },
    /// The fixed range is not entirely Free.
    #[error("address range at {addr:#x} is in use")]
    AddressInUse {
        /// Requested start.
        addr: usize,
    },
    /// The range leaves the managed window.
    #[error("range [{addr:#x}, +{size:#x}) outside the managed window")]
    OutOfRange {
        /// Requested start.
        addr: usize,
        /// Requested size.
        size: usize,
    },
    /// No allocated block starts at the address.
    #[error("no allocated block at {addr:#x}")]
    NotAllocated {
        /// Offending address.
        addr: usize,
    },
    /// A block had an unexpected state for the requested transition.
    #[error("block at {addr:#x} is {found:?}, expected {expected:?}")]
    WrongState {
        /// Start of the offending block.
        addr: usize,
        /// State required by the transition.
        expected: BlockState,
        /// State found.
        found: BlockState,
    },
    /// Caller arguments were invalid.
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),
    /// The metadata node pool ran dry.
    #[error("block metadata pool exhausted")]
    MetadataExhausted,
    /// A page-table entry already exists.
    #[error("page {addr:#x} already mapped")]
    AlreadyMapped {
        /// Page address.
        addr: usize,
    },
    /// No mapping/region starts at the address.
    #[error("nothing mapped at {addr:#x}")]
    NotMapped {
        /// Offending address.
        addr: usize,
    },
    /// Access to an address outside any allocated block.
    #[error("segmentation fault at {addr:#x}")]
    Segmentation {
        /// Faulting address.
        addr: usize,
    },
    /// The address space was halted by an earlier fatal fault.
    #[error("address space halted after a fatal fault")]
    Halted,
    /// An internal invariant does not hold.
    #[error("block structure corrupted: {0}")]
    Corrupted(&'static str),
    /// Kernel operation failed.
    #[error("kernel: {0}")]
    Abi(#[from] AbiError),
}

impl VmError {
    /// Returns true for errors that terminate the faulting domain.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MetadataExhausted | Self::Segmentation { .. } | Self::Halted | Self::Corrupted(_)
        )
    }
}

/// Layout of one address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagingConfig {
    /// First managed virtual address (page aligned).
    pub base: usize,
    /// Size of the managed window (page aligned).
    pub size: usize,
    /// Metadata nodes added per pool refill.
    pub pool_chunk: usize,
    /// Upper bound of metadata nodes.
    pub pool_max: usize,
    /// Free nodes required before an allocating call.
    pub margin: usize,
}

impl PagingConfig {
    /// Default window: 1 GiB starting at 1 GiB.
    pub const fn new() -> Self {
        Self {
            base: 0x4000_0000,
            size: 0x4000_0000,
            pool_chunk: 64,
            pool_max: 1 << 16,
            margin: METADATA_MARGIN,
        }
    }

    /// Overrides the managed window.
    pub const fn with_window(mut self, base: usize, size: usize) -> Self {
        self.base = base;
        self.size = size;
        self
    }

    /// Overrides the metadata pool sizing.
    pub const fn with_pool(mut self, chunk: usize, max: usize) -> Self {
        self.pool_chunk = chunk;
        self.pool_max = max;
        self
    }

    /// Overrides the safety margin.
    pub const fn with_margin(mut self, margin: usize) -> Self {
        self.margin = margin;
        self
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Rounds `size` up to the base page size.
pub const fn page_round_up(size: usize) -> usize {
    (size + BASE_PAGE_SIZE - 1) & !(BASE_PAGE_SIZE - 1)
}

/// Returns true if `addr` is base-page aligned.
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (BASE_PAGE_SIZE - 1) == 0
}
