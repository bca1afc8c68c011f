// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page tables of one address space.
//!
//! The first level is sparse: a second-level table covering [`LARGE_PAGE_SIZE`] bytes is created
//! the first time a page inside its window is mapped and stays cached for the lifetime of the
//! address space.

use std::collections::BTreeMap;

use bitflags::bitflags;
use log::trace;
use nexus_abi::Frame;

use crate::{is_page_aligned, Result, VmError, BASE_PAGE_SIZE};

/// Entries per second-level table.
pub const L2_ENTRIES: usize = 256;
/// Bytes covered by one second-level table.
pub const LARGE_PAGE_SIZE: usize = L2_ENTRIES * BASE_PAGE_SIZE;

bitflags! {
    /// Access rights of a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
        /// Uncached (device memory).
        const NOCACHE = 1 << 3;
        /// Read + write.
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// One page-table entry.
#[derive(Clone, Debug)]
pub struct Pte {
    /// Backing frame.
    pub frame: Frame,
    /// Byte offset of this page inside `frame`.
    pub offset: usize,
    /// Access rights.
    pub flags: MapFlags,
    /// True if the frame was allocated by the fault handler and is released on unmap.
    pub owned: bool,
}

struct L2Table {
    entries: Vec<Option<Pte>>,
}

impl L2Table {
    fn new() -> Self {
        Self { entries: (0..L2_ENTRIES).map(|_| None).collect() }
    }
}

/// Sparse first level plus lazily created second-level tables.
#[derive(Default)]
pub struct PageTables {
    l1: BTreeMap<usize, L2Table>,
    l2_created: usize,
    mapped: usize,
}

fn slot_of(vaddr: usize) -> (usize, usize) {
    (vaddr / LARGE_PAGE_SIZE, (vaddr / BASE_PAGE_SIZE) % L2_ENTRIES)
}

impl PageTables {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `pte` for the page at `vaddr`.
    pub fn map_page(&mut self, vaddr: usize, pte: Pte) -> Result<()> {
        if !is_page_aligned(vaddr) {
            return Err(VmError::InvalidArgs("page address is not aligned"));
        }
        let (l1, l2) = slot_of(vaddr);
        let created = &mut self.l2_created;
        let table = self.l1.entry(l1).or_insert_with(|| {
            *created += 1;
            trace!("vm: second-level table for slot {:#x}", l1);
            L2Table::new()
        });
        let entry = &mut table.entries[l2];
        if entry.is_some() {
            return Err(VmError::AlreadyMapped { addr: vaddr });
        }
        *entry = Some(pte);
        self.mapped += 1;
        Ok(())
    }

    /// Removes the entry for the page at `vaddr`; the second-level table stays cached.
    pub fn unmap_page(&mut self, vaddr: usize) -> Option<Pte> {
        let (l1, l2) = slot_of(vaddr);
        let pte = self.l1.get_mut(&l1)?.entries[l2].take()?;
        self.mapped -= 1;
        Some(pte)
    }

    /// Entry mapping the page that contains `vaddr`.
    pub fn lookup(&self, vaddr: usize) -> Option<&Pte> {
        let (l1, l2) = slot_of(vaddr);
        self.l1.get(&l1)?.entries[l2].as_ref()
    }

    /// Resolves `vaddr` to its frame and the byte offset inside that frame.
    pub fn translate(&self, vaddr: usize) -> Option<(&Frame, usize)> {
        let pte = self.lookup(vaddr)?;
        Some((&pte.frame, pte.offset + vaddr % BASE_PAGE_SIZE))
    }

    /// Second-level tables created so far.
    pub fn l2_tables_created(&self) -> usize {
        self.l2_created
    }

    /// Pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }
}
