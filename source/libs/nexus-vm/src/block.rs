// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ordered block list of one virtual address window
//! OWNERS: @runtime
//!
//! Blocks live in a [`NodePool`] arena and are doubly linked by index; a `BTreeMap` keyed by
//! start address finds the block containing an address. The head block always starts at the
//! window base and is never removed, because merges only ever absorb the following block.
//!
//! Allocation is first-fit in ascending address order. Every call that can split a block first
//! makes sure the pool holds `margin` free nodes, so the split and merge steps themselves never
//! have to grow the pool.

use std::collections::BTreeMap;

use log::{debug, trace};
use nexus_abi::CapId;

use crate::page_table::MapFlags;
use crate::pool::{NodeId, NodePool};
use crate::{is_page_aligned, PagingConfig, Result, VmError, BASE_PAGE_SIZE};

/// Lifecycle of a block: Free -> Allocated -> Paged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Not reserved.
    Free,
    /// Reserved but not backed.
    Allocated,
    /// Reserved and backed by mapped frames.
    Paged,
}

/// Half-open virtual range `[start, start + size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VRange {
    /// First address.
    pub start: usize,
    /// Length in bytes.
    pub size: usize,
}

impl VRange {
    /// Creates a range.
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// One past the last address.
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    /// Returns true if `addr` lies inside the range.
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// Snapshot of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmBlock {
    /// First address.
    pub start: usize,
    /// Length in bytes (page multiple).
    pub size: usize,
    /// Current state.
    pub state: BlockState,
    /// Frame backing a fixed mapping.
    pub mapping: Option<CapId>,
    /// Rights of the mapping.
    pub flags: Option<MapFlags>,
}

impl VmBlock {
    fn free(start: usize, size: usize) -> Self {
        Self { start, size, state: BlockState::Free, mapping: None, flags: None }
    }

    /// One past the last address.
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    /// Range covered by the block.
    pub const fn range(&self) -> VRange {
        VRange::new(self.start, self.size)
    }

    fn same_kind(&self, other: &VmBlock) -> bool {
        self.state == other.state && self.mapping == other.mapping && self.flags == other.flags
    }
}

#[derive(Debug)]
struct Node {
    block: VmBlock,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

fn round_pages(size: usize) -> Option<usize> {
    size.checked_add(BASE_PAGE_SIZE - 1).map(|s| s & !(BASE_PAGE_SIZE - 1))
}

/// First-fit allocator over one window.
#[derive(Debug)]
pub struct BlockAllocator {
    window: VRange,
    margin: usize,
    pool: NodePool<Node>,
    index: BTreeMap<usize, NodeId>,
    head: NodeId,
}

impl BlockAllocator {
    /// Creates an allocator whose window is a single Free block.
    pub fn new(config: &PagingConfig) -> Result<Self> {
        if config.size == 0 || !is_page_aligned(config.base) || !is_page_aligned(config.size) {
            return Err(VmError::InvalidArgs("window must be non-empty and page aligned"));
        }
        if config.base.checked_add(config.size).is_none() {
            return Err(VmError::InvalidArgs("window wraps the address space"));
        }
        let mut pool = NodePool::new(config.pool_chunk, config.pool_max)?;
        pool.ensure_margin(1)?;
        let head = pool.insert(Node {
            block: VmBlock::free(config.base, config.size),
            prev: None,
            next: None,
        })?;
        let mut index = BTreeMap::new();
        index.insert(config.base, head);
        Ok(Self {
            window: VRange::new(config.base, config.size),
            margin: config.margin,
            pool,
            index,
            head,
        })
    }

    /// Managed window.
    pub fn window(&self) -> VRange {
        self.window
    }

    /// Refills the metadata pool until the safety margin is free.
    pub fn ensure_margin(&mut self) -> Result<()> {
        self.pool.ensure_margin(self.margin)
    }

    /// Reserves `size` bytes (rounded up to pages) from the lowest Free block that fits.
    pub fn alloc(&mut self, size: usize) -> Result<VRange> {
        if size == 0 {
            return Err(VmError::InvalidArgs("zero-sized allocation"));
        }
        let size = round_pages(size).ok_or(VmError::OutOfVirtualMemory { requested: size })?;
        self.ensure_margin()?;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let (block, next) = {
                let node = self.node(id)?;
                (node.block, node.next)
            };
            if block.state == BlockState::Free && block.size >= size {
                if block.size > size {
                    self.split(id, size)?;
                }
                self.node_mut(id)?.block.state = BlockState::Allocated;
                debug!("vm: alloc [{:#x}, +{:#x})", block.start, size);
                return Ok(VRange::new(block.start, size));
            }
            cursor = next;
        }
        Err(VmError::OutOfVirtualMemory { requested: size })
    }

    /// Reserves exactly `[addr, addr + size)`; the range must lie inside one Free block.
    pub fn alloc_fixed(&mut self, addr: usize, size: usize) -> Result<VRange> {
        let range = self.checked_range(addr, size)?;
        let mut id = self.containing(addr)?;
        let block = self.block(id)?;
        if block.state != BlockState::Free || block.end() < range.end() {
            return Err(VmError::AddressInUse { addr });
        }
        self.ensure_margin()?;
        if block.start < addr {
            id = self.split(id, addr - block.start)?;
        }
        if self.block(id)?.size > range.size {
            self.split(id, range.size)?;
        }
        self.node_mut(id)?.block.state = BlockState::Allocated;
        debug!("vm: alloc_fixed [{:#x}, +{:#x})", addr, range.size);
        Ok(range)
    }

    /// Releases `range` and coalesces it with Free neighbours.
    ///
    /// A block that exactly matches `range` is released in place. Otherwise the reservation was
    /// split by fault handling, or folded into a neighbour of the same kind by
    /// [`BlockAllocator::mark_paged`] / [`BlockAllocator::mark_allocated`], and the range is cut
    /// back out first (see [`BlockAllocator::free_range`]).
    pub fn free(&mut self, range: VRange) -> Result<()> {
        let exact = match self.index.get(&range.start) {
            Some(&id) => {
                let block = self.block(id)?;
                if block.state == BlockState::Free {
                    return Err(VmError::NotAllocated { addr: range.start });
                }
                (round_pages(range.size) == Some(block.size)).then_some(id)
            }
            None => None,
        };
        match exact {
            Some(id) => self.release(id),
            None => self.free_range(range.start, range.size),
        }
    }

    /// Releases every block inside `[start, start + size)`; none of them may be Free.
    pub fn free_range(&mut self, start: usize, size: usize) -> Result<()> {
        let range = self.checked_range(start, size)?;
        for id in self.covering(range)? {
            let block = self.block(id)?;
            if block.state == BlockState::Free {
                return Err(VmError::NotAllocated { addr: block.start.max(range.start) });
            }
        }
        self.ensure_margin()?;
        let first = self.isolate(range)?;
        self.collapse(first, range.end())?;
        self.release(first)
    }

    /// Marks an Allocated range as backed.
    pub fn mark_paged(
        &mut self,
        range: VRange,
        mapping: Option<CapId>,
        flags: MapFlags,
    ) -> Result<()> {
        self.retype(range, BlockState::Allocated, BlockState::Paged, mapping, Some(flags))
    }

    /// Returns a Paged range to the reserved-but-unbacked state.
    pub fn mark_allocated(&mut self, range: VRange) -> Result<()> {
        self.retype(range, BlockState::Paged, BlockState::Allocated, None, None)
    }

    /// Block containing `addr`.
    pub fn find(&self, addr: usize) -> Option<VmBlock> {
        let (_, &id) = self.index.range(..=addr).next_back()?;
        let block = self.pool.get(id)?.block;
        block.range().contains(addr).then_some(block)
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = VmBlock> + '_ {
        let mut cursor = Some(self.head);
        core::iter::from_fn(move || {
            let node = self.pool.get(cursor?)?;
            cursor = node.next;
            Some(node.block)
        })
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Bytes held by Free blocks.
    pub fn free_bytes(&self) -> usize {
        self.blocks().filter(|b| b.state == BlockState::Free).map(|b| b.size).sum()
    }

    /// Free metadata nodes.
    pub fn spare_nodes(&self) -> usize {
        self.pool.free_count()
    }

    /// Verifies ordering, contiguity, coalescing and index consistency.
    pub fn check_invariants(&self) -> Result<()> {
        let mut expected = self.window.start;
        let mut prev: Option<VmBlock> = None;
        let mut count = 0;
        for block in self.blocks() {
            if block.start != expected {
                return Err(VmError::Corrupted("blocks are not contiguous"));
            }
            if block.size == 0 || !is_page_aligned(block.size) {
                return Err(VmError::Corrupted("block size is not a page multiple"));
            }
            if self.index.get(&block.start).is_none() {
                return Err(VmError::Corrupted("block missing from the address index"));
            }
            if let Some(prev) = prev {
                if prev.state == BlockState::Free && block.state == BlockState::Free {
                    return Err(VmError::Corrupted("adjacent free blocks"));
                }
            }
            expected = block.end();
            prev = Some(block);
            count += 1;
        }
        if expected != self.window.end() {
            return Err(VmError::Corrupted("blocks do not cover the window"));
        }
        if count != self.index.len() || count != self.pool.used() {
            return Err(VmError::Corrupted("block count disagrees with the index"));
        }
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.pool.get(id).ok_or(VmError::Corrupted("dangling block index"))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.pool.get_mut(id).ok_or(VmError::Corrupted("dangling block index"))
    }

    fn block(&self, id: NodeId) -> Result<VmBlock> {
        Ok(self.node(id)?.block)
    }

    fn containing(&self, addr: usize) -> Result<NodeId> {
        let (_, &id) = self
            .index
            .range(..=addr)
            .next_back()
            .ok_or(VmError::Corrupted("window not covered"))?;
        if self.block(id)?.range().contains(addr) {
            Ok(id)
        } else {
            Err(VmError::Corrupted("window not covered"))
        }
    }

    fn checked_range(&self, start: usize, size: usize) -> Result<VRange> {
        if size == 0 {
            return Err(VmError::InvalidArgs("zero-sized range"));
        }
        if !is_page_aligned(start) {
            return Err(VmError::InvalidArgs("range start is not page aligned"));
        }
        let out_of_range = VmError::OutOfRange { addr: start, size };
        let size = round_pages(size).ok_or(out_of_range.clone())?;
        let end = start.checked_add(size).ok_or(out_of_range.clone())?;
        if start < self.window.start || end > self.window.end() {
            return Err(out_of_range);
        }
        Ok(VRange::new(start, size))
    }

    /// Blocks overlapping `range`, in order.
    fn covering(&self, range: VRange) -> Result<Vec<NodeId>> {
        let mut ids = Vec::new();
        let mut cursor = Some(self.containing(range.start)?);
        while let Some(id) = cursor {
            let node = self.node(id)?;
            if node.block.start >= range.end() {
                break;
            }
            ids.push(id);
            cursor = node.next;
        }
        Ok(ids)
    }

    /// Splits `id` at `offset`; returns the new trailing node.
    fn split(&mut self, id: NodeId, offset: usize) -> Result<NodeId> {
        let (block, next) = {
            let node = self.node(id)?;
            (node.block, node.next)
        };
        if offset == 0 || offset >= block.size {
            return Err(VmError::Corrupted("split point outside the block"));
        }
        let tail_block =
            VmBlock { start: block.start + offset, size: block.size - offset, ..block };
        let tail = self.pool.insert(Node { block: tail_block, prev: Some(id), next })?;
        if let Some(next) = next {
            self.node_mut(next)?.prev = Some(tail);
        }
        let node = self.node_mut(id)?;
        node.block.size = offset;
        node.next = Some(tail);
        self.index.insert(tail_block.start, tail);
        trace!("vm: split {:#x} at {:#x}", block.start, tail_block.start);
        Ok(tail)
    }

    /// Merges the block following `id` into `id`.
    fn absorb_next(&mut self, id: NodeId) -> Result<()> {
        let next = self.node(id)?.next.ok_or(VmError::Corrupted("merge past the last block"))?;
        let removed = self.pool.remove(next).ok_or(VmError::Corrupted("dangling block index"))?;
        self.index.remove(&removed.block.start);
        if let Some(after) = removed.next {
            self.node_mut(after)?.prev = Some(id);
        }
        let node = self.node_mut(id)?;
        node.block.size += removed.block.size;
        node.next = removed.next;
        Ok(())
    }

    /// Splits at the edges of `range` so that it is covered by whole blocks; returns the first.
    fn isolate(&mut self, range: VRange) -> Result<NodeId> {
        let mut first = self.containing(range.start)?;
        let block = self.block(first)?;
        if block.start < range.start {
            first = self.split(first, range.start - block.start)?;
        }
        let last = self.containing(range.end() - 1)?;
        let block = self.block(last)?;
        if block.end() > range.end() {
            self.split(last, range.end() - block.start)?;
        }
        Ok(first)
    }

    /// Absorbs every block starting before `end` into `first`.
    fn collapse(&mut self, first: NodeId, end: usize) -> Result<()> {
        while let Some(next) = self.node(first)?.next {
            if self.block(next)?.start >= end {
                break;
            }
            self.absorb_next(first)?;
        }
        Ok(())
    }

    fn release(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        node.block = VmBlock::free(node.block.start, node.block.size);
        let range = node.block.range();
        self.coalesce(id)?;
        debug!("vm: free [{:#x}, +{:#x})", range.start, range.size);
        Ok(())
    }

    /// Merges a Free block with Free neighbours (at most two merges).
    fn coalesce(&mut self, id: NodeId) -> Result<()> {
        if let Some(next) = self.node(id)?.next {
            if self.block(next)?.state == BlockState::Free {
                self.absorb_next(id)?;
            }
        }
        if let Some(prev) = self.node(id)?.prev {
            if self.block(prev)?.state == BlockState::Free {
                self.absorb_next(prev)?;
            }
        }
        Ok(())
    }

    fn retype(
        &mut self,
        range: VRange,
        from: BlockState,
        to: BlockState,
        mapping: Option<CapId>,
        flags: Option<MapFlags>,
    ) -> Result<()> {
        let range = self.checked_range(range.start, range.size)?;
        for id in self.covering(range)? {
            let block = self.block(id)?;
            if block.state != from {
                return Err(VmError::WrongState {
                    addr: block.start.max(range.start),
                    expected: from,
                    found: block.state,
                });
            }
        }
        self.ensure_margin()?;
        let mut id = self.isolate(range)?;
        self.collapse(id, range.end())?;
        {
            let block = &mut self.node_mut(id)?.block;
            block.state = to;
            block.mapping = mapping;
            block.flags = flags;
        }
        // Neighbours of the same kind fold back into one block.
        while let Some(prev) = self.node(id)?.prev {
            if !self.block(prev)?.same_kind(&self.block(id)?) {
                break;
            }
            self.absorb_next(prev)?;
            id = prev;
        }
        while let Some(next) = self.node(id)?.next {
            if !self.block(next)?.same_kind(&self.block(id)?) {
                break;
            }
            self.absorb_next(id)?;
        }
        trace!("vm: [{:#x}, +{:#x}) {:?} -> {:?}", range.start, range.size, from, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_abi::{HostKernel, MemoryServices};

    const BASE: usize = 0x4000_0000;
    const PAGE: usize = BASE_PAGE_SIZE;

    fn allocator(pages: usize) -> BlockAllocator {
        BlockAllocator::new(&PagingConfig::new().with_window(BASE, pages * PAGE)).unwrap()
    }

    fn states(alloc: &BlockAllocator) -> Vec<(usize, BlockState)> {
        alloc.blocks().map(|b| ((b.start - BASE) / PAGE, b.state)).collect()
    }

    #[test]
    fn alloc_splits_trailing_remainder() {
        let mut alloc = allocator(16);
        let range = alloc.alloc(100).unwrap();
        assert_eq!(range, VRange::new(BASE, PAGE));
        assert_eq!(states(&alloc), vec![(0, BlockState::Allocated), (1, BlockState::Free)]);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn exact_fit_retypes_in_place() {
        let mut alloc = allocator(4);
        alloc.alloc(4 * PAGE).unwrap();
        assert_eq!(alloc.block_count(), 1);
        assert_eq!(alloc.alloc(PAGE), Err(VmError::OutOfVirtualMemory { requested: PAGE }));
        assert_eq!(alloc.alloc(0), Err(VmError::InvalidArgs("zero-sized allocation")));
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let mut alloc = allocator(16);
        let a = alloc.alloc(PAGE).unwrap();
        let b = alloc.alloc(PAGE).unwrap();
        let c = alloc.alloc(PAGE).unwrap();
        alloc.free(a).unwrap();
        alloc.free(c).unwrap();
        assert_eq!(alloc.block_count(), 3);
        alloc.free(b).unwrap();
        assert_eq!(alloc.block_count(), 1);
        assert_eq!(alloc.free_bytes(), 16 * PAGE);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let mut alloc = allocator(8);
        let a = alloc.alloc(PAGE).unwrap();
        alloc.free(a).unwrap();
        assert_eq!(alloc.free(a), Err(VmError::NotAllocated { addr: BASE }));
    }

    #[test]
    fn first_fit_reuses_lowest_hole() {
        let mut alloc = allocator(16);
        let a = alloc.alloc(2 * PAGE).unwrap();
        alloc.alloc(PAGE).unwrap();
        alloc.free(a).unwrap();
        assert_eq!(alloc.alloc(PAGE).unwrap().start, BASE);
    }

    #[test]
    fn alloc_fixed_carves_middle() {
        let mut alloc = allocator(16);
        let range = alloc.alloc_fixed(BASE + 4 * PAGE, 2 * PAGE).unwrap();
        assert_eq!(range.size, 2 * PAGE);
        assert_eq!(
            states(&alloc),
            vec![(0, BlockState::Free), (4, BlockState::Allocated), (6, BlockState::Free)]
        );
        assert_eq!(
            alloc.alloc_fixed(BASE + 5 * PAGE, PAGE),
            Err(VmError::AddressInUse { addr: BASE + 5 * PAGE })
        );
        assert!(matches!(
            alloc.alloc_fixed(BASE + 15 * PAGE, 2 * PAGE),
            Err(VmError::OutOfRange { .. })
        ));
        alloc.free(range).unwrap();
        assert_eq!(alloc.block_count(), 1);
    }

    #[test]
    fn paged_pages_fold_together() {
        let mut alloc = allocator(16);
        let region = alloc.alloc(4 * PAGE).unwrap();
        alloc.mark_paged(VRange::new(BASE + PAGE, PAGE), None, MapFlags::RW).unwrap();
        assert_eq!(
            states(&alloc),
            vec![
                (0, BlockState::Allocated),
                (1, BlockState::Paged),
                (2, BlockState::Allocated),
                (4, BlockState::Free)
            ]
        );
        alloc.mark_paged(VRange::new(BASE, PAGE), None, MapFlags::RW).unwrap();
        alloc.mark_paged(VRange::new(BASE + 2 * PAGE, 2 * PAGE), None, MapFlags::RW).unwrap();
        assert_eq!(states(&alloc), vec![(0, BlockState::Paged), (4, BlockState::Free)]);
        assert!(matches!(
            alloc.mark_paged(VRange::new(BASE, PAGE), None, MapFlags::RW),
            Err(VmError::WrongState { expected: BlockState::Allocated, .. })
        ));
        alloc.free(region).unwrap();
        assert_eq!(alloc.block_count(), 1);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn free_cuts_reservation_out_of_folded_paged_block() {
        let mut alloc = allocator(16);
        let a = alloc.alloc(PAGE).unwrap();
        let b = alloc.alloc(PAGE).unwrap();
        alloc.mark_paged(a, None, MapFlags::RW).unwrap();
        alloc.mark_paged(b, None, MapFlags::RW).unwrap();
        assert_eq!(states(&alloc), vec![(0, BlockState::Paged), (2, BlockState::Free)]);

        alloc.free(b).unwrap();
        assert_eq!(states(&alloc), vec![(0, BlockState::Paged), (1, BlockState::Free)]);
        alloc.check_invariants().unwrap();
        alloc.free(a).unwrap();
        assert_eq!(alloc.block_count(), 1);
        assert_eq!(alloc.free(b), Err(VmError::NotAllocated { addr: b.start }));
    }

    #[test]
    fn free_after_unpaging_into_allocated_neighbour() {
        let mut alloc = allocator(16);
        let a = alloc.alloc(PAGE).unwrap();
        let b = alloc.alloc(PAGE).unwrap();
        alloc.mark_paged(a, None, MapFlags::RW).unwrap();
        alloc.mark_allocated(a).unwrap();
        assert_eq!(states(&alloc), vec![(0, BlockState::Allocated), (2, BlockState::Free)]);

        alloc.free(b).unwrap();
        assert_eq!(states(&alloc), vec![(0, BlockState::Allocated), (1, BlockState::Free)]);
        alloc.free(a).unwrap();
        assert_eq!(alloc.block_count(), 1);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn free_range_collapses_split_reservation() {
        let mut alloc = allocator(16);
        let region = alloc.alloc(4 * PAGE).unwrap();
        alloc.mark_paged(VRange::new(BASE + 2 * PAGE, PAGE), None, MapFlags::RW).unwrap();
        alloc.free_range(region.start, region.size).unwrap();
        assert_eq!(alloc.block_count(), 1);
        assert!(alloc.free_range(BASE, PAGE).is_err());
    }

    #[test]
    fn distinct_mappings_stay_separate() {
        let mut alloc = allocator(8);
        let a = alloc.alloc(PAGE).unwrap();
        let b = alloc.alloc(PAGE).unwrap();
        let kernel = HostKernel::default();
        let fa = kernel.frame_alloc(PAGE).unwrap();
        let fb = kernel.frame_alloc(PAGE).unwrap();
        alloc.mark_paged(a, Some(fa.id()), MapFlags::RW).unwrap();
        alloc.mark_paged(b, Some(fb.id()), MapFlags::RW).unwrap();
        assert_eq!(alloc.block_count(), 3);
        assert_eq!(alloc.find(b.start).unwrap().mapping, Some(fb.id()));
        alloc.mark_allocated(a).unwrap();
        assert_eq!(alloc.find(a.start).unwrap().state, BlockState::Allocated);
    }

    #[test]
    fn metadata_exhaustion_is_fatal() {
        let config =
            PagingConfig::new().with_window(BASE, 64 * PAGE).with_pool(4, 4).with_margin(2);
        let mut alloc = BlockAllocator::new(&config).unwrap();
        alloc.alloc(PAGE).unwrap();
        alloc.alloc(PAGE).unwrap();
        let err = alloc.alloc(PAGE).unwrap_err();
        assert_eq!(err, VmError::MetadataExhausted);
        assert!(err.is_fatal());
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn empty_pool_is_rejected_at_construction() {
        let config = PagingConfig::new().with_window(BASE, 16 * PAGE).with_pool(4, 0);
        assert!(matches!(BlockAllocator::new(&config), Err(VmError::MetadataExhausted)));
    }

    #[test]
    fn rejects_bad_window() {
        let config = PagingConfig::new().with_window(BASE + 1, PAGE);
        assert!(BlockAllocator::new(&config).is_err());
        let config = PagingConfig::new().with_window(BASE, 0);
        assert!(BlockAllocator::new(&config).is_err());
    }
}
