// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Paging state of one address space: reservations, fixed mappings, demand faults
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - PagingState::alloc_region / alloc_region_fixed: reserve lazily backed memory
//!   - PagingState::map_frame / map_frame_attr: map a caller frame
//!   - PagingState::handle_page_fault: back one Allocated page with a fresh frame
//!   - PagingState::unmap: drop a reservation and its page-table entries
//!   - PagingState::read_* / write_*: host MMU model used by tests and the RPC layer
//!
//! INVARIANTS:
//!   - Lock order is fault -> vspace -> tables
//!   - A page has a page-table entry iff its block is Paged
//!   - After a fatal fault the state is halted and every entry point returns `Halted`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use nexus_abi::{Capability, Frame, MemoryServices};
use parking_lot::Mutex;

use crate::block::{BlockAllocator, BlockState, VRange, VmBlock};
use crate::page_table::{MapFlags, PageTables, Pte, LARGE_PAGE_SIZE};
use crate::{is_page_aligned, page_round_up, PagingConfig, Result, VmError, BASE_PAGE_SIZE};

/// Result of a handled page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A fresh frame now backs the page.
    Mapped,
    /// The page was already backed; nothing changed.
    Spurious,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegionKind {
    Lazy,
    Fixed,
}

#[derive(Clone, Copy, Debug)]
struct Region {
    size: usize,
    kind: RegionKind,
}

struct VSpace {
    blocks: BlockAllocator,
    regions: BTreeMap<usize, Region>,
}

/// Address-space context passed explicitly to everything that maps memory.
pub struct PagingState {
    config: PagingConfig,
    mem: Arc<dyn MemoryServices>,
    fault_lock: Mutex<()>,
    vspace: Mutex<VSpace>,
    tables: Mutex<PageTables>,
    halted: AtomicBool,
}

impl PagingState {
    /// Creates an address space covering `config`'s window.
    pub fn new(config: PagingConfig, mem: Arc<dyn MemoryServices>) -> Result<Self> {
        let blocks = BlockAllocator::new(&config)?;
        info!("vm: address space [{:#x}, +{:#x})", config.base, config.size);
        Ok(Self {
            config,
            mem,
            fault_lock: Mutex::new(()),
            vspace: Mutex::new(VSpace { blocks, regions: BTreeMap::new() }),
            tables: Mutex::new(PageTables::new()),
            halted: AtomicBool::new(false),
        })
    }

    /// Layout this state was created with.
    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Kernel services frames are allocated from.
    pub fn memory_services(&self) -> &Arc<dyn MemoryServices> {
        &self.mem
    }

    /// Returns true once a fatal fault stopped this address space.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn check_halted(&self) -> Result<()> {
        if self.halted() {
            Err(VmError::Halted)
        } else {
            Ok(())
        }
    }

    /// Reserves `size` bytes; pages are backed on first touch.
    pub fn alloc_region(&self, size: usize) -> Result<usize> {
        self.check_halted()?;
        let mut vspace = self.vspace.lock();
        let range = vspace.blocks.alloc(size)?;
        vspace.regions.insert(range.start, Region { size: range.size, kind: RegionKind::Lazy });
        Ok(range.start)
    }

    /// Reserves `[addr, addr + size)`; pages are backed on first touch.
    pub fn alloc_region_fixed(&self, addr: usize, size: usize) -> Result<usize> {
        self.check_halted()?;
        let mut vspace = self.vspace.lock();
        let range = vspace.blocks.alloc_fixed(addr, size)?;
        vspace.regions.insert(range.start, Region { size: range.size, kind: RegionKind::Lazy });
        Ok(range.start)
    }

    /// Maps `frame` at a free address chosen by the allocator.
    pub fn map_frame(&self, frame: &Frame, flags: MapFlags) -> Result<usize> {
        self.check_halted()?;
        let range = {
            let mut vspace = self.vspace.lock();
            let range = vspace.blocks.alloc(frame.size())?;
            let region = Region { size: range.size, kind: RegionKind::Fixed };
            vspace.regions.insert(range.start, region);
            range
        };
        if let Err(err) = self.map_window(range.start, frame, 0, range.size, flags) {
            let mut vspace = self.vspace.lock();
            vspace.regions.remove(&range.start);
            vspace.blocks.free_range(range.start, range.size)?;
            return Err(err);
        }
        debug!("vm: mapped {} at {:#x}", frame.id(), range.start);
        Ok(range.start)
    }

    /// Maps `frame` at `vaddr`.
    ///
    /// The range is reserved on the fly if it is Free, or must be Allocated (for example a
    /// region from [`PagingState::alloc_region`] that was never touched).
    pub fn map_frame_attr(&self, vaddr: usize, frame: &Frame, flags: MapFlags) -> Result<()> {
        self.check_halted()?;
        if !is_page_aligned(vaddr) {
            return Err(VmError::InvalidArgs("mapping address is not page aligned"));
        }
        let size = page_round_up(frame.size());
        {
            let mut vspace = self.vspace.lock();
            let free = matches!(vspace.blocks.find(vaddr), Some(b) if b.state == BlockState::Free);
            if free {
                vspace.blocks.alloc_fixed(vaddr, size)?;
                vspace.regions.insert(vaddr, Region { size, kind: RegionKind::Fixed });
            }
        }
        self.map_window(vaddr, frame, 0, size, flags)
    }

    /// Maps `len` bytes of `frame` starting at `offset`, one second-level window per call.
    fn map_window(
        &self,
        vaddr: usize,
        frame: &Frame,
        offset: usize,
        len: usize,
        flags: MapFlags,
    ) -> Result<()> {
        let window_end = (vaddr / LARGE_PAGE_SIZE + 1) * LARGE_PAGE_SIZE;
        let chunk = len.min(window_end - vaddr);
        {
            let mut vspace = self.vspace.lock();
            vspace.blocks.mark_paged(VRange::new(vaddr, chunk), Some(frame.id()), flags)?;
            let mut tables = self.tables.lock();
            for page in (0..chunk).step_by(BASE_PAGE_SIZE) {
                let pte = Pte { frame: frame.clone(), offset: offset + page, flags, owned: false };
                tables.map_page(vaddr + page, pte)?;
            }
        }
        if chunk < len {
            self.map_window(vaddr + chunk, frame, offset + chunk, len - chunk, flags)?;
        }
        Ok(())
    }

    /// Resolves a fault at `vaddr`.
    ///
    /// Touching an address outside every reservation is a segmentation fault: it is reported
    /// and the address space is halted.
    pub fn handle_page_fault(&self, vaddr: usize) -> Result<FaultOutcome> {
        self.check_halted()?;
        let _fault = self.fault_lock.lock();
        let outcome = self.fault_locked(vaddr);
        if let Err(err) = &outcome {
            if err.is_fatal() {
                error!("vm: fatal fault at {:#x}: {}; halting address space", vaddr, err);
                self.halted.store(true, Ordering::Release);
            }
        }
        outcome
    }

    fn fault_locked(&self, vaddr: usize) -> Result<FaultOutcome> {
        let page = vaddr & !(BASE_PAGE_SIZE - 1);
        let mut vspace = self.vspace.lock();
        match vspace.blocks.find(vaddr).map(|b| b.state) {
            None | Some(BlockState::Free) => return Err(VmError::Segmentation { addr: vaddr }),
            Some(BlockState::Paged) => {
                debug!("vm: spurious fault at {:#x}", vaddr);
                return Ok(FaultOutcome::Spurious);
            }
            Some(BlockState::Allocated) => {}
        }
        vspace.blocks.ensure_margin()?;
        let frame = self.mem.frame_alloc(BASE_PAGE_SIZE)?;
        let range = VRange::new(page, BASE_PAGE_SIZE);
        vspace.blocks.mark_paged(range, None, MapFlags::RW)?;
        let pte = Pte { frame: frame.clone(), offset: 0, flags: MapFlags::RW, owned: true };
        if let Err(err) = self.tables.lock().map_page(page, pte) {
            vspace.blocks.mark_allocated(range)?;
            self.mem.cap_destroy(&Capability::Frame(frame))?;
            return Err(err);
        }
        debug!("vm: fault at {:#x} backed by {}", vaddr, frame.id());
        Ok(FaultOutcome::Mapped)
    }

    /// Drops the reservation starting at `vaddr` with all its page-table entries.
    ///
    /// Frames the fault handler allocated are destroyed; caller frames are left alone.
    pub fn unmap(&self, vaddr: usize) -> Result<()> {
        self.check_halted()?;
        let _fault = self.fault_lock.lock();
        let mut released = Vec::new();
        {
            let mut vspace = self.vspace.lock();
            let region = *vspace.regions.get(&vaddr).ok_or(VmError::NotMapped { addr: vaddr })?;
            {
                let mut tables = self.tables.lock();
                for page in (vaddr..vaddr + region.size).step_by(BASE_PAGE_SIZE) {
                    if let Some(pte) = tables.unmap_page(page) {
                        if pte.owned {
                            released.push(pte.frame);
                        }
                    }
                }
            }
            vspace.blocks.free_range(vaddr, region.size)?;
            vspace.regions.remove(&vaddr);
            debug!("vm: unmapped {:?} region [{:#x}, +{:#x})", region.kind, vaddr, region.size);
        }
        for frame in released {
            self.mem.cap_destroy(&Capability::Frame(frame))?;
        }
        Ok(())
    }

    fn access<T>(&self, vaddr: usize, op: impl Fn(&Frame, usize) -> Result<T>) -> Result<T> {
        self.check_halted()?;
        for attempt in 0..2 {
            let hit = self.tables.lock().translate(vaddr).map(|(frame, off)| (frame.clone(), off));
            if let Some((frame, offset)) = hit {
                return op(&frame, offset);
            }
            if attempt == 0 {
                self.handle_page_fault(vaddr)?;
            }
        }
        Err(VmError::NotMapped { addr: vaddr })
    }

    /// Loads the 64-bit value at `vaddr` (8-byte aligned).
    pub fn read_u64(&self, vaddr: usize) -> Result<u64> {
        if vaddr % 8 != 0 {
            return Err(VmError::InvalidArgs("unaligned 64-bit access"));
        }
        self.access(vaddr, |frame, offset| Ok(frame.memory().load_u64(offset)?))
    }

    /// Stores a 64-bit value at `vaddr` (8-byte aligned).
    pub fn write_u64(&self, vaddr: usize, value: u64) -> Result<()> {
        if vaddr % 8 != 0 {
            return Err(VmError::InvalidArgs("unaligned 64-bit access"));
        }
        self.access(vaddr, |frame, offset| Ok(frame.memory().store_u64(offset, value)?))
    }

    /// Copies `out.len()` bytes starting at `vaddr`.
    pub fn read_bytes(&self, vaddr: usize, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let va = vaddr + done;
            let n = (BASE_PAGE_SIZE - va % BASE_PAGE_SIZE).min(out.len() - done);
            let chunk = self.access(va, |frame, offset| {
                let mut chunk = vec![0u8; n];
                frame.memory().read_bytes(offset, &mut chunk)?;
                Ok(chunk)
            })?;
            out[done..done + n].copy_from_slice(&chunk);
            done += n;
        }
        Ok(())
    }

    /// Copies `data` to `vaddr`.
    pub fn write_bytes(&self, vaddr: usize, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let va = vaddr + done;
            let n = (BASE_PAGE_SIZE - va % BASE_PAGE_SIZE).min(data.len() - done);
            let chunk = &data[done..done + n];
            self.access(va, |frame, offset| Ok(frame.memory().write_bytes(offset, chunk)?))?;
            done += n;
        }
        Ok(())
    }

    /// Snapshot of the block list.
    pub fn blocks(&self) -> Vec<VmBlock> {
        self.vspace.lock().blocks.blocks().collect()
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.vspace.lock().blocks.block_count()
    }

    /// Size of the reservation starting at `vaddr`.
    pub fn region_size(&self, vaddr: usize) -> Option<usize> {
        self.vspace.lock().regions.get(&vaddr).map(|r| r.size)
    }

    /// Second-level tables created so far.
    pub fn l2_tables_created(&self) -> usize {
        self.tables.lock().l2_tables_created()
    }

    /// Pages with a page-table entry.
    pub fn mapped_pages(&self) -> usize {
        self.tables.lock().mapped_pages()
    }

    /// Checks the block list invariants.
    pub fn check_invariants(&self) -> Result<()> {
        self.vspace.lock().blocks.check_invariants()
    }
}

impl core::fmt::Debug for PagingState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PagingState")
            .field("config", &self.config)
            .field("halted", &self.halted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_abi::HostKernel;

    const PAGE: usize = BASE_PAGE_SIZE;

    fn state() -> (Arc<HostKernel>, PagingState) {
        let kernel = Arc::new(HostKernel::default());
        let paging = PagingState::new(PagingConfig::new(), kernel.clone()).unwrap();
        (kernel, paging)
    }

    #[test]
    fn first_touch_maps_then_spurious() {
        let (kernel, paging) = state();
        let va = paging.alloc_region(2 * PAGE).unwrap();
        assert_eq!(paging.handle_page_fault(va + 8).unwrap(), FaultOutcome::Mapped);
        assert_eq!(paging.handle_page_fault(va).unwrap(), FaultOutcome::Spurious);
        assert_eq!(kernel.frames_allocated(), 1);
        paging.write_u64(va + PAGE, 0xdead_beef).unwrap();
        assert_eq!(paging.read_u64(va + PAGE).unwrap(), 0xdead_beef);
        assert_eq!(kernel.frames_allocated(), 2);
        paging.check_invariants().unwrap();
    }

    #[test]
    fn segmentation_fault_halts() {
        let (_kernel, paging) = state();
        let base = paging.config().base;
        assert_eq!(
            paging.handle_page_fault(base + 0x1234),
            Err(VmError::Segmentation { addr: base + 0x1234 })
        );
        assert!(paging.halted());
        assert_eq!(paging.alloc_region(PAGE), Err(VmError::Halted));
        assert_eq!(paging.read_u64(base), Err(VmError::Halted));
    }

    #[test]
    fn frame_mapping_spans_windows() {
        let (kernel, paging) = state();
        let frame = kernel.frame_alloc(3 * PAGE).unwrap();
        frame.memory().store_u64(2 * PAGE, 42).unwrap();
        let va = paging.config().base + LARGE_PAGE_SIZE - PAGE;
        paging.map_frame_attr(va, &frame, MapFlags::RW).unwrap();
        assert_eq!(paging.l2_tables_created(), 2);
        assert_eq!(paging.read_u64(va + 2 * PAGE).unwrap(), 42);
        let block = paging.blocks().into_iter().find(|b| b.start == va).unwrap();
        assert_eq!(block.state, BlockState::Paged);
        assert_eq!(block.size, 3 * PAGE);
        assert_eq!(block.mapping, Some(frame.id()));
        paging.unmap(va).unwrap();
        assert_eq!(paging.block_count(), 1);
        // Caller frames survive the unmap.
        assert!(kernel.frame_identify(&frame).is_ok());
    }

    #[test]
    fn map_frame_shares_memory() {
        let (kernel, paging) = state();
        let frame = kernel.frame_alloc(PAGE).unwrap();
        let va = paging.map_frame(&frame, MapFlags::RW).unwrap();
        paging.write_bytes(va + 3, b"hello").unwrap();
        let mut out = [0u8; 5];
        frame.memory().read_bytes(3, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(paging.region_size(va), Some(PAGE));
        assert_eq!(kernel.frames_allocated(), 1);
    }

    #[test]
    fn unmap_releases_reservation() {
        let (_kernel, paging) = state();
        let va = paging.alloc_region(3 * PAGE).unwrap();
        paging.write_bytes(va + PAGE - 2, &[7u8; 4]).unwrap();
        assert_eq!(paging.mapped_pages(), 2);
        paging.unmap(va).unwrap();
        assert_eq!(paging.mapped_pages(), 0);
        assert_eq!(paging.block_count(), 1);
        assert_eq!(paging.unmap(va), Err(VmError::NotMapped { addr: va }));
        assert!(matches!(paging.read_u64(va), Err(VmError::Segmentation { .. })));
    }
}
