// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability/frame operations consumed by the paging and RPC layers
//! OWNERS: @runtime
//!
//! [`MemoryServices`] is the narrow interface the upper layers use: allocate a frame or RAM,
//! retype RAM into a frame, identify a frame, destroy a capability, fetch a device capability.
//! [`HostKernel`] implements it with a bump allocator over a simulated physical window.

use std::collections::{HashMap, HashSet};

use log::debug;
use parking_lot::Mutex;

use crate::cap::{CapId, CapKind, Capability, DeviceCap, RamCap, SpecialCapKind};
use crate::frame::{Frame, FrameIdentity};
use crate::{AbiError, Result, BASE_PAGE_SIZE};

/// Physical base of the simulated RAM window.
pub const HOST_PHYS_BASE: u64 = 0x8000_0000;
/// Default size of the simulated RAM window.
pub const HOST_PHYS_SIZE: usize = 256 << 20;

/// Memory-related kernel operations.
pub trait MemoryServices: Send + Sync {
    /// Allocates a frame of at least `size` bytes; the frame reports the actual size.
    fn frame_alloc(&self, size: usize) -> Result<Frame>;

    /// Allocates untyped RAM of at least `size` bytes aligned to `align`.
    fn ram_alloc(&self, size: usize, align: usize) -> Result<RamCap>;

    /// Retypes untyped RAM into a frame covering the same range.
    fn retype_to_frame(&self, ram: &RamCap) -> Result<Frame>;

    /// Reports the physical range of a live frame.
    fn frame_identify(&self, frame: &Frame) -> Result<FrameIdentity>;

    /// Destroys a capability; later operations on it fail with [`AbiError::InvalidCap`].
    fn cap_destroy(&self, cap: &Capability) -> Result<()>;

    /// Returns the device capability of the given kind.
    fn special_cap(&self, kind: SpecialCapKind) -> Result<DeviceCap>;
}

struct HostState {
    next: u64,
    live: HashMap<CapId, CapKind>,
    retyped: HashSet<CapId>,
    frames_allocated: usize,
}

/// In-memory kernel model.
pub struct HostKernel {
    base: u64,
    end: u64,
    state: Mutex<HostState>,
}

impl HostKernel {
    /// Creates a kernel model managing `phys_size` bytes of RAM.
    pub fn new(phys_size: usize) -> Self {
        Self {
            base: HOST_PHYS_BASE,
            end: HOST_PHYS_BASE + phys_size as u64,
            state: Mutex::new(HostState {
                next: HOST_PHYS_BASE,
                live: HashMap::new(),
                retyped: HashSet::new(),
                frames_allocated: 0,
            }),
        }
    }

    /// Number of frames handed out so far (fault handling and explicit allocations).
    pub fn frames_allocated(&self) -> usize {
        self.state.lock().frames_allocated
    }

    /// Bytes of RAM not yet handed out.
    pub fn free_bytes(&self) -> usize {
        (self.end - self.state.lock().next) as usize
    }

    fn carve(&self, state: &mut HostState, size: usize, align: usize) -> Result<u64> {
        if size == 0 {
            return Err(AbiError::InvalidArgs("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(AbiError::InvalidArgs("alignment must be a power of two"));
        }
        let align = align as u64;
        let start = (state.next + align - 1) & !(align - 1);
        let end = start.checked_add(size as u64).filter(|end| *end <= self.end);
        match end {
            Some(end) => {
                state.next = end;
                Ok(start)
            }
            None => Err(AbiError::OutOfMemory { requested: size }),
        }
    }

    fn check_live(state: &HostState, id: CapId, expected: CapKind) -> Result<()> {
        match state.live.get(&id) {
            Some(kind) if *kind == expected => Ok(()),
            Some(kind) => Err(AbiError::WrongCapKind { id, expected, found: *kind }),
            None => Err(AbiError::InvalidCap(id)),
        }
    }
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new(HOST_PHYS_SIZE)
    }
}

fn round_to_page(size: usize) -> usize {
    size.div_ceil(BASE_PAGE_SIZE) * BASE_PAGE_SIZE
}

impl MemoryServices for HostKernel {
    fn frame_alloc(&self, size: usize) -> Result<Frame> {
        let size = round_to_page(size);
        let mut state = self.state.lock();
        let base = self.carve(&mut state, size, BASE_PAGE_SIZE)?;
        let frame = Frame::new(CapId::fresh(), base, size);
        state.live.insert(frame.id(), CapKind::Frame);
        state.frames_allocated += 1;
        debug!("kernel: frame {} at {:#x} ({} bytes)", frame.id(), base, size);
        Ok(frame)
    }

    fn ram_alloc(&self, size: usize, align: usize) -> Result<RamCap> {
        if !align.is_power_of_two() {
            return Err(AbiError::InvalidArgs("alignment must be a power of two"));
        }
        let size = round_to_page(size);
        let mut state = self.state.lock();
        let base = self.carve(&mut state, size, align.max(BASE_PAGE_SIZE))?;
        let ram = RamCap { id: CapId::fresh(), base, size };
        state.live.insert(ram.id, CapKind::Ram);
        Ok(ram)
    }

    fn retype_to_frame(&self, ram: &RamCap) -> Result<Frame> {
        let mut state = self.state.lock();
        Self::check_live(&state, ram.id, CapKind::Ram)?;
        if !state.retyped.insert(ram.id) {
            return Err(AbiError::InvalidArgs("RAM capability already retyped"));
        }
        let frame = Frame::new(CapId::fresh(), ram.base, ram.size);
        state.live.insert(frame.id(), CapKind::Frame);
        Ok(frame)
    }

    fn frame_identify(&self, frame: &Frame) -> Result<FrameIdentity> {
        let state = self.state.lock();
        Self::check_live(&state, frame.id(), CapKind::Frame)?;
        Ok(FrameIdentity { base: frame.base(), size: frame.size() })
    }

    fn cap_destroy(&self, cap: &Capability) -> Result<()> {
        let mut state = self.state.lock();
        match cap {
            // Endpoints are reclaimed when the last channel drops them.
            Capability::Endpoint(_) => Ok(()),
            _ => state.live.remove(&cap.id()).map(|_| ()).ok_or(AbiError::InvalidCap(cap.id())),
        }
    }

    fn special_cap(&self, kind: SpecialCapKind) -> Result<DeviceCap> {
        let (base, size) = match kind {
            SpecialCapKind::Irq => (0, 0),
            SpecialCapKind::DeviceRegion => (self.base.saturating_sub(0x1000_0000), 0x1000_0000),
        };
        let dev = DeviceCap { id: CapId::fresh(), kind, base, size };
        self.state.lock().live.insert(dev.id, CapKind::Device);
        Ok(dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_alloc_rounds_to_pages() {
        let kernel = HostKernel::default();
        let frame = kernel.frame_alloc(100).unwrap();
        assert_eq!(frame.size(), BASE_PAGE_SIZE);
        let id = kernel.frame_identify(&frame).unwrap();
        assert_eq!(id.size, BASE_PAGE_SIZE);
        assert_eq!(id.base % BASE_PAGE_SIZE as u64, 0);
    }

    #[test]
    fn ram_alloc_respects_alignment() {
        let kernel = HostKernel::default();
        kernel.frame_alloc(4096).unwrap();
        let ram = kernel.ram_alloc(4096, 1 << 20).unwrap();
        assert_eq!(ram.base % (1 << 20), 0);
        assert!(ram.size >= 4096);
        assert!(kernel.ram_alloc(4096, 3).is_err());
    }

    #[test]
    fn destroyed_frame_cannot_be_identified() {
        let kernel = HostKernel::default();
        let frame = kernel.frame_alloc(4096).unwrap();
        kernel.cap_destroy(&Capability::Frame(frame.clone())).unwrap();
        assert_eq!(kernel.frame_identify(&frame), Err(AbiError::InvalidCap(frame.id())));
        assert!(kernel.cap_destroy(&Capability::Frame(frame)).is_err());
    }

    #[test]
    fn exhaustion_is_reported() {
        let kernel = HostKernel::new(8192);
        kernel.frame_alloc(8192).unwrap();
        assert_eq!(
            kernel.frame_alloc(1).unwrap_err(),
            AbiError::OutOfMemory { requested: BASE_PAGE_SIZE }
        );
    }

    #[test]
    fn ram_retypes_once() {
        let kernel = HostKernel::default();
        let ram = kernel.ram_alloc(8192, 4096).unwrap();
        let frame = kernel.retype_to_frame(&ram).unwrap();
        assert_eq!(frame.base(), ram.base);
        assert_eq!(frame.size(), 8192);
        assert!(kernel.retype_to_frame(&ram).is_err());
    }
}
