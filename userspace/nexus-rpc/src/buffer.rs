// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared bulk-data buffer of one session.
//!
//! The buffer owns its mapping. The side that allocated the frame also owns the capability and
//! destroys it on drop; the side that received it only unmaps. Replacing a session's buffer is
//! a move plus drop of the old value.

use std::sync::Arc;

use log::{debug, warn};
use nexus_abi::{Capability, Frame};
use nexus_marshal::{serialize_size_string, serialize_string, unserialize_string};
use nexus_vm::{MapFlags, PagingState};

use crate::{Result, RpcError};

/// Mapped frame shared by both ends of a session.
pub struct SharedBuffer {
    frame: Frame,
    vaddr: usize,
    paging: Arc<PagingState>,
    owns_cap: bool,
}

impl SharedBuffer {
    /// Allocates a frame of at least `size` bytes and maps it (server side).
    pub fn allocate(paging: &Arc<PagingState>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(RpcError::Malformed("zero-sized shared buffer"));
        }
        let mem = paging.memory_services();
        let frame = mem.frame_alloc(size)?;
        let vaddr = match paging.map_frame(&frame, MapFlags::RW) {
            Ok(vaddr) => vaddr,
            Err(err) => {
                mem.cap_destroy(&Capability::Frame(frame))?;
                return Err(err.into());
            }
        };
        debug!("rpc: shared buffer {} ({} bytes) at {:#x}", frame.id(), frame.size(), vaddr);
        Ok(Self { frame, vaddr, paging: Arc::clone(paging), owns_cap: true })
    }

    /// Maps a frame received from the peer (client side).
    pub fn adopt(paging: &Arc<PagingState>, frame: Frame) -> Result<Self> {
        let identity = paging.memory_services().frame_identify(&frame)?;
        let vaddr = paging.map_frame(&frame, MapFlags::RW)?;
        debug!("rpc: adopted buffer {} ({} bytes) at {:#x}", frame.id(), identity.size, vaddr);
        Ok(Self { frame, vaddr, paging: Arc::clone(paging), owns_cap: false })
    }

    /// Frame capability backing the buffer.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Virtual address of the mapping.
    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    /// Usable bytes.
    pub fn capacity(&self) -> usize {
        self.frame.size()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity() => Ok(()),
            _ => Err(RpcError::PayloadTooLarge {
                len: offset.saturating_add(len),
                capacity: self.capacity(),
            }),
        }
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.paging.write_bytes(self.vaddr + offset, data)?;
        Ok(())
    }

    /// Reads `len` bytes from `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        self.paging.read_bytes(self.vaddr + offset, &mut out)?;
        Ok(out)
    }

    /// Serializes `s` at offset 0; returns the encoded length.
    pub fn write_string(&self, s: &str) -> Result<usize> {
        let mut encoded = vec![0u8; serialize_size_string(s)];
        let len = serialize_string(s, &mut encoded);
        self.write(0, &encoded[..len])?;
        Ok(len)
    }

    /// Decodes a string of `len` encoded bytes at offset 0.
    pub fn read_string(&self, len: usize) -> Result<String> {
        let (s, _) = unserialize_string(&self.read(0, len)?)?;
        Ok(s)
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.paging.unmap(self.vaddr) {
            warn!("rpc: unmapping shared buffer at {:#x} failed: {}", self.vaddr, err);
        }
        if self.owns_cap {
            let cap = Capability::Frame(self.frame.clone());
            if let Err(err) = self.paging.memory_services().cap_destroy(&cap) {
                warn!("rpc: destroying shared buffer {} failed: {}", self.frame.id(), err);
            }
        }
    }
}

impl core::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("frame", &self.frame.id())
            .field("vaddr", &format_args!("{:#x}", self.vaddr))
            .field("capacity", &self.capacity())
            .finish()
    }
}
