// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Frames of (simulated) physical memory shared between domains
//! OWNERS: @runtime
//!
//! Frame memory is stored as a slice of `AtomicU32` words. That gives the URPC mailbox a real
//! atomic status word at offset 0 and lets two threads share a frame without `unsafe`. Byte
//! accesses are performed word-wise with relaxed ordering; callers that publish data to another
//! domain order it with explicit fences around their status word, exactly like they would on
//! hardware.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cap::CapId;
use crate::{AbiError, Result};

const WORD: usize = core::mem::size_of::<u32>();

/// Backing storage of one frame.
pub struct FrameMemory {
    words: Box<[AtomicU32]>,
}

impl FrameMemory {
    /// Allocates zeroed memory of at least `size` bytes (rounded up to a word).
    pub fn zeroed(size: usize) -> Self {
        let words = (0..size.div_ceil(WORD)).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * WORD
    }

    /// Returns true for a zero-sized frame.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(AbiError::OutOfBounds { offset, len, size: self.len() }),
        }
    }

    fn word(&self, offset: usize) -> Result<&AtomicU32> {
        if offset % WORD != 0 {
            return Err(AbiError::Misaligned(offset));
        }
        self.check(offset, WORD)?;
        Ok(&self.words[offset / WORD])
    }

    /// Atomically loads the 32-bit word at `offset`.
    pub fn load_u32(&self, offset: usize, order: Ordering) -> Result<u32> {
        Ok(self.word(offset)?.load(order))
    }

    /// Atomically stores the 32-bit word at `offset`.
    pub fn store_u32(&self, offset: usize, value: u32, order: Ordering) -> Result<()> {
        self.word(offset)?.store(value, order);
        Ok(())
    }

    /// Loads a little-endian 64-bit value from two consecutive words.
    pub fn load_u64(&self, offset: usize) -> Result<u64> {
        let lo = self.load_u32(offset, Ordering::Relaxed)? as u64;
        let hi = self.load_u32(offset + WORD, Ordering::Relaxed)? as u64;
        Ok(lo | (hi << 32))
    }

    /// Stores a little-endian 64-bit value into two consecutive words.
    pub fn store_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.check(offset, 2 * WORD)?;
        self.store_u32(offset, value as u32, Ordering::Relaxed)?;
        self.store_u32(offset + WORD, (value >> 32) as u32, Ordering::Relaxed)
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        let mut pos = offset;
        let mut dst = out;
        while !dst.is_empty() {
            let lane = pos % WORD;
            let n = (WORD - lane).min(dst.len());
            let bytes = self.words[pos / WORD].load(Ordering::Relaxed).to_le_bytes();
            dst[..n].copy_from_slice(&bytes[lane..lane + n]);
            pos += n;
            dst = &mut dst[n..];
        }
        Ok(())
    }

    /// Copies `data` into the frame starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        let mut pos = offset;
        let mut src = data;
        while !src.is_empty() {
            let lane = pos % WORD;
            let n = (WORD - lane).min(src.len());
            let cell = &self.words[pos / WORD];
            let mut bytes =
                if n == WORD { [0u8; WORD] } else { cell.load(Ordering::Relaxed).to_le_bytes() };
            bytes[lane..lane + n].copy_from_slice(&src[..n]);
            cell.store(u32::from_le_bytes(bytes), Ordering::Relaxed);
            pos += n;
            src = &src[n..];
        }
        Ok(())
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn fill_zero(&self, offset: usize, len: usize) -> Result<()> {
        self.write_bytes(offset, &vec![0u8; len])
    }
}

impl fmt::Debug for FrameMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameMemory").field("len", &self.len()).finish()
    }
}

/// What `frame_identify` reports about a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameIdentity {
    /// Physical base address.
    pub base: u64,
    /// Size in bytes.
    pub size: usize,
}

/// Frame capability: a physical range plus its backing memory.
#[derive(Clone)]
pub struct Frame {
    id: CapId,
    base: u64,
    memory: Arc<FrameMemory>,
}

impl Frame {
    pub(crate) fn new(id: CapId, base: u64, size: usize) -> Self {
        Self { id, base, memory: Arc::new(FrameMemory::zeroed(size)) }
    }

    /// Identifier of the frame object.
    pub fn id(&self) -> CapId {
        self.id
    }

    /// Physical base address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// Backing memory, shared by every copy of this capability.
    pub fn memory(&self) -> &FrameMemory {
        &self.memory
    }

    /// Returns true if both capabilities name the same frame object.
    pub fn same_object(&self, other: &Frame) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_bytes_roundtrip() {
        let mem = FrameMemory::zeroed(64);
        mem.write_bytes(3, b"milan").unwrap();
        let mut out = [0u8; 7];
        mem.read_bytes(2, &mut out).unwrap();
        assert_eq!(&out, b"\0milan\0");
    }

    #[test]
    fn partial_word_write_preserves_neighbours() {
        let mem = FrameMemory::zeroed(8);
        mem.store_u32(0, 0xAABB_CCDD, Ordering::Relaxed).unwrap();
        mem.write_bytes(1, &[0x11]).unwrap();
        assert_eq!(mem.load_u32(0, Ordering::Relaxed).unwrap(), 0xAABB_11DD);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let mem = FrameMemory::zeroed(16);
        let err = mem.write_bytes(12, &[0; 8]).unwrap_err();
        assert_eq!(err, AbiError::OutOfBounds { offset: 12, len: 8, size: 16 });
        assert_eq!(mem.load_u32(2, Ordering::Relaxed), Err(AbiError::Misaligned(2)));
    }

    #[test]
    fn u64_is_little_endian_across_words() {
        let mem = FrameMemory::zeroed(16);
        mem.store_u64(8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(mem.load_u32(8, Ordering::Relaxed).unwrap(), 0x0506_0708);
        assert_eq!(mem.load_u64(8).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn copies_share_memory() {
        let frame = Frame::new(CapId::fresh(), 0x8000_0000, 4096);
        let copy = frame.clone();
        frame.memory().write_bytes(0, b"hi").unwrap();
        let mut out = [0u8; 2];
        copy.memory().read_bytes(0, &mut out).unwrap();
        assert_eq!(&out, b"hi");
        assert!(copy.same_object(&frame));
    }
}
