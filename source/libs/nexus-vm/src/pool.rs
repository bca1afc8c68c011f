// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity metadata node pool.
//!
//! Nodes are addressed by stable indices. The pool only grows in [`NodePool::refill`], which
//! callers invoke through [`NodePool::ensure_margin`] before they start mutating; `insert` never
//! grows the pool, so a split or merge can never recurse into allocation.

use crate::{Result, VmError};

/// Stable index of a node.
pub type NodeId = usize;

/// Arena of `T` with a freelist of indices.
#[derive(Debug)]
pub struct NodePool<T> {
    slots: Vec<Option<T>>,
    free: Vec<NodeId>,
    chunk: usize,
    max: usize,
}

impl<T> NodePool<T> {
    /// Creates a pool holding one chunk of free nodes.
    ///
    /// Fails with [`VmError::MetadataExhausted`] when `max` leaves no room for that chunk.
    pub fn new(chunk: usize, max: usize) -> Result<Self> {
        let mut pool = Self { slots: Vec::new(), free: Vec::new(), chunk: chunk.max(1), max };
        pool.refill()?;
        Ok(pool)
    }

    /// Total nodes (used and free).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Free nodes available to `insert`.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Nodes currently holding a value.
    pub fn used(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Adds up to one chunk of free nodes; returns how many were added.
    pub fn refill(&mut self) -> Result<usize> {
        let room = self.max.saturating_sub(self.slots.len());
        let added = room.min(self.chunk);
        if added == 0 {
            return Err(VmError::MetadataExhausted);
        }
        let first = self.slots.len();
        self.slots.extend((0..added).map(|_| None));
        // Lowest index is handed out first.
        self.free.extend((first..first + added).rev());
        Ok(added)
    }

    /// Refills until at least `margin` nodes are free.
    pub fn ensure_margin(&mut self, margin: usize) -> Result<()> {
        while self.free.len() < margin {
            self.refill()?;
        }
        Ok(())
    }

    /// Stores `value` in a free node.
    pub fn insert(&mut self, value: T) -> Result<NodeId> {
        let id = self.free.pop().ok_or(VmError::MetadataExhausted)?;
        self.slots[id] = Some(value);
        Ok(id)
    }

    /// Releases node `id` and returns its value.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let value = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        Some(value)
    }

    /// Borrows node `id`.
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.slots.get(id)?.as_ref()
    }

    /// Mutably borrows node `id`.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots.get_mut(id)?.as_mut()
    }
}
