// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Local message passing (LMP) channel primitive
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - LmpChannel::new/accept/connect: create a local endpoint and bind the remote one
//!   - LmpChannel::send/recv: fixed 9-word datagrams carrying at most one capability
//!   - LmpChannel::alloc_recv_slot: arm the single-use slot an inbound capability lands in
//!
//! ERROR CONDITIONS:
//!   - LmpError::Transient: queue full on send / empty on receive, retry after an event
//!   - LmpError::NoRecvSlot: capability sent to an endpoint without an armed slot
//!   - LmpError::NotConnected / Closed: no usable remote endpoint

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cap::{CapId, Capability};

/// Words carried by one message, header included.
pub const LMP_MSG_WORDS: usize = 9;
/// Queue depth of endpoints created without an explicit depth.
pub const DEFAULT_ENDPOINT_DEPTH: usize = 8;

/// Errors produced by the channel primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LmpError {
    /// Queue full (send) or empty (receive); wait for the matching event and retry.
    #[error("transient channel condition")]
    Transient,
    /// The channel has no remote endpoint bound yet.
    #[error("channel not connected")]
    NotConnected,
    /// The receiver has no armed slot for an inbound capability.
    #[error("receiver has no free capability slot")]
    NoRecvSlot,
    /// More than [`LMP_MSG_WORDS`] words were supplied.
    #[error("message longer than {LMP_MSG_WORDS} words")]
    TooLong,
    /// The remote endpoint was closed.
    #[error("endpoint closed")]
    Closed,
}

/// Fixed-size datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LmpMessage {
    words: [usize; LMP_MSG_WORDS],
    len: usize,
}

impl LmpMessage {
    /// Builds a message from up to [`LMP_MSG_WORDS`] words.
    pub fn new(words: &[usize]) -> Result<Self, LmpError> {
        if words.len() > LMP_MSG_WORDS {
            return Err(LmpError::TooLong);
        }
        let mut buf = [0usize; LMP_MSG_WORDS];
        buf[..words.len()].copy_from_slice(words);
        Ok(Self { words: buf, len: words.len() })
    }

    /// Words that were actually sent.
    pub fn words(&self) -> &[usize] {
        &self.words[..self.len]
    }

    /// Word `index`, or 0 if the sender did not supply it.
    pub fn word(&self, index: usize) -> usize {
        if index < self.len {
            self.words[index]
        } else {
            0
        }
    }

    /// Number of words sent.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a message without any word.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Delivery {
    msg: LmpMessage,
    cap: Option<Capability>,
}

struct EndpointObject {
    id: CapId,
    depth: usize,
    queue: Mutex<VecDeque<Delivery>>,
    recv_slot: AtomicBool,
    closed: AtomicBool,
}

impl EndpointObject {
    fn new(depth: usize) -> Arc<Self> {
        Arc::new(Self {
            id: CapId::fresh(),
            depth: depth.max(1),
            queue: Mutex::new(VecDeque::new()),
            recv_slot: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Capability to send to an endpoint.
#[derive(Clone)]
pub struct EndpointCap {
    inner: Arc<EndpointObject>,
}

impl EndpointCap {
    /// Identifier of the endpoint object.
    pub fn id(&self) -> CapId {
        self.inner.id
    }
}

impl fmt::Debug for EndpointCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointCap").field(&self.inner.id).finish()
    }
}

impl PartialEq for EndpointCap {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for EndpointCap {}

/// One end of an LMP channel: a local receive endpoint plus a bound remote endpoint.
///
/// Clones share both endpoints, so a clone handed to a [`crate::WaitSet`] observes rebinding.
#[derive(Clone)]
pub struct LmpChannel {
    local: Arc<EndpointObject>,
    remote: Arc<Mutex<Option<Arc<EndpointObject>>>>,
}

impl LmpChannel {
    /// Creates a channel with a fresh local endpoint and no remote.
    pub fn new(depth: usize) -> Self {
        Self { local: EndpointObject::new(depth), remote: Arc::new(Mutex::new(None)) }
    }

    /// Creates a fresh local endpoint already bound to `remote`.
    pub fn accept(depth: usize, remote: &EndpointCap) -> Self {
        let chan = Self::new(depth);
        chan.connect(remote);
        chan
    }

    /// Binds (or rebinds) the remote endpoint.
    pub fn connect(&self, remote: &EndpointCap) {
        *self.remote.lock() = Some(Arc::clone(&remote.inner));
    }

    /// Returns true once a remote endpoint is bound.
    pub fn is_connected(&self) -> bool {
        self.remote.lock().is_some()
    }

    /// Capability to this channel's local endpoint.
    pub fn local_cap(&self) -> EndpointCap {
        EndpointCap { inner: Arc::clone(&self.local) }
    }

    /// Identifier of the bound remote endpoint, if any.
    pub fn remote_id(&self) -> Option<CapId> {
        self.remote.lock().as_ref().map(|ep| ep.id)
    }

    fn remote(&self) -> Result<Arc<EndpointObject>, LmpError> {
        self.remote.lock().as_ref().map(Arc::clone).ok_or(LmpError::NotConnected)
    }

    /// Sends `msg` and optionally one capability to the remote endpoint.
    pub fn send(&self, msg: &LmpMessage, cap: Option<Capability>) -> Result<(), LmpError> {
        let remote = self.remote()?;
        if remote.closed.load(Ordering::Acquire) {
            return Err(LmpError::Closed);
        }
        let mut queue = remote.queue.lock();
        if queue.len() >= remote.depth {
            return Err(LmpError::Transient);
        }
        if cap.is_some() && !remote.recv_slot.swap(false, Ordering::AcqRel) {
            return Err(LmpError::NoRecvSlot);
        }
        queue.push_back(Delivery { msg: *msg, cap });
        Ok(())
    }

    /// Receives the next message from the local endpoint.
    pub fn recv(&self) -> Result<(LmpMessage, Option<Capability>), LmpError> {
        let delivery = self.local.queue.lock().pop_front().ok_or(LmpError::Transient)?;
        Ok((delivery.msg, delivery.cap))
    }

    /// Returns true if a send would not hit a full queue.
    pub fn can_send(&self) -> bool {
        match self.remote() {
            Ok(remote) => {
                remote.closed.load(Ordering::Acquire) || remote.queue.lock().len() < remote.depth
            }
            Err(_) => false,
        }
    }

    /// Returns true if a message is waiting on the local endpoint.
    pub fn can_recv(&self) -> bool {
        !self.local.queue.lock().is_empty()
    }

    /// Arms the single-use slot the next inbound capability is stored into.
    pub fn alloc_recv_slot(&self) {
        self.local.recv_slot.store(true, Ordering::Release);
    }

    /// Returns true if an inbound capability can currently be accepted.
    pub fn has_recv_slot(&self) -> bool {
        self.local.recv_slot.load(Ordering::Acquire)
    }

    /// Closes the local endpoint; peers sending to it get [`LmpError::Closed`].
    pub fn close(&self) {
        self.local.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for LmpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmpChannel")
            .field("local", &self.local.id)
            .field("remote", &self.remote_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (LmpChannel, LmpChannel) {
        let a = LmpChannel::new(2);
        let b = LmpChannel::accept(2, &a.local_cap());
        a.connect(&b.local_cap());
        (a, b)
    }

    #[test]
    fn roundtrip_preserves_words() {
        let (a, b) = pair();
        let msg = LmpMessage::new(&[0x101, 42, 7]).unwrap();
        a.send(&msg, None).unwrap();
        let (got, cap) = b.recv().unwrap();
        assert_eq!(got.words(), &[0x101, 42, 7]);
        assert_eq!(got.word(5), 0);
        assert!(cap.is_none());
    }

    #[test]
    fn full_queue_is_transient() {
        let (a, b) = pair();
        let msg = LmpMessage::new(&[1]).unwrap();
        a.send(&msg, None).unwrap();
        a.send(&msg, None).unwrap();
        assert!(!a.can_send());
        assert_eq!(a.send(&msg, None), Err(LmpError::Transient));
        b.recv().unwrap();
        assert!(a.can_send());
        assert_eq!(LmpChannel::new(1).recv().unwrap_err(), LmpError::Transient);
    }

    #[test]
    fn capability_needs_armed_slot_once() {
        let (a, b) = pair();
        let msg = LmpMessage::new(&[1]).unwrap();
        let cap = Capability::Endpoint(a.local_cap());
        assert_eq!(a.send(&msg, Some(cap.clone())), Err(LmpError::NoRecvSlot));

        b.alloc_recv_slot();
        a.send(&msg, Some(cap.clone())).unwrap();
        assert!(!b.has_recv_slot());
        assert_eq!(a.send(&msg, Some(cap)), Err(LmpError::NoRecvSlot));

        let (_, got) = b.recv().unwrap();
        assert_eq!(got.map(|c| c.id()), Some(a.local_cap().id()));
    }

    #[test]
    fn unconnected_and_closed() {
        let lonely = LmpChannel::new(1);
        let msg = LmpMessage::new(&[1]).unwrap();
        assert_eq!(lonely.send(&msg, None), Err(LmpError::NotConnected));
        assert_eq!(LmpMessage::new(&[0; 10]), Err(LmpError::TooLong));

        let (a, b) = pair();
        b.close();
        assert_eq!(a.send(&msg, None), Err(LmpError::Closed));
    }
}
