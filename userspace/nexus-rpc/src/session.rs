// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Client side of one RPC session
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - RpcSession::connect(): handshake with a listening endpoint, then negotiate a buffer
//!   - RpcSession::wrapper_send(): one request/response exchange
//!   - RpcSession::send_payload() / send_inline(): bulk payloads with or without a buffer
//!
//! INVARIANTS:
//!   - At most one request is outstanding; `can_send` is false from the send until the reply
//!   - A session whose reply wait timed out stays busy; later sends fail with `Busy`
//!   - Replacing the shared buffer drops the old one before the new one is requested
//!
//! Waits follow the cooperative pattern: register a one-shot callback on the wait set, then
//! dispatch it until the callback fired or the budget ran out.

use core::cell::Cell;
use core::time::Duration;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, info, warn};
use nexus_abi::{
    Capability, EndpointCap, Event, LmpChannel, LmpError, LmpMessage, MsgFlags, MsgHeader,
    WaitSet, LMP_MSG_WORDS,
};
use nexus_vm::PagingState;

use crate::budget::{deadline_after, retry_until, Clock, HostClock};
use crate::buffer::SharedBuffer;
use crate::{opcode, ErrorCode, Result, RpcConfig, RpcError};

const WORD_BYTES: usize = core::mem::size_of::<usize>();
/// Index of the first payload word of an inline chunk (after header and total length).
pub(crate) const INLINE_FIRST_WORD: usize = 2;
/// Payload bytes carried by one inline chunk.
pub(crate) const INLINE_BYTES: usize = (LMP_MSG_WORDS - INLINE_FIRST_WORD) * WORD_BYTES;

/// Packs up to [`INLINE_BYTES`] bytes into little-endian words.
pub(crate) fn pack_inline(chunk: &[u8]) -> Vec<usize> {
    chunk
        .chunks(WORD_BYTES)
        .map(|part| {
            let mut word = [0u8; WORD_BYTES];
            word[..part.len()].copy_from_slice(part);
            usize::from_le_bytes(word)
        })
        .collect()
}

/// Unpacks the first `len` bytes of `words`.
pub(crate) fn unpack_inline(words: &[usize], len: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    bytes.truncate(len);
    bytes
}

/// Reply to one request.
#[derive(Debug)]
pub struct Response {
    /// Decoded reply header.
    pub header: MsgHeader,
    /// Raw reply words (word 0 is the header).
    pub msg: LmpMessage,
    /// Capability sent with the reply.
    pub cap: Option<Capability>,
}

impl Response {
    /// Opcode of the reply.
    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    /// Argument word `index` (the word after the header is index 0).
    pub fn arg(&self, index: usize) -> usize {
        self.msg.word(index + 1)
    }

    /// Fails with `UnexpectedOpcode` unless the reply carries `expected`.
    pub fn expect_opcode(&self, expected: u8) -> Result<()> {
        if self.header.opcode == expected {
            Ok(())
        } else {
            Err(RpcError::UnexpectedOpcode { expected, got: self.header.opcode })
        }
    }
}

/// Client end of a session.
pub struct RpcSession {
    chan: LmpChannel,
    ws: Rc<WaitSet>,
    clock: Box<dyn Clock>,
    can_send: Cell<bool>,
    buffer: Option<SharedBuffer>,
    paging: Arc<PagingState>,
    config: RpcConfig,
}

impl RpcSession {
    /// Connects to the listening endpoint `server` with a private wait set and the host clock.
    pub fn connect(
        server: &EndpointCap,
        paging: Arc<PagingState>,
        config: RpcConfig,
    ) -> Result<Self> {
        let clock = Box::new(HostClock::new());
        Self::connect_with(server, paging, config, Rc::new(WaitSet::new()), clock)
    }

    /// Connects using the caller's wait set and clock.
    pub fn connect_with(
        server: &EndpointCap,
        paging: Arc<PagingState>,
        config: RpcConfig,
        ws: Rc<WaitSet>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        let chan = LmpChannel::new(config.endpoint_depth);
        chan.connect(server);
        let mut session = Self::from_channel(chan, paging, config, ws, clock);
        session.handshake()?;
        if config.shared_buffer_size > 0 {
            session.request_shared_buffer(config.shared_buffer_size)?;
        }
        Ok(session)
    }

    pub(crate) fn from_channel(
        chan: LmpChannel,
        paging: Arc<PagingState>,
        config: RpcConfig,
        ws: Rc<WaitSet>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self { chan, ws, clock, can_send: Cell::new(true), buffer: None, paging, config }
    }

    /// Returns false while a request is outstanding (or after its reply wait timed out).
    pub fn can_send(&self) -> bool {
        self.can_send.get()
    }

    /// Underlying channel.
    pub fn channel(&self) -> &LmpChannel {
        &self.chan
    }

    /// Address space the shared buffer is mapped in.
    pub fn paging(&self) -> &Arc<PagingState> {
        &self.paging
    }

    /// Negotiated shared buffer.
    pub fn shared_buffer(&self) -> Option<&SharedBuffer> {
        self.buffer.as_ref()
    }

    /// Session configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    fn handshake(&mut self) -> Result<()> {
        let own = Capability::Endpoint(self.chan.local_cap());
        let reply = self.wrapper_send(MsgHeader::request(opcode::HANDSHAKE), &[], Some(own), true)?;
        reply.expect_opcode(opcode::HANDSHAKE)?;
        let endpoint = reply
            .cap
            .and_then(Capability::into_endpoint)
            .ok_or(RpcError::Malformed("handshake reply without an endpoint"))?;
        self.chan.connect(&endpoint);
        info!("rpc: session bound to {:?}", endpoint);
        Ok(())
    }

    /// Requests a shared buffer of `size` bytes; returns the granted capacity.
    ///
    /// An existing buffer is dropped first.
    pub fn request_shared_buffer(&mut self, size: usize) -> Result<usize> {
        self.buffer = None;
        let header = MsgHeader::request(opcode::SHARED_BUFFER_REQUEST);
        let reply = self.wrapper_send(header, &[size], None, true)?;
        reply.expect_opcode(opcode::SHARED_BUFFER_REQUEST)?;
        let frame = reply
            .cap
            .and_then(Capability::into_frame)
            .ok_or(RpcError::Malformed("shared buffer reply without a frame"))?;
        let buffer = SharedBuffer::adopt(&self.paging, frame)?;
        let capacity = buffer.capacity();
        self.buffer = Some(buffer);
        info!("rpc: shared buffer of {} bytes (requested {})", capacity, size);
        Ok(capacity)
    }

    fn wait_for(&self, event: Event, budget: Duration) -> Result<()> {
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        match event {
            Event::Writable => self.ws.register_send(&self.chan, move || flag.set(true)),
            Event::Readable => self.ws.register_recv(&self.chan, move || flag.set(true)),
        }
        let deadline = deadline_after(&*self.clock, budget)?;
        retry_until(&*self.clock, deadline, || {
            self.ws.dispatch_once();
            if fired.get() {
                Ok(())
            } else {
                Err(RpcError::WouldBlock)
            }
        })
    }

    /// Sends one request and waits for its reply.
    ///
    /// `args` are the words after the header (at most 8). With `expect_ack`, a reply without the
    /// ACK flag fails with `MissingAck`; a reply with the ERROR flag always fails with `Remote`.
    pub fn wrapper_send(
        &self,
        header: MsgHeader,
        args: &[usize],
        cap: Option<Capability>,
        expect_ack: bool,
    ) -> Result<Response> {
        if !self.can_send.get() {
            return Err(RpcError::Busy);
        }
        let mut words = Vec::with_capacity(args.len() + 1);
        words.push(header.to_word());
        words.extend_from_slice(args);
        let msg = LmpMessage::new(&words)?;

        self.wait_for(Event::Writable, self.config.send_budget)?;
        // Replies may carry a capability; every slot is single-use.
        self.chan.alloc_recv_slot();
        let deadline = deadline_after(&*self.clock, self.config.send_budget)?;
        retry_until(&*self.clock, deadline, || match self.chan.send(&msg, cap.clone()) {
            Err(LmpError::NoRecvSlot) => Err(RpcError::WouldBlock),
            other => other.map_err(RpcError::from),
        })?;
        self.can_send.set(false);
        debug!("rpc: -> {} {:?} ({} args)", opcode::name(header.opcode), header.flags, args.len());

        let (reply, reply_cap) = loop {
            if let Err(err) = self.wait_for(Event::Readable, self.config.reply_budget) {
                warn!("rpc: no reply to {}: {}", opcode::name(header.opcode), err);
                return Err(err);
            }
            match self.chan.recv() {
                Ok(delivery) => break delivery,
                Err(LmpError::Transient) => continue,
                Err(err) => {
                    self.can_send.set(true);
                    return Err(err.into());
                }
            }
        };
        self.can_send.set(true);

        let reply_header = MsgHeader::from_word(reply.word(0))
            .map_err(|_| RpcError::Malformed("reply header carries undefined flags"))?;
        debug!("rpc: <- {} {:?}", opcode::name(reply_header.opcode), reply_header.flags);
        if reply_header.is_error() {
            return Err(RpcError::Remote(ErrorCode::from_word(reply.word(1))));
        }
        if expect_ack && !reply_header.is_ack() {
            return Err(RpcError::MissingAck);
        }
        Ok(Response { header: reply_header, msg: reply, cap: reply_cap })
    }

    /// Request with argument words only, expecting an ACK.
    pub fn call(&self, opcode: u8, args: &[usize]) -> Result<Response> {
        self.wrapper_send(MsgHeader::request(opcode), args, None, true)
    }

    /// Writes `payload` into the shared buffer and sends `opcode` with
    /// `[payload.len(), extra...]`.
    pub fn send_payload(
        &self,
        opcode: u8,
        payload: &[u8],
        extra: &[usize],
        cap: Option<Capability>,
    ) -> Result<Response> {
        let buffer = self.buffer.as_ref().ok_or(RpcError::NoSharedBuffer)?;
        buffer.write(0, payload)?;
        let mut args = Vec::with_capacity(extra.len() + 1);
        args.push(payload.len());
        args.extend_from_slice(extra);
        self.wrapper_send(MsgHeader::request(opcode), &args, cap, true)
    }

    /// Sends `payload` in the message words; every chunk but the last carries INCOMPLETE.
    pub fn send_inline(&self, opcode: u8, payload: &[u8]) -> Result<Response> {
        let chunks: Vec<&[u8]> =
            if payload.is_empty() { vec![payload] } else { payload.chunks(INLINE_BYTES).collect() };
        let last = chunks.len() - 1;
        let mut reply = None;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let flags = if index < last { MsgFlags::INCOMPLETE } else { MsgFlags::empty() };
            let mut args = vec![payload.len()];
            args.extend(pack_inline(chunk));
            reply = Some(self.wrapper_send(MsgHeader::new(opcode, flags), &args, None, true)?);
        }
        reply.ok_or(RpcError::Malformed("inline payload produced no chunk"))
    }
}

impl core::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcSession")
            .field("chan", &self.chan)
            .field("can_send", &self.can_send.get())
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::tests::TestClock;
    use core::cell::RefCell;
    use nexus_abi::HostKernel;
    use nexus_vm::PagingConfig;
    use proptest::prelude::*;

    fn session_with_peer(clock: Box<dyn Clock>) -> (RpcSession, LmpChannel) {
        let kernel = Arc::new(HostKernel::default());
        let paging = Arc::new(PagingState::new(PagingConfig::new(), kernel).unwrap());
        let chan = LmpChannel::new(8);
        let peer = LmpChannel::accept(8, &chan.local_cap());
        chan.connect(&peer.local_cap());
        let config = RpcConfig::new()
            .with_budgets(Duration::from_millis(5), Duration::from_millis(5));
        let ws = Rc::new(WaitSet::new());
        let session = RpcSession::from_channel(chan, paging, config, ws, clock);
        (session, peer)
    }

    fn reply(peer: &LmpChannel, words: &[usize]) {
        peer.send(&LmpMessage::new(words).unwrap(), None).unwrap();
    }

    #[test]
    fn ack_reply_completes_the_call() {
        let (session, peer) = session_with_peer(Box::new(HostClock::new()));
        reply(&peer, &[MsgHeader::ack(opcode::NUMBER).to_word(), 7]);
        let response = session.call(opcode::NUMBER, &[42]).unwrap();
        assert_eq!(response.arg(0), 7);
        assert!(session.can_send());
        let (sent, _) = peer.recv().unwrap();
        assert_eq!(sent.words(), &[MsgHeader::request(opcode::NUMBER).to_word(), 42]);
    }

    #[test]
    fn error_flag_carries_remote_code() {
        let (session, peer) = session_with_peer(Box::new(HostClock::new()));
        let header = MsgHeader::error(opcode::GET_NAME).to_word();
        reply(&peer, &[header, ErrorCode::DomainNotFound.to_word()]);
        assert_eq!(
            session.call(opcode::GET_NAME, &[99]).unwrap_err(),
            RpcError::Remote(ErrorCode::DomainNotFound)
        );
        assert!(session.can_send());
    }

    #[test]
    fn missing_ack_is_a_protocol_error() {
        let (session, peer) = session_with_peer(Box::new(HostClock::new()));
        reply(&peer, &[MsgHeader::request(opcode::NUMBER).to_word()]);
        assert_eq!(session.call(opcode::NUMBER, &[1]).unwrap_err(), RpcError::MissingAck);
        reply(&peer, &[MsgHeader::request(opcode::NUMBER).to_word()]);
        let header = MsgHeader::request(opcode::NUMBER);
        assert!(session.wrapper_send(header, &[1], None, false).is_ok());
    }

    type YieldHook = Rc<RefCell<Option<Box<dyn Fn()>>>>;

    /// Test clock that runs a hook on every yield, i.e. while the session is blocked.
    struct HookedClock {
        inner: TestClock,
        hook: YieldHook,
    }

    impl Clock for HookedClock {
        fn now_ns(&self) -> Option<u64> {
            self.inner.now_ns()
        }

        fn yield_now(&self) {
            self.inner.yield_now();
            if let Some(hook) = self.hook.borrow().as_ref() {
                hook();
            }
        }
    }

    #[test]
    fn session_is_busy_while_the_reply_is_pending() {
        let hook: YieldHook = Rc::new(RefCell::new(None));
        let clock = HookedClock { inner: TestClock::stepping(1_000), hook: Rc::clone(&hook) };
        let (session, peer) = session_with_peer(Box::new(clock));
        let session = Rc::new(session);
        let seen: Rc<RefCell<Vec<(bool, Result<Response>)>>> = Rc::default();

        let weak = Rc::downgrade(&session);
        let log = Rc::clone(&seen);
        *hook.borrow_mut() = Some(Box::new(move || {
            let Some(session) = weak.upgrade() else { return };
            if let Ok((request, _)) = peer.recv() {
                let nested = session.call(opcode::NUMBER, &[2]);
                log.borrow_mut().push((session.can_send(), nested));
                reply(&peer, &[MsgHeader::ack(opcode::NUMBER).to_word(), request.word(1) + 1]);
            }
        }));

        let response = session.call(opcode::NUMBER, &[41]).unwrap();
        assert_eq!(response.arg(0), 42);
        assert!(session.can_send());
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].0);
        assert_eq!(seen[0].1.as_ref().map(|r| r.arg(0)), Err(&RpcError::Busy));
        hook.borrow_mut().take();
    }

    #[test]
    fn timeout_leaves_session_busy() {
        let (session, _peer) = session_with_peer(Box::new(TestClock::stepping(1_000_000)));
        assert_eq!(session.call(opcode::NUMBER, &[1]).unwrap_err(), RpcError::Timeout);
        assert!(!session.can_send());
        assert_eq!(session.call(opcode::NUMBER, &[2]).unwrap_err(), RpcError::Busy);
    }

    #[test]
    fn bulk_send_requires_buffer() {
        let (session, _peer) = session_with_peer(Box::new(HostClock::new()));
        assert_eq!(
            session.send_payload(opcode::STRING, b"x", &[], None).unwrap_err(),
            RpcError::NoSharedBuffer
        );
    }

    #[test]
    fn inline_payload_is_chunked() {
        let (session, peer) = session_with_peer(Box::new(HostClock::new()));
        reply(&peer, &[MsgHeader::ack(opcode::STRING).to_word()]);
        reply(&peer, &[MsgHeader::ack(opcode::STRING).to_word()]);
        let payload: Vec<u8> = (0..INLINE_BYTES as u8 + 4).collect();
        session.send_inline(opcode::STRING, &payload).unwrap();

        let (first, _) = peer.recv().unwrap();
        let (second, _) = peer.recv().unwrap();
        let first_header = MsgHeader::from_word(first.word(0)).unwrap();
        let second_header = MsgHeader::from_word(second.word(0)).unwrap();
        assert!(first_header.is_incomplete());
        assert!(!second_header.is_incomplete());
        assert_eq!(first.word(1), payload.len());
        let mut got = unpack_inline(&first.words()[2..], INLINE_BYTES);
        got.extend(unpack_inline(&second.words()[2..], 4));
        assert_eq!(got, payload);
    }

    #[test]
    fn pack_unpack_keeps_partial_words() {
        let bytes = b"milan\0";
        let words = pack_inline(bytes);
        assert_eq!(words.len(), 1);
        assert_eq!(unpack_inline(&words, bytes.len()), bytes);
    }

    proptest! {
        #[test]
        fn inline_chunks_reassemble(payload in prop::collection::vec(any::<u8>(), 0..200)) {
            let (session, peer) = session_with_peer(Box::new(HostClock::new()));
            let chunks = payload.len().div_ceil(INLINE_BYTES).max(1);
            for _ in 0..chunks {
                reply(&peer, &[MsgHeader::ack(opcode::STRING).to_word()]);
            }
            session.send_inline(opcode::STRING, &payload).unwrap();

            let mut got = Vec::new();
            for index in 0..chunks {
                let (msg, _) = peer.recv().unwrap();
                let header = MsgHeader::from_word(msg.word(0)).unwrap();
                prop_assert_eq!(header.is_incomplete(), index + 1 < chunks);
                prop_assert_eq!(msg.word(1), payload.len());
                let take = (payload.len() - got.len()).min(INLINE_BYTES);
                got.extend(unpack_inline(&msg.words()[INLINE_FIRST_WORD..], take));
            }
            prop_assert_eq!(got, payload);
            prop_assert!(session.can_send());
        }
    }
}
