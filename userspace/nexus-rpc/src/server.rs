// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Server role of the RPC runtime: listening endpoint, per-client sessions, accept loop
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - RpcServer::new(): listening endpoint with an armed capability slot
//!   - RpcServer::serve_once() / serve(): dispatch ready channels once / until stopped
//!   - RpcServer::spawn() -> ServerHandle: run the loop on its own thread
//!
//! INVARIANTS:
//!   - Every received capability consumed the channel's slot; the slot is re-armed right away
//!   - Every session channel has exactly one receive registration while it is alive
//!   - SHARED_BUFFER_REQUEST and INCOMPLETE chunks are handled by the runtime, not the registry
//!
//! A session whose reply cannot be delivered is dropped (its buffer is unmapped and destroyed).

use core::cell::RefCell;
use core::time::Duration;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};
use nexus_abi::{
    Capability, EndpointCap, LmpChannel, LmpError, LmpMessage, MsgHeader, WaitSet, LMP_MSG_WORDS,
    OPCODE_MASK,
};
use nexus_vm::PagingState;

use crate::budget::{retry_budgeted, Clock, HostClock};
use crate::buffer::SharedBuffer;
use crate::handler::{HandlerRegistry, Reply, Request};
use crate::session::{unpack_inline, INLINE_BYTES, INLINE_FIRST_WORD};
use crate::{opcode, ErrorCode, Result, RpcConfig, RpcError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Listener,
    Session(u64),
}

struct ServerSession {
    chan: LmpChannel,
    buffer: Option<SharedBuffer>,
    inline: Vec<u8>,
}

/// Sends `msg` within `budget`, waiting for the peer to re-arm its slot when `cap` is set.
fn send_budgeted(
    clock: &dyn Clock,
    budget: Duration,
    chan: &LmpChannel,
    msg: &LmpMessage,
    cap: Option<Capability>,
) -> Result<()> {
    retry_budgeted(clock, budget, || match chan.send(msg, cap.clone()) {
        Err(LmpError::NoRecvSlot) => Err(RpcError::WouldBlock),
        other => other.map_err(RpcError::from),
    })
}

fn reply(
    clock: &dyn Clock,
    budget: Duration,
    chan: &LmpChannel,
    words: &[usize],
    cap: Option<Capability>,
) -> Result<()> {
    send_budgeted(clock, budget, chan, &LmpMessage::new(words)?, cap)
}

/// RPC server bound to one execution context.
pub struct RpcServer {
    listener: LmpChannel,
    registry: HandlerRegistry,
    paging: Arc<PagingState>,
    config: RpcConfig,
    clock: Box<dyn Clock>,
    ws: WaitSet,
    ready: Rc<RefCell<Vec<Source>>>,
    sessions: BTreeMap<u64, ServerSession>,
    next_session: u64,
}

impl RpcServer {
    /// Creates a server with a fresh listening endpoint.
    pub fn new(paging: Arc<PagingState>, config: RpcConfig, registry: HandlerRegistry) -> Self {
        let listener = LmpChannel::new(config.endpoint_depth);
        Self::with_listener(listener, paging, config, registry, Box::new(HostClock::new()))
    }

    /// Creates a server around an existing listening channel.
    pub fn with_listener(
        listener: LmpChannel,
        paging: Arc<PagingState>,
        config: RpcConfig,
        registry: HandlerRegistry,
        clock: Box<dyn Clock>,
    ) -> Self {
        listener.alloc_recv_slot();
        let server = Self {
            listener,
            registry,
            paging,
            config,
            clock,
            ws: WaitSet::new(),
            ready: Rc::new(RefCell::new(Vec::new())),
            sessions: BTreeMap::new(),
            next_session: 1,
        };
        server.arm(Source::Listener);
        info!("rpc: listening on {:?}", server.listener.local_cap());
        server
    }

    /// Capability clients connect to.
    pub fn listen_cap(&self) -> EndpointCap {
        self.listener.local_cap()
    }

    /// Number of live client sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Dispatch table, for registering handlers after construction.
    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    fn arm(&self, source: Source) {
        let chan = match source {
            Source::Listener => &self.listener,
            Source::Session(id) => match self.sessions.get(&id) {
                Some(session) => &session.chan,
                None => return,
            },
        };
        let ready = Rc::clone(&self.ready);
        self.ws.register_recv(chan, move || ready.borrow_mut().push(source));
    }

    /// Runs one dispatch round; returns the number of messages handled.
    pub fn serve_once(&mut self) -> usize {
        self.ws.dispatch_once();
        let ready: Vec<Source> = self.ready.borrow_mut().drain(..).collect();
        let mut handled = 0;
        for source in ready {
            let progressed = match source {
                Source::Listener => self.accept(),
                Source::Session(id) => self.handle_session(id),
            };
            if progressed {
                handled += 1;
            }
        }
        handled
    }

    /// Serves until `stop` is set.
    pub fn serve(&mut self, stop: &AtomicBool) {
        info!("rpc: server loop started");
        while !stop.load(Ordering::Acquire) {
            if self.serve_once() == 0 {
                self.clock.yield_now();
            }
        }
        info!("rpc: server loop stopped ({} sessions)", self.sessions.len());
    }

    /// Runs a server on its own thread.
    pub fn spawn(
        paging: Arc<PagingState>,
        config: RpcConfig,
        registry: HandlerRegistry,
    ) -> Result<ServerHandle> {
        let listener = LmpChannel::new(config.endpoint_depth);
        let endpoint = listener.local_cap();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("rpc-server".to_string())
            .spawn(move || {
                let clock = Box::new(HostClock::new());
                let mut server =
                    RpcServer::with_listener(listener, paging, config, registry, clock);
                server.serve(&flag);
            })
            .map_err(|err| RpcError::Thread(err.to_string()))?;
        Ok(ServerHandle { endpoint, stop, join: Some(join) })
    }

    fn accept(&mut self) -> bool {
        let (msg, cap) = match self.listener.recv() {
            Ok(delivery) => delivery,
            Err(err) => {
                if err != LmpError::Transient {
                    warn!("rpc: listener receive failed: {}", err);
                }
                self.arm(Source::Listener);
                return false;
            }
        };
        self.listener.alloc_recv_slot();
        self.arm(Source::Listener);

        let is_handshake = MsgHeader::from_word(msg.word(0))
            .map(|header| header.opcode == opcode::HANDSHAKE)
            .unwrap_or(false);
        let Some(client) = cap.and_then(Capability::into_endpoint).filter(|_| is_handshake) else {
            warn!("rpc: listener dropped a message that is not a handshake");
            return true;
        };

        let chan = LmpChannel::accept(self.config.endpoint_depth, &client);
        chan.alloc_recv_slot();
        let reply = LmpMessage::new(&[MsgHeader::ack(opcode::HANDSHAKE).to_word()]);
        let sent = reply.map_err(RpcError::from).and_then(|reply| {
            let own = Some(Capability::Endpoint(chan.local_cap()));
            send_budgeted(&*self.clock, self.config.send_budget, &chan, &reply, own)
        });
        if let Err(err) = sent {
            warn!("rpc: handshake with {:?} failed: {}", client, err);
            return true;
        }

        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(id, ServerSession { chan, buffer: None, inline: Vec::new() });
        self.arm(Source::Session(id));
        info!("rpc: session {} accepted from {:?}", id, client);
        true
    }

    fn handle_session(&mut self, id: u64) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };
        let (msg, cap) = match session.chan.recv() {
            Ok(delivery) => delivery,
            Err(LmpError::Transient) => {
                self.arm(Source::Session(id));
                return false;
            }
            Err(err) => {
                warn!("rpc: session {} receive failed: {}", id, err);
                self.sessions.remove(&id);
                return false;
            }
        };
        if cap.is_some() {
            session.chan.alloc_recv_slot();
        }
        match self.process(id, msg, cap) {
            Ok(()) => self.arm(Source::Session(id)),
            Err(err) => {
                warn!("rpc: dropping session {}: {}", id, err);
                self.sessions.remove(&id);
            }
        }
        true
    }

    fn process(&mut self, id: u64, msg: LmpMessage, cap: Option<Capability>) -> Result<()> {
        let Self { registry, paging, config, clock, sessions, .. } = self;
        let Some(session) = sessions.get_mut(&id) else {
            return Ok(());
        };
        let clock: &dyn Clock = &**clock;
        let budget = config.send_budget;

        let raw_opcode = (msg.word(0) & OPCODE_MASK) as u8;
        let Ok(header) = MsgHeader::from_word(msg.word(0)) else {
            warn!("rpc: session {} sent undefined header flags {:#x}", id, msg.word(0));
            let words = [MsgHeader::error(raw_opcode).to_word(), ErrorCode::Malformed.to_word()];
            return reply(clock, budget, &session.chan, &words, None);
        };
        debug!("rpc: session {} <- {} {:?}", id, opcode::name(header.opcode), header.flags);

        if header.opcode == opcode::SHARED_BUFFER_REQUEST {
            session.buffer = None;
            return match SharedBuffer::allocate(paging, msg.word(1)) {
                Ok(buffer) => {
                    let frame = Capability::Frame(buffer.frame().clone());
                    let words = [MsgHeader::ack(header.opcode).to_word(), buffer.capacity()];
                    session.buffer = Some(buffer);
                    reply(clock, budget, &session.chan, &words, Some(frame))
                }
                Err(err) => {
                    warn!("rpc: session {} shared buffer of {} bytes: {}", id, msg.word(1), err);
                    let words = [MsgHeader::error(header.opcode).to_word(), err.code().to_word()];
                    reply(clock, budget, &session.chan, &words, None)
                }
            };
        }

        if header.is_incomplete() {
            let total = msg.word(1);
            let take = total.saturating_sub(session.inline.len()).min(INLINE_BYTES);
            let words = msg.words().get(INLINE_FIRST_WORD..).unwrap_or(&[]);
            session.inline.extend(unpack_inline(words, take));
            let ack = [MsgHeader::ack(header.opcode).to_word()];
            return reply(clock, budget, &session.chan, &ack, None);
        }

        let inline = core::mem::take(&mut session.inline);
        let result = match registry.lookup(header.opcode) {
            Some((handler, auto_ack)) => {
                let mut request = Request::new(header, msg, cap, &inline, session.buffer.as_ref());
                handler.handle(&mut request).map(|outcome| (outcome, auto_ack))
            }
            None => {
                warn!("rpc: session {} sent unknown opcode {}", id, header.opcode);
                Err(RpcError::Rejected(ErrorCode::UnknownOpcode))
            }
        };

        let (words, reply_cap) = match result {
            Ok((Reply::Done, true)) => (vec![MsgHeader::ack(header.opcode).to_word()], None),
            Ok((Reply::Done, false)) | Ok((Reply::NoReply, _)) => return Ok(()),
            Ok((Reply::Message { opcode: reply_opcode, words, cap }, _)) => {
                let mut out = Vec::with_capacity(words.len() + 1);
                out.push(MsgHeader::ack(reply_opcode).to_word());
                out.extend(words);
                (out, cap)
            }
            Err(err) => {
                debug!("rpc: {} failed: {}", opcode::name(header.opcode), err);
                (vec![MsgHeader::error(header.opcode).to_word(), err.code().to_word()], None)
            }
        };
        if words.len() > LMP_MSG_WORDS {
            warn!("rpc: reply to {} has {} words", opcode::name(header.opcode), words.len());
            let words = [MsgHeader::error(header.opcode).to_word(), ErrorCode::Internal.to_word()];
            return reply(clock, budget, &session.chan, &words, None);
        }
        reply(clock, budget, &session.chan, &words, reply_cap)
    }
}

impl core::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcServer")
            .field("listener", &self.listener)
            .field("handlers", &self.registry.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

/// Server running on its own thread; dropping the handle stops and joins it.
pub struct ServerHandle {
    endpoint: EndpointCap,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Listening endpoint of the server.
    pub fn endpoint(&self) -> EndpointCap {
        self.endpoint.clone()
    }

    /// Stops the loop and waits for the thread.
    pub fn stop_and_join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("rpc: server thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
