// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Full-duplex URPC channel over one shared frame
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - UrpcChannel::create(): allocate and map the frame, initialize both mailboxes
//!   - UrpcChannel::attach(): map a frame received from the creator
//!   - UrpcChannel::bootstrap() / register_bind_handler(): hand the frame over an RPC session
//!   - UrpcClient::call(): one request on the outbound mailbox
//!   - UrpcServer::serve_once() / serve() / spawn(): answer requests on the inbound mailbox
//!
//! INVARIANTS:
//!   - The creator sends on the first half of the frame and serves the second; the peer mirrors it
//!   - serve_once answers every request it takes: data, an error code, or zero-length data
//!
//! The mapping and the frame capability are shared by both halves and released with the last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use nexus_abi::{Capability, Frame, MsgHeader};
use nexus_rpc::budget::Clock;
use nexus_rpc::{opcode, ErrorCode, HandlerRegistry, HostClock, Reply, RpcSession, SharedBuffer};
use nexus_vm::PagingState;

use crate::mailbox::{Message, Role, Status, UrpcBuffer, HEADER_BYTES};
use crate::{Result, UrpcConfig, UrpcError};

/// RPC opcode that transfers a channel frame to the peer.
pub const URPC_BIND: u8 = opcode::USER_BASE;

/// Server-side operation bound to one URPC opcode.
pub trait UrpcHandler: Send {
    /// Handles `request`; `Ok(None)` declines and produces a zero-length answer.
    fn handle(&self, request: &Message) -> Result<Option<Vec<u8>>>;
}

struct FnHandler<F>(F);

impl<F> UrpcHandler for FnHandler<F>
where
    F: Fn(&Message) -> Result<Option<Vec<u8>>> + Send,
{
    fn handle(&self, request: &Message) -> Result<Option<Vec<u8>>> {
        (self.0)(request)
    }
}

fn host_clock() -> Box<dyn Clock + Send> {
    Box::new(HostClock::new())
}

/// Both halves of a channel.
pub struct UrpcChannel {
    client: UrpcClient,
    server: UrpcServer,
}

impl UrpcChannel {
    /// Allocates a frame holding two mailboxes and maps it into `paging`.
    pub fn create(paging: &Arc<PagingState>, config: UrpcConfig) -> Result<Self> {
        let mapping = SharedBuffer::allocate(paging, 2 * config.mailbox_size)?;
        let channel = Self::build(mapping, config, true)?;
        channel.client.mailbox.init()?;
        channel.server.mailbox.init()?;
        info!("urpc: created channel on {}", channel.frame().id());
        Ok(channel)
    }

    /// Maps a frame created by the peer.
    pub fn attach(paging: &Arc<PagingState>, frame: Frame, config: UrpcConfig) -> Result<Self> {
        let mapping = SharedBuffer::adopt(paging, frame)?;
        let channel = Self::build(mapping, config, false)?;
        info!("urpc: attached to channel on {}", channel.frame().id());
        Ok(channel)
    }

    fn build(mapping: SharedBuffer, config: UrpcConfig, creator: bool) -> Result<Self> {
        let half = mapping.capacity() / 2;
        if half < config.mailbox_size {
            return Err(UrpcError::Malformed("channel frame smaller than two mailboxes"));
        }
        let (send_base, recv_base) = if creator { (0, half) } else { (half, 0) };
        let frame = mapping.frame().clone();
        let budget = config.reply_budget;
        let outbound =
            UrpcBuffer::new(frame.clone(), send_base, half, Role::Client, host_clock(), budget)?;
        let inbound = UrpcBuffer::new(frame, recv_base, half, Role::Server, host_clock(), budget)?;
        let mapping = Arc::new(mapping);
        Ok(Self {
            client: UrpcClient { mailbox: outbound, mapping: Arc::clone(&mapping) },
            server: UrpcServer {
                mailbox: inbound,
                handlers: (0..config.handler_slots).map(|_| None).collect(),
                _mapping: mapping,
            },
        })
    }

    /// Creates a channel and hands its frame to the peer of `session`.
    pub fn bootstrap(session: &RpcSession, config: UrpcConfig) -> Result<Self> {
        let channel = Self::create(session.paging(), config)?;
        let cap = Some(Capability::Frame(channel.frame().clone()));
        let header = MsgHeader::request(URPC_BIND);
        session.wrapper_send(header, &[config.mailbox_size], cap, true)?;
        Ok(channel)
    }

    /// Frame capability shared with the peer.
    pub fn frame(&self) -> &Frame {
        self.client.mailbox_frame()
    }

    /// Outbound half.
    pub fn client(&mut self) -> &mut UrpcClient {
        &mut self.client
    }

    /// Inbound half.
    pub fn server(&mut self) -> &mut UrpcServer {
        &mut self.server
    }

    /// Separates the halves so the server can run on its own thread.
    pub fn split(self) -> (UrpcClient, UrpcServer) {
        (self.client, self.server)
    }
}

/// Registers the RPC handler that accepts channel frames sent by [`UrpcChannel::bootstrap`].
///
/// `on_bind` receives every attached channel (typically to register handlers and spawn the
/// server half).
pub fn register_bind_handler<F>(
    registry: &mut HandlerRegistry,
    paging: Arc<PagingState>,
    config: UrpcConfig,
    on_bind: F,
) -> nexus_rpc::Result<()>
where
    F: Fn(UrpcChannel) + Send + 'static,
{
    registry.register_fn(
        URPC_BIND,
        move |req| {
            let frame = req
                .take_cap()
                .and_then(Capability::into_frame)
                .ok_or(nexus_rpc::RpcError::Malformed("bind without a frame capability"))?;
            let config = config.with_mailbox_size(req.arg(0));
            match UrpcChannel::attach(&paging, frame, config) {
                Ok(channel) => {
                    on_bind(channel);
                    Ok(Reply::Done)
                }
                Err(err) => {
                    warn!("urpc: bind failed: {}", err);
                    Err(nexus_rpc::RpcError::Rejected(err.code()))
                }
            }
        },
        true,
    )
}

/// Sending half: owns the outbound mailbox.
pub struct UrpcClient {
    mailbox: UrpcBuffer,
    mapping: Arc<SharedBuffer>,
}

impl UrpcClient {
    fn mailbox_frame(&self) -> &Frame {
        self.mapping.frame()
    }

    /// Sends one request and waits for its answer.
    pub fn call(&mut self, opcode: u32, data: &[u8]) -> Result<Message> {
        self.mailbox.client_send_and_wait(opcode, data)
    }

    /// Appends one chunk of a request (see [`UrpcBuffer::send_chunk`]).
    pub fn send_chunk(&mut self, opcode: u32, data: &[u8], first: bool, last: bool) -> Result<()> {
        self.mailbox.send_chunk(opcode, data, first, last)
    }

    /// Waits for the answer to a request sent in chunks.
    pub fn wait_reply(&mut self) -> Result<Message> {
        self.mailbox.wait_reply()
    }

    /// Outbound mailbox.
    pub fn mailbox(&self) -> &UrpcBuffer {
        &self.mailbox
    }
}

/// Serving half: owns the inbound mailbox and the handler table.
pub struct UrpcServer {
    mailbox: UrpcBuffer,
    handlers: Vec<Option<Box<dyn UrpcHandler>>>,
    _mapping: Arc<SharedBuffer>,
}

impl UrpcServer {
    /// Binds `handler` to `opcode`; 0 and opcodes beyond the table are rejected.
    pub fn register(&mut self, opcode: u32, handler: impl UrpcHandler + 'static) -> Result<()> {
        match self.handlers.get_mut(opcode as usize) {
            Some(slot) if opcode != 0 => {
                if slot.is_some() {
                    info!("urpc: replacing handler for opcode {}", opcode);
                }
                *slot = Some(Box::new(handler));
                Ok(())
            }
            _ => Err(UrpcError::InvalidOpcode(opcode)),
        }
    }

    /// Binds a closure to `opcode`.
    pub fn register_fn<F>(&mut self, opcode: u32, handler: F) -> Result<()>
    where
        F: Fn(&Message) -> Result<Option<Vec<u8>>> + Send + 'static,
    {
        self.register(opcode, FnHandler(handler))
    }

    /// Inbound mailbox.
    pub fn mailbox(&self) -> &UrpcBuffer {
        &self.mailbox
    }

    /// Answers at most one pending request; returns true if one was handled.
    ///
    /// A pending request is always answered: a header that cannot be read gets a Malformed error
    /// answer and handler failures become error answers. Only faults of this mailbox itself
    /// (wrong role, unreadable status, a status that moved under us) are returned as errors.
    pub fn serve_once(&self) -> Result<bool> {
        let request = match self.mailbox.receive_try() {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(false),
            Err(err) if self.mailbox.status() == Ok(Status::ClientSent) => {
                warn!("urpc: unreadable request: {}", err);
                self.mailbox.answer_error(ErrorCode::Malformed)?;
                return Ok(true);
            }
            Err(err) => return Err(err),
        };
        debug!("urpc: request opcode {} ({} bytes)", request.opcode, request.data.len());
        let handler = self.handlers.get(request.opcode as usize).and_then(Option::as_ref);
        let outcome = match handler {
            Some(handler) => handler.handle(&request),
            None => {
                warn!("urpc: no handler for opcode {}", request.opcode);
                Err(UrpcError::InvalidOpcode(request.opcode))
            }
        };
        match outcome {
            Ok(Some(data)) => match self.mailbox.answer(request.opcode, &data) {
                Err(UrpcError::BufferTooSmall { len, capacity }) => {
                    warn!("urpc: answer of {} bytes exceeds {} bytes", len, capacity);
                    self.mailbox.answer_error(ErrorCode::PayloadTooLarge)?;
                }
                other => other?,
            },
            Ok(None) => {
                warn!("urpc: handler for opcode {} declined; sending empty answer", request.opcode);
                self.mailbox.answer(request.opcode, &[])?;
            }
            Err(err) if err.is_fatal() => {
                warn!("urpc: opcode {} handler hit a protocol fault: {}", request.opcode, err);
                self.mailbox.answer_error(err.code())?;
            }
            Err(err) => {
                debug!("urpc: opcode {} failed: {}", request.opcode, err);
                self.mailbox.answer_error(err.code())?;
            }
        }
        Ok(true)
    }

    /// Serves until `stop` is set or a protocol violation occurs.
    pub fn serve(&self, stop: &AtomicBool) -> Result<()> {
        info!("urpc: server loop started (capacity {} bytes)", self.mailbox.capacity());
        while !stop.load(Ordering::Acquire) {
            match self.serve_once() {
                Ok(true) => {}
                Ok(false) => std::thread::yield_now(),
                Err(err) => {
                    error!("urpc: server loop aborted: {}", err);
                    return Err(err);
                }
            }
        }
        info!("urpc: server loop stopped");
        Ok(())
    }

    /// Runs [`UrpcServer::serve`] on its own thread.
    pub fn spawn(self) -> Result<UrpcServerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("urpc-server".to_string())
            .spawn(move || self.serve(&flag))
            .map_err(|err| UrpcError::Thread(err.to_string()))?;
        Ok(UrpcServerHandle { stop, join: Some(join) })
    }
}

/// Server half running on its own thread; dropping the handle stops and joins it.
pub struct UrpcServerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<Result<()>>>,
}

impl UrpcServerHandle {
    /// Stops the loop and returns how it ended.
    pub fn stop_and_join(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        match self.join.take() {
            Some(join) => join.join().map_err(|_| UrpcError::Thread("server panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for UrpcServerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("urpc: server ended with {}", err);
        }
    }
}

/// Payload capacity of a mailbox of `size` bytes.
pub const fn mailbox_capacity(size: usize) -> usize {
    size.saturating_sub(HEADER_BYTES)
}
