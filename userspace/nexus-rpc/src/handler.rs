// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Opcode -> handler dispatch table of an RPC server
//! OWNERS: @runtime
//!
//! A handler sees the decoded request (header, argument words, optional capability, payload)
//! and returns a [`Reply`]. `Reply::Done` lets the server send the automatic ACK when the slot
//! was registered with `auto_ack`; handlers that return data or a capability build an explicit
//! [`Reply::Message`].

use log::info;
use nexus_abi::{Capability, LmpMessage, MsgHeader};
use nexus_marshal::{unserialize_string, unserialize_string_array};

use crate::buffer::SharedBuffer;
use crate::session::{unpack_inline, INLINE_BYTES, INLINE_FIRST_WORD};
use crate::{opcode, Result, RpcError};

const SLOTS: usize = 256;

/// What the server sends after a handler returned successfully.
#[derive(Debug)]
pub enum Reply {
    /// Nothing beyond the automatic ACK (if the slot has one).
    Done,
    /// Explicit ACK reply with argument words (at most 8) and an optional capability.
    Message {
        /// Opcode of the reply.
        opcode: u8,
        /// Argument words following the header.
        words: Vec<usize>,
        /// Capability sent with the reply.
        cap: Option<Capability>,
    },
    /// No reply at all.
    NoReply,
}

impl Reply {
    /// Explicit reply carrying only words.
    pub fn words(opcode: u8, words: &[usize]) -> Self {
        Self::Message { opcode, words: words.to_vec(), cap: None }
    }

    /// Explicit reply carrying words and a capability.
    pub fn with_cap(opcode: u8, words: &[usize], cap: Capability) -> Self {
        Self::Message { opcode, words: words.to_vec(), cap: Some(cap) }
    }
}

/// One decoded request as seen by a handler.
pub struct Request<'a> {
    header: MsgHeader,
    msg: LmpMessage,
    cap: Option<Capability>,
    inline: &'a [u8],
    buffer: Option<&'a SharedBuffer>,
}

impl<'a> Request<'a> {
    pub(crate) fn new(
        header: MsgHeader,
        msg: LmpMessage,
        cap: Option<Capability>,
        inline: &'a [u8],
        buffer: Option<&'a SharedBuffer>,
    ) -> Self {
        Self { header, msg, cap, inline, buffer }
    }

    /// Opcode of the request.
    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    /// Decoded header.
    pub fn header(&self) -> MsgHeader {
        self.header
    }

    /// Argument word `index` (the word after the header is index 0); 0 if absent.
    pub fn arg(&self, index: usize) -> usize {
        self.msg.word(index + 1)
    }

    /// Takes the capability sent with the request.
    pub fn take_cap(&mut self) -> Option<Capability> {
        self.cap.take()
    }

    /// Shared buffer of the session.
    pub fn buffer(&self) -> Result<&'a SharedBuffer> {
        self.buffer.ok_or(RpcError::NoSharedBuffer)
    }

    /// Raw payload: `arg(0)` bytes from the shared buffer, or the inline chunks when the session
    /// has no buffer.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let total = self.arg(0);
        if let Some(buffer) = self.buffer {
            return buffer.read(0, total);
        }
        let rest = total
            .checked_sub(self.inline.len())
            .ok_or(RpcError::Malformed("inline payload longer than announced"))?;
        let mut bytes = self.inline.to_vec();
        let words = self.msg.words().get(INLINE_FIRST_WORD..).unwrap_or(&[]);
        bytes.extend(unpack_inline(words, rest.min(INLINE_BYTES)));
        if bytes.len() != total {
            return Err(RpcError::Malformed("inline payload shorter than announced"));
        }
        Ok(bytes)
    }

    /// Payload decoded as one string.
    pub fn payload_string(&self) -> Result<String> {
        let (s, _) = unserialize_string(&self.payload()?)?;
        Ok(s)
    }

    /// Payload decoded as a string array.
    pub fn payload_strings(&self) -> Result<Vec<String>> {
        let (items, _) = unserialize_string_array(&self.payload()?)?;
        Ok(items)
    }
}

/// Server-side operation bound to one opcode.
pub trait RpcHandler: Send {
    /// Handles `request`; an `Err` is sent back as an ERROR reply with [`RpcError::code`].
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply>;
}

struct FnHandler<F>(F);

impl<F> RpcHandler for FnHandler<F>
where
    F: Fn(&mut Request<'_>) -> Result<Reply> + Send,
{
    fn handle(&self, request: &mut Request<'_>) -> Result<Reply> {
        (self.0)(request)
    }
}

struct Slot {
    handler: Box<dyn RpcHandler>,
    auto_ack: bool,
}

/// 256-slot dispatch table.
pub struct HandlerRegistry {
    slots: Vec<Option<Slot>>,
}

impl HandlerRegistry {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { slots: (0..SLOTS).map(|_| None).collect() }
    }

    /// Binds `handler` to `opcode`; a previous binding is replaced.
    pub fn register(
        &mut self,
        opcode: u8,
        handler: impl RpcHandler + 'static,
        auto_ack: bool,
    ) -> Result<()> {
        if opcode == opcode::NULL {
            return Err(RpcError::ReservedOpcode(opcode));
        }
        let slot = &mut self.slots[opcode as usize];
        if slot.is_some() {
            info!("rpc: replacing handler for {}", opcode::name(opcode));
        }
        *slot = Some(Slot { handler: Box::new(handler), auto_ack });
        Ok(())
    }

    /// Binds a closure to `opcode`.
    pub fn register_fn<F>(&mut self, opcode: u8, handler: F, auto_ack: bool) -> Result<()>
    where
        F: Fn(&mut Request<'_>) -> Result<Reply> + Send + 'static,
    {
        self.register(opcode, FnHandler(handler), auto_ack)
    }

    /// Removes the binding of `opcode`; returns true if one existed.
    pub fn unregister(&mut self, opcode: u8) -> bool {
        self.slots[opcode as usize].take().is_some()
    }

    /// Returns true if `opcode` has a handler.
    pub fn contains(&self, opcode: u8) -> bool {
        self.slots[opcode as usize].is_some()
    }

    /// Number of bound opcodes.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns true if no opcode is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lookup(&self, opcode: u8) -> Option<(&dyn RpcHandler, bool)> {
        self.slots[opcode as usize].as_ref().map(|slot| (slot.handler.as_ref(), slot.auto_ack))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
