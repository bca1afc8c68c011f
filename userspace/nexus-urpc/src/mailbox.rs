// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single-slot polling mailbox in shared memory.
//!
//! Layout (byte offsets from the mailbox base):
//!   - 0:  status (u32)
//!   - 8:  data_len (u64)
//!   - 16: opcode (u32)
//!   - 24: data
//!
//! The role is fixed at construction: the client writes requests and consumes replies, the
//! server consumes requests and answers them. The alternating status word is the only
//! synchronization; it is stored after a release fence and read before an acquire fence.

use core::sync::atomic::{fence, Ordering};
use core::time::Duration;

use log::debug;
use nexus_abi::Frame;
use nexus_rpc::budget::{retry_budgeted, Clock};
use nexus_rpc::{ErrorCode, RpcError};

use crate::{Result, UrpcError};

const STATUS_OFFSET: usize = 0;
const LEN_OFFSET: usize = 8;
const OPCODE_OFFSET: usize = 16;
/// Bytes in front of the payload.
pub const HEADER_BYTES: usize = 24;
const CODE_BYTES: usize = core::mem::size_of::<u64>();

/// Mailbox state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Empty; the client may send.
    NoData = 0,
    /// A request is waiting for the server.
    ClientSent = 1,
    /// The server answered with data.
    ServerReplied = 2,
    /// The server answered with an error code.
    ServerRepliedError = 3,
}

impl Status {
    fn from_word(word: u32) -> Option<Self> {
        match word {
            0 => Some(Self::NoData),
            1 => Some(Self::ClientSent),
            2 => Some(Self::ServerReplied),
            3 => Some(Self::ServerRepliedError),
            _ => None,
        }
    }
}

/// Side of the mailbox an endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends requests, consumes replies.
    Client,
    /// Consumes requests, answers them.
    Server,
}

/// Opcode plus payload read out of a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Operation selector.
    pub opcode: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// One endpoint's view of a mailbox.
pub struct UrpcBuffer {
    frame: Frame,
    base: usize,
    size: usize,
    role: Role,
    clock: Box<dyn Clock + Send>,
    budget: Duration,
    staged: usize,
}

impl UrpcBuffer {
    /// Views `[base, base + size)` of `frame` as a mailbox.
    pub fn new(
        frame: Frame,
        base: usize,
        size: usize,
        role: Role,
        clock: Box<dyn Clock + Send>,
        budget: Duration,
    ) -> Result<Self> {
        if base % CODE_BYTES != 0 {
            return Err(UrpcError::Malformed("mailbox base must be 8-byte aligned"));
        }
        if size <= HEADER_BYTES {
            return Err(UrpcError::Malformed("mailbox smaller than its header"));
        }
        if base.checked_add(size).filter(|end| *end <= frame.size()).is_none() {
            return Err(UrpcError::Malformed("mailbox outside its frame"));
        }
        Ok(Self { frame, base, size, role, clock, budget, staged: 0 })
    }

    /// Resets the header to an empty mailbox; done once by the side that created the frame.
    pub fn init(&self) -> Result<()> {
        let mem = self.frame.memory();
        mem.fill_zero(self.base, HEADER_BYTES)?;
        self.store_status(Status::NoData)
    }

    /// Role fixed at construction.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.size - HEADER_BYTES
    }

    /// Current status.
    pub fn status(&self) -> Result<Status> {
        let word = self.frame.memory().load_u32(self.base + STATUS_OFFSET, Ordering::Relaxed)?;
        fence(Ordering::Acquire);
        Status::from_word(word).ok_or(UrpcError::UnknownStatus(word))
    }

    fn store_status(&self, status: Status) -> Result<()> {
        fence(Ordering::Release);
        let mem = self.frame.memory();
        mem.store_u32(self.base + STATUS_OFFSET, status as u32, Ordering::Relaxed)?;
        Ok(())
    }

    fn expect_role(&self, role: Role) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(UrpcError::WrongRole(self.role))
        }
    }

    fn expect_status(&self, expected: Status) -> Result<()> {
        match self.status()? {
            found if found == expected => Ok(()),
            found => Err(UrpcError::WrongStatus { expected, found }),
        }
    }

    fn write_payload(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.saturating_add(data.len());
        if end > self.capacity() {
            return Err(UrpcError::BufferTooSmall { len: end, capacity: self.capacity() });
        }
        self.frame.memory().write_bytes(self.base + HEADER_BYTES + offset, data)?;
        Ok(())
    }

    fn write_header(&self, opcode: u32, len: usize) -> Result<()> {
        let mem = self.frame.memory();
        mem.store_u64(self.base + LEN_OFFSET, len as u64)?;
        mem.store_u32(self.base + OPCODE_OFFSET, opcode, Ordering::Relaxed)?;
        Ok(())
    }

    fn read_message(&self) -> Result<Message> {
        let mem = self.frame.memory();
        let len = mem.load_u64(self.base + LEN_OFFSET)? as usize;
        if len > self.capacity() {
            return Err(UrpcError::Malformed("data_len exceeds the mailbox"));
        }
        let opcode = mem.load_u32(self.base + OPCODE_OFFSET, Ordering::Relaxed)?;
        let mut data = vec![0u8; len];
        mem.read_bytes(self.base + HEADER_BYTES, &mut data)?;
        Ok(Message { opcode, data })
    }

    /// Sends one request and polls for its reply.
    pub fn client_send_and_wait(&mut self, opcode: u32, data: &[u8]) -> Result<Message> {
        self.send_chunk(opcode, data, true, true)?;
        self.wait_reply()
    }

    /// Appends one chunk of a request; the status flips to ClientSent only on the final chunk.
    ///
    /// `first` restarts the accumulation at offset 0.
    pub fn send_chunk(&mut self, opcode: u32, data: &[u8], first: bool, last: bool) -> Result<()> {
        self.expect_role(Role::Client)?;
        self.expect_status(Status::NoData)?;
        if first {
            self.staged = 0;
        }
        self.write_payload(self.staged, data)?;
        self.staged += data.len();
        if last {
            self.write_header(opcode, self.staged)?;
            self.store_status(Status::ClientSent)?;
            debug!("urpc: sent opcode {} ({} bytes)", opcode, self.staged);
            self.staged = 0;
        }
        Ok(())
    }

    /// Polls until the outstanding request is answered, then resets the mailbox to NoData.
    ///
    /// After a timeout the request stays outstanding; calling this again resumes the wait.
    pub fn wait_reply(&mut self) -> Result<Message> {
        self.expect_role(Role::Client)?;
        let status = retry_budgeted(&*self.clock, self.budget, || match self.status() {
            Ok(Status::ClientSent) => Err(RpcError::WouldBlock),
            other => Ok(other),
        })??;
        match status {
            Status::ServerReplied => {
                let reply = self.read_message()?;
                self.store_status(Status::NoData)?;
                Ok(reply)
            }
            Status::ServerRepliedError => {
                let code = self.frame.memory().load_u64(self.base + HEADER_BYTES)?;
                self.store_status(Status::NoData)?;
                Err(UrpcError::Remote(ErrorCode::from_word(code as usize)))
            }
            found => Err(UrpcError::WrongStatus { expected: Status::ClientSent, found }),
        }
    }

    /// Returns the pending request, if any; the status stays ClientSent until answered.
    pub fn receive_try(&self) -> Result<Option<Message>> {
        self.expect_role(Role::Server)?;
        match self.status()? {
            Status::ClientSent => self.read_message().map(Some),
            _ => Ok(None),
        }
    }

    /// Polls until a request is pending.
    pub fn receive_block(&self) -> Result<Message> {
        self.expect_role(Role::Server)?;
        retry_budgeted(&*self.clock, self.budget, || match self.receive_try() {
            Ok(None) => Err(RpcError::WouldBlock),
            other => Ok(other),
        })?
        .and_then(|request| request.ok_or(UrpcError::Malformed("request vanished")))
    }

    /// Answers the pending request with data.
    pub fn answer(&self, opcode: u32, data: &[u8]) -> Result<()> {
        self.expect_role(Role::Server)?;
        self.expect_status(Status::ClientSent)?;
        self.write_payload(0, data)?;
        self.write_header(opcode, data.len())?;
        self.store_status(Status::ServerReplied)
    }

    /// Answers the pending request with an error code.
    pub fn answer_error(&self, code: ErrorCode) -> Result<()> {
        self.expect_role(Role::Server)?;
        self.expect_status(Status::ClientSent)?;
        self.write_payload(0, &(code.to_word() as u64).to_le_bytes())?;
        self.write_header(0, CODE_BYTES)?;
        self.store_status(Status::ServerRepliedError)
    }
}

impl core::fmt::Debug for UrpcBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UrpcBuffer")
            .field("frame", &self.frame.id())
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .field("role", &self.role)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::cell::Cell;
    use nexus_abi::{HostKernel, MemoryServices};
    use nexus_rpc::HostClock;
    use proptest::prelude::*;

    /// Advances synthetic time on every yield.
    pub(crate) struct StepClock {
        now: Cell<u64>,
        step: u64,
    }

    impl StepClock {
        pub(crate) fn boxed(step: u64) -> Box<dyn Clock + Send> {
            Box::new(Self { now: Cell::new(0), step })
        }
    }

    impl Clock for StepClock {
        fn now_ns(&self) -> Option<u64> {
            Some(self.now.get())
        }

        fn yield_now(&self) {
            self.now.set(self.now.get() + self.step);
        }
    }

    fn pair(size: usize) -> (UrpcBuffer, UrpcBuffer) {
        let frame = HostKernel::default().frame_alloc(size).unwrap();
        let budget = Duration::from_millis(10);
        let step = StepClock::boxed(1_000_000);
        let client = UrpcBuffer::new(frame.clone(), 0, size, Role::Client, step, budget).unwrap();
        let host = Box::new(HostClock::new());
        let server = UrpcBuffer::new(frame, 0, size, Role::Server, host, budget).unwrap();
        client.init().unwrap();
        (client, server)
    }

    #[test]
    fn status_alternates_through_one_exchange() {
        let (mut client, server) = pair(4096);
        assert_eq!(server.receive_try().unwrap(), None);
        client.send_chunk(7, b"milan\0", true, true).unwrap();
        assert_eq!(client.status().unwrap(), Status::ClientSent);

        let request = server.receive_try().unwrap().unwrap();
        assert_eq!(request, Message { opcode: 7, data: b"milan\0".to_vec() });
        assert_eq!(server.status().unwrap(), Status::ClientSent);
        server.answer(7, b"ok").unwrap();
        assert_eq!(server.status().unwrap(), Status::ServerReplied);

        assert_eq!(client.wait_reply().unwrap().data, b"ok");
        assert_eq!(client.status().unwrap(), Status::NoData);
    }

    #[test]
    fn second_send_before_reply_is_fatal() {
        let (mut client, _server) = pair(4096);
        client.send_chunk(1, b"a", true, true).unwrap();
        let err = client.send_chunk(1, b"b", true, true).unwrap_err();
        assert!(err.is_fatal());
        let expected =
            UrpcError::WrongStatus { expected: Status::NoData, found: Status::ClientSent };
        assert_eq!(err, expected);
    }

    #[test]
    fn error_answer_surfaces_remote_code() {
        let (mut client, server) = pair(4096);
        client.send_chunk(3, &[], true, true).unwrap();
        server.answer_error(ErrorCode::UnknownOpcode).unwrap();
        assert_eq!(client.wait_reply().unwrap_err(), UrpcError::Remote(ErrorCode::UnknownOpcode));
        assert_eq!(client.status().unwrap(), Status::NoData);
    }

    #[test]
    fn chunks_accumulate_until_final() {
        let (mut client, server) = pair(4096);
        client.send_chunk(9, b"head:", true, false).unwrap();
        assert_eq!(server.receive_try().unwrap(), None);
        client.send_chunk(9, b"body", false, true).unwrap();
        assert_eq!(server.receive_block().unwrap().data, b"head:body");
    }

    #[test]
    fn oversized_payload_is_recoverable() {
        let (mut client, server) = pair(4096);
        let big = vec![0u8; 4096];
        let err = client.client_send_and_wait(1, &big).unwrap_err();
        assert_eq!(err, UrpcError::BufferTooSmall { len: 4096, capacity: 4096 - HEADER_BYTES });
        assert!(!err.is_fatal());
        assert_eq!(client.status().unwrap(), Status::NoData);

        client.send_chunk(1, b"x", true, true).unwrap();
        assert!(matches!(server.answer(1, &big), Err(UrpcError::BufferTooSmall { .. })));
        server.answer_error(ErrorCode::PayloadTooLarge).unwrap();
    }

    #[test]
    fn reply_wait_times_out_and_can_resume() {
        let (mut client, server) = pair(4096);
        client.send_chunk(2, b"?", true, true).unwrap();
        assert_eq!(client.wait_reply().unwrap_err(), UrpcError::Timeout);
        server.answer(2, b"late").unwrap();
        assert_eq!(client.wait_reply().unwrap().data, b"late");
    }

    #[test]
    fn roles_are_enforced() {
        let (client, mut server) = pair(4096);
        assert_eq!(client.receive_try().unwrap_err(), UrpcError::WrongRole(Role::Client));
        assert_eq!(client.answer(1, &[]).unwrap_err(), UrpcError::WrongRole(Role::Client));
        let err = server.send_chunk(1, &[], true, true).unwrap_err();
        assert_eq!(err, UrpcError::WrongRole(Role::Server));
    }

    #[test]
    fn layout_is_validated() {
        let frame = HostKernel::default().frame_alloc(4096).unwrap();
        let clock = || Box::new(HostClock::new()) as Box<dyn Clock + Send>;
        let budget = Duration::from_millis(1);
        assert!(UrpcBuffer::new(frame.clone(), 4, 64, Role::Client, clock(), budget).is_err());
        assert!(UrpcBuffer::new(frame.clone(), 0, 24, Role::Client, clock(), budget).is_err());
        assert!(UrpcBuffer::new(frame, 2048, 4096, Role::Client, clock(), budget).is_err());
    }

    proptest! {
        #[test]
        fn status_cycles_for_any_trace(
            trace in prop::collection::vec((0usize..300, any::<bool>()), 1..32)
        ) {
            let (mut client, server) = pair(256);
            for (len, fail) in trace {
                prop_assert_eq!(client.status().unwrap(), Status::NoData);
                let sent = client.send_chunk(5, &vec![0xa5; len], true, true);
                if len > client.capacity() {
                    let is_too_small = matches!(sent, Err(UrpcError::BufferTooSmall { .. }));
                    prop_assert!(is_too_small);
                    continue;
                }
                prop_assert_eq!(client.status().unwrap(), Status::ClientSent);
                let request = server.receive_try().unwrap().unwrap();
                prop_assert_eq!(request.data.len(), len);
                if fail {
                    server.answer_error(ErrorCode::Internal).unwrap();
                    prop_assert_eq!(client.status().unwrap(), Status::ServerRepliedError);
                    prop_assert!(client.wait_reply().is_err());
                } else {
                    server.answer(5, &request.data).unwrap();
                    prop_assert_eq!(client.status().unwrap(), Status::ServerReplied);
                    prop_assert_eq!(client.wait_reply().unwrap().data, request.data);
                }
            }
            prop_assert_eq!(client.status().unwrap(), Status::NoData);
        }
    }
}
