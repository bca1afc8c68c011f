// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Typed client calls for the init services
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! Every call is one `wrapper_send` exchange. String payloads travel through the shared buffer
//! when one is negotiated; `send_string` falls back to inline chunks without one. Replies that
//! carry capabilities are checked for the response opcode before the capability is trusted.

use nexus_abi::{Capability, DeviceCap, EndpointCap, RamCap, SpecialCapKind};
use nexus_marshal::{
    serialize_size_string, serialize_size_string_array, serialize_string, serialize_string_array,
};

use crate::session::RpcSession;
use crate::{opcode, Result, RpcError};

const PID_BYTES: usize = core::mem::size_of::<u64>();

fn encode_string(s: &str) -> Vec<u8> {
    let mut encoded = vec![0u8; serialize_size_string(s)];
    let len = serialize_string(s, &mut encoded);
    encoded.truncate(len);
    encoded
}

fn encode_strings<S: AsRef<str>>(items: &[S]) -> Vec<u8> {
    let mut encoded = vec![0u8; serialize_size_string_array(items)];
    let len = serialize_string_array(items, &mut encoded);
    encoded.truncate(len);
    encoded
}

impl RpcSession {
    /// Sends one number.
    pub fn send_number(&self, number: usize) -> Result<()> {
        self.call(opcode::NUMBER, &[number])?;
        Ok(())
    }

    /// Sends one string through the shared buffer, or inline when none is negotiated.
    pub fn send_string(&self, s: &str) -> Result<()> {
        let encoded = encode_string(s);
        if self.shared_buffer().is_some() {
            self.send_payload(opcode::STRING, &encoded, &[], None)?;
        } else {
            self.send_inline(opcode::STRING, &encoded)?;
        }
        Ok(())
    }

    /// Requests untyped RAM; returns the capability and the granted size.
    pub fn get_ram_cap(&self, size: usize, align: usize) -> Result<(RamCap, usize)> {
        let reply = self.call(opcode::RAM_CAP_QUERY, &[size, align])?;
        reply.expect_opcode(opcode::RAM_CAP_RESPONSE)?;
        let granted = reply.arg(0);
        let ram = reply
            .cap
            .and_then(Capability::into_ram)
            .ok_or(RpcError::Malformed("RAM reply without a RAM capability"))?;
        Ok((ram, granted))
    }

    /// Writes one character to the serial sink.
    pub fn putchar(&self, c: u8) -> Result<()> {
        self.call(opcode::PUT_CHAR, &[c as usize])?;
        Ok(())
    }

    /// Reads one character; fails with `Remote(Unavailable)` when no input is pending.
    pub fn getchar(&self) -> Result<u8> {
        let reply = self.call(opcode::GET_CHAR, &[])?;
        reply.expect_opcode(opcode::GET_CHAR)?;
        Ok(reply.arg(0) as u8)
    }

    /// Spawns a domain from `argv` on `core`; returns its pid.
    pub fn spawn<S: AsRef<str>>(&self, argv: &[S], core: usize) -> Result<usize> {
        if argv.is_empty() {
            return Err(RpcError::Malformed("spawn needs a program name"));
        }
        let reply = self.send_payload(opcode::SPAWN, &encode_strings(argv), &[core], None)?;
        reply.expect_opcode(opcode::SPAWN)?;
        Ok(reply.arg(0))
    }

    /// Terminates the domain `pid`.
    pub fn exit(&self, pid: usize) -> Result<()> {
        self.call(opcode::EXIT, &[pid])?;
        Ok(())
    }

    /// Name of the domain `pid`.
    pub fn get_name(&self, pid: usize) -> Result<String> {
        let buffer = self.shared_buffer().ok_or(RpcError::NoSharedBuffer)?;
        let reply = self.call(opcode::GET_NAME, &[pid])?;
        reply.expect_opcode(opcode::GET_NAME)?;
        buffer.read_string(reply.arg(0))
    }

    /// Pids of every running domain.
    pub fn get_all_pids(&self) -> Result<Vec<usize>> {
        let buffer = self.shared_buffer().ok_or(RpcError::NoSharedBuffer)?;
        let reply = self.call(opcode::GET_PID, &[])?;
        reply.expect_opcode(opcode::GET_PID)?;
        let count = reply.arg(0);
        let len = count.checked_mul(PID_BYTES).ok_or(RpcError::Malformed("pid count overflow"))?;
        let bytes = buffer.read(0, len)?;
        Ok(bytes
            .chunks_exact(PID_BYTES)
            .map(|chunk| {
                let mut word = [0u8; PID_BYTES];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word) as usize
            })
            .collect())
    }

    /// Requests a device capability.
    pub fn get_special_cap(&self, kind: SpecialCapKind) -> Result<DeviceCap> {
        let reply = self.call(opcode::SPECIAL_CAP_QUERY, &[kind as usize])?;
        reply.expect_opcode(opcode::SPECIAL_CAP_RESPONSE)?;
        reply
            .cap
            .and_then(Capability::into_device)
            .ok_or(RpcError::Malformed("special cap reply without a device capability"))
    }

    /// Publishes `endpoint` under `name`.
    pub fn create_server_socket(&self, name: &str, endpoint: EndpointCap) -> Result<()> {
        let cap = Some(Capability::Endpoint(endpoint));
        self.send_payload(opcode::CREATE_SERVER_SOCKET, &encode_string(name), &[], cap)?;
        Ok(())
    }

    /// Resolves `name` to the endpoint published under it.
    pub fn connect_to_socket(&self, name: &str) -> Result<EndpointCap> {
        let reply = self.send_payload(opcode::CONNECT_TO_SOCKET, &encode_string(name), &[], None)?;
        reply.expect_opcode(opcode::CONNECT_TO_SOCKET)?;
        reply
            .cap
            .and_then(Capability::into_endpoint)
            .ok_or(RpcError::Malformed("socket reply without an endpoint"))
    }
}
