// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed cross-core calls carried over a URPC channel.
//!
//! PRINT: NUL-terminated text, echoed back by the server.
//! SPAWN: `{core: u64 LE}{argv: string array}`, answered with `{pid: u64 LE}`. The core word and
//! the argument array are written as two chunks of one request.

use std::sync::Arc;

use nexus_marshal::{serialize_size_string_array, serialize_string_array, unserialize_string_array};
use nexus_rpc::InitBackend;

use crate::channel::{UrpcClient, UrpcServer};
use crate::{Result, UrpcError};

/// Write text to the server's serial sink.
pub const PRINT: u32 = 1;
/// Start a domain on a given core.
pub const SPAWN: u32 = 2;

const WORD_BYTES: usize = core::mem::size_of::<u64>();

fn decode_word(bytes: &[u8]) -> Result<u64> {
    let word: [u8; WORD_BYTES] = bytes
        .get(..WORD_BYTES)
        .and_then(|b| b.try_into().ok())
        .ok_or(UrpcError::Malformed("payload shorter than one word"))?;
    Ok(u64::from_le_bytes(word))
}

impl UrpcClient {
    /// Prints `text` on the server side; the server echoes the payload.
    pub fn print(&mut self, text: &str) -> Result<()> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        let reply = self.call(PRINT, &payload)?;
        if reply.data != payload {
            return Err(UrpcError::Malformed("print echo does not match"));
        }
        Ok(())
    }

    /// Spawns a domain from `argv` on `core`; returns its pid.
    pub fn spawn<S: AsRef<str>>(&mut self, argv: &[S], core: usize) -> Result<usize> {
        let mut body = vec![0u8; serialize_size_string_array(argv)];
        let len = serialize_string_array(argv, &mut body);
        self.send_chunk(SPAWN, &(core as u64).to_le_bytes(), true, false)?;
        self.send_chunk(SPAWN, &body[..len], false, true)?;
        let reply = self.wait_reply()?;
        Ok(decode_word(&reply.data)? as usize)
    }
}

/// Binds PRINT and SPAWN on `server`, delegating to `backend`.
pub fn register_init_services(
    server: &mut UrpcServer,
    backend: Arc<dyn InitBackend>,
) -> Result<()> {
    let b = Arc::clone(&backend);
    server.register_fn(PRINT, move |req| {
        let text = req.data.strip_suffix(&[0]).unwrap_or(&req.data[..]);
        for c in text {
            b.putchar(*c);
        }
        Ok(Some(req.data.clone()))
    })?;

    server.register_fn(SPAWN, move |req| {
        let core = decode_word(&req.data)? as usize;
        let (argv, _) = unserialize_string_array(&req.data[WORD_BYTES..])?;
        let pid = backend.spawn(&argv, core)?;
        Ok(Some((pid as u64).to_le_bytes().to_vec()))
    })?;
    Ok(())
}
