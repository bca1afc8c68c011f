// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Opcode space of the RPC protocol (one byte; 0 is reserved).

/// Reserved "null" opcode; never registered, never sent.
pub const NULL: u8 = 0;
/// First message of a session: exchanges endpoint capabilities.
pub const HANDSHAKE: u8 = 1;
/// Negotiates the shared bulk-data buffer; word 1 = requested size.
pub const SHARED_BUFFER_REQUEST: u8 = 2;
/// Word 1 = number.
pub const NUMBER: u8 = 3;
/// String payload (shared buffer, or inline chunks before one exists).
pub const STRING: u8 = 4;
/// Words 1/2 = size/alignment of the requested RAM.
pub const RAM_CAP_QUERY: u8 = 5;
/// Reply to [`RAM_CAP_QUERY`]: RAM capability, word 1 = granted size.
pub const RAM_CAP_RESPONSE: u8 = 6;
/// Word 1 = character.
pub const PUT_CHAR: u8 = 7;
/// Reply word 1 = character.
pub const GET_CHAR: u8 = 8;
/// Argument array in the shared buffer, word 1 = length, word 2 = core.
pub const SPAWN: u8 = 9;
/// Word 1 = pid of the domain to terminate.
pub const EXIT: u8 = 10;
/// Word 1 = pid; reply carries the name in the shared buffer.
pub const GET_NAME: u8 = 11;
/// Reply word 1 = count; pids in the shared buffer.
pub const GET_PID: u8 = 12;
/// Name in the shared buffer plus an endpoint capability.
pub const CREATE_SERVER_SOCKET: u8 = 13;
/// Name in the shared buffer; reply carries the endpoint capability.
pub const CONNECT_TO_SOCKET: u8 = 14;
/// Word 1 = special capability kind.
pub const SPECIAL_CAP_QUERY: u8 = 15;
/// Reply to [`SPECIAL_CAP_QUERY`] carrying the device capability.
pub const SPECIAL_CAP_RESPONSE: u8 = 16;
/// First opcode free for services layered on top of the runtime.
pub const USER_BASE: u8 = 32;

/// Human readable opcode name for logs.
pub fn name(opcode: u8) -> &'static str {
    match opcode {
        NULL => "NULL",
        HANDSHAKE => "HANDSHAKE",
        SHARED_BUFFER_REQUEST => "SHARED_BUFFER_REQUEST",
        NUMBER => "NUMBER",
        STRING => "STRING",
        RAM_CAP_QUERY => "RAM_CAP_QUERY",
        RAM_CAP_RESPONSE => "RAM_CAP_RESPONSE",
        PUT_CHAR => "PUT_CHAR",
        GET_CHAR => "GET_CHAR",
        SPAWN => "SPAWN",
        EXIT => "EXIT",
        GET_NAME => "GET_NAME",
        GET_PID => "GET_PID",
        CREATE_SERVER_SOCKET => "CREATE_SERVER_SOCKET",
        CONNECT_TO_SOCKET => "CONNECT_TO_SOCKET",
        SPECIAL_CAP_QUERY => "SPECIAL_CAP_QUERY",
        SPECIAL_CAP_RESPONSE => "SPECIAL_CAP_RESPONSE",
        _ => "USER",
    }
}
