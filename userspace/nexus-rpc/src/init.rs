// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Reference handlers for the init domain's RPC services
//! OWNERS: @runtime
//! STATUS: Functional (host backend)
//!
//! PUBLIC API:
//!   - InitBackend: what the handlers delegate to (serial sink, RAM, process table, names)
//!   - HostInitBackend: in-memory backend that records every effect for tests
//!   - register_init_handlers(): binds NUMBER..SPECIAL_CAP_QUERY on a registry
//!
//! ERROR CONDITIONS:
//!   - Unknown pid: Rejected(DomainNotFound)
//!   - No pending input character: Rejected(Unavailable)
//!   - Unknown special cap kind or empty argv: Rejected(InvalidArgs)

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::{debug, info};
use nexus_abi::{
    Capability, DeviceCap, EndpointCap, MemoryServices, NameService, RamCap, SpecialCapKind,
};
use parking_lot::Mutex;

use crate::handler::{HandlerRegistry, Reply, Request};
use crate::{opcode, ErrorCode, Result, RpcError};

/// Services the init handlers delegate to.
pub trait InitBackend: Send + Sync {
    /// Records a number sent by a client.
    fn number(&self, number: usize);
    /// Records a string sent by a client.
    fn string(&self, s: &str);
    /// Writes one character to the serial sink.
    fn putchar(&self, c: u8);
    /// Next pending input character.
    fn getchar(&self) -> Option<u8>;
    /// Allocates untyped RAM.
    fn ram_alloc(&self, size: usize, align: usize) -> Result<RamCap>;
    /// Starts a domain; returns its pid.
    fn spawn(&self, argv: &[String], core: usize) -> Result<usize>;
    /// Terminates a domain.
    fn exit(&self, pid: usize) -> Result<()>;
    /// Name of a domain.
    fn name_of(&self, pid: usize) -> Result<String>;
    /// Pids of all running domains, ascending.
    fn pids(&self) -> Vec<usize>;
    /// Device capability of the given kind.
    fn special_cap(&self, kind: SpecialCapKind) -> Result<DeviceCap>;
    /// Publishes an endpoint under `name`.
    fn register_socket(&self, name: &str, endpoint: EndpointCap) -> Result<()>;
    /// Resolves a published endpoint.
    fn lookup_socket(&self, name: &str) -> Result<EndpointCap>;
}

/// Pid of the init domain itself.
pub const INIT_PID: usize = 0;

#[derive(Clone, Debug)]
struct Domain {
    argv: Vec<String>,
    core: usize,
}

#[derive(Default)]
struct HostState {
    numbers: Vec<usize>,
    strings: Vec<String>,
    serial: Vec<u8>,
    input: VecDeque<u8>,
    domains: BTreeMap<usize, Domain>,
    next_pid: usize,
}

/// In-memory backend: records every effect and keeps a process table.
pub struct HostInitBackend {
    kernel: Arc<dyn MemoryServices>,
    names: Arc<dyn NameService>,
    state: Mutex<HostState>,
}

impl HostInitBackend {
    /// Creates a backend whose process table holds only init.
    pub fn new(kernel: Arc<dyn MemoryServices>, names: Arc<dyn NameService>) -> Self {
        let mut state = HostState { next_pid: INIT_PID + 1, ..Default::default() };
        state.domains.insert(INIT_PID, Domain { argv: vec!["init".to_string()], core: 0 });
        Self { kernel, names, state: Mutex::new(state) }
    }

    /// Numbers received so far.
    pub fn numbers(&self) -> Vec<usize> {
        self.state.lock().numbers.clone()
    }

    /// Strings received so far.
    pub fn strings(&self) -> Vec<String> {
        self.state.lock().strings.clone()
    }

    /// Bytes written to the serial sink.
    pub fn serial_output(&self) -> Vec<u8> {
        self.state.lock().serial.clone()
    }

    /// Queues input characters for `getchar`.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.extend(bytes.iter().copied());
    }

    /// Core a domain was started on.
    pub fn core_of(&self, pid: usize) -> Option<usize> {
        self.state.lock().domains.get(&pid).map(|d| d.core)
    }
}

impl InitBackend for HostInitBackend {
    fn number(&self, number: usize) {
        debug!("init: number {}", number);
        self.state.lock().numbers.push(number);
    }

    fn string(&self, s: &str) {
        debug!("init: string {:?}", s);
        self.state.lock().strings.push(s.to_string());
    }

    fn putchar(&self, c: u8) {
        self.state.lock().serial.push(c);
    }

    fn getchar(&self) -> Option<u8> {
        self.state.lock().input.pop_front()
    }

    fn ram_alloc(&self, size: usize, align: usize) -> Result<RamCap> {
        Ok(self.kernel.ram_alloc(size, align)?)
    }

    fn spawn(&self, argv: &[String], core: usize) -> Result<usize> {
        let Some(name) = argv.first().filter(|name| !name.is_empty()) else {
            return Err(RpcError::Rejected(ErrorCode::InvalidArgs));
        };
        let mut state = self.state.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.domains.insert(pid, Domain { argv: argv.to_vec(), core });
        info!("init: spawned '{}' as pid {} on core {}", name, pid, core);
        Ok(pid)
    }

    fn exit(&self, pid: usize) -> Result<()> {
        match self.state.lock().domains.remove(&pid) {
            Some(domain) => {
                info!("init: pid {} ('{}') exited", pid, domain.argv[0]);
                Ok(())
            }
            None => Err(RpcError::Rejected(ErrorCode::DomainNotFound)),
        }
    }

    fn name_of(&self, pid: usize) -> Result<String> {
        self.state
            .lock()
            .domains
            .get(&pid)
            .map(|domain| domain.argv[0].clone())
            .ok_or(RpcError::Rejected(ErrorCode::DomainNotFound))
    }

    fn pids(&self) -> Vec<usize> {
        self.state.lock().domains.keys().copied().collect()
    }

    fn special_cap(&self, kind: SpecialCapKind) -> Result<DeviceCap> {
        Ok(self.kernel.special_cap(kind)?)
    }

    fn register_socket(&self, name: &str, endpoint: EndpointCap) -> Result<()> {
        Ok(self.names.register(name, endpoint)?)
    }

    fn lookup_socket(&self, name: &str) -> Result<EndpointCap> {
        Ok(self.names.lookup(name)?)
    }
}

fn received_endpoint(request: &mut Request<'_>) -> Result<EndpointCap> {
    request
        .take_cap()
        .and_then(Capability::into_endpoint)
        .ok_or(RpcError::Malformed("request without an endpoint capability"))
}

/// Binds the init services to `registry`.
pub fn register_init_handlers(
    registry: &mut HandlerRegistry,
    backend: Arc<dyn InitBackend>,
) -> Result<()> {
    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::NUMBER,
        move |req| {
            b.number(req.arg(0));
            Ok(Reply::Done)
        },
        true,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::STRING,
        move |req| {
            b.string(&req.payload_string()?);
            Ok(Reply::Done)
        },
        true,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::RAM_CAP_QUERY,
        move |req| {
            let ram = b.ram_alloc(req.arg(0), req.arg(1))?;
            Ok(Reply::with_cap(opcode::RAM_CAP_RESPONSE, &[ram.size], Capability::Ram(ram)))
        },
        false,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::PUT_CHAR,
        move |req| {
            b.putchar(req.arg(0) as u8);
            Ok(Reply::Done)
        },
        true,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::GET_CHAR,
        move |_| {
            let c = b.getchar().ok_or(RpcError::Rejected(ErrorCode::Unavailable))?;
            Ok(Reply::words(opcode::GET_CHAR, &[c as usize]))
        },
        false,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::SPAWN,
        move |req| {
            let pid = b.spawn(&req.payload_strings()?, req.arg(1))?;
            Ok(Reply::words(opcode::SPAWN, &[pid]))
        },
        false,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::EXIT,
        move |req| {
            b.exit(req.arg(0))?;
            Ok(Reply::Done)
        },
        true,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::GET_NAME,
        move |req| {
            let name = b.name_of(req.arg(0))?;
            let len = req.buffer()?.write_string(&name)?;
            Ok(Reply::words(opcode::GET_NAME, &[len]))
        },
        false,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::GET_PID,
        move |req| {
            let pids = b.pids();
            let bytes: Vec<u8> = pids.iter().flat_map(|pid| (*pid as u64).to_le_bytes()).collect();
            req.buffer()?.write(0, &bytes)?;
            Ok(Reply::words(opcode::GET_PID, &[pids.len()]))
        },
        false,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::SPECIAL_CAP_QUERY,
        move |req| {
            let kind = SpecialCapKind::from_word(req.arg(0))
                .ok_or(RpcError::Rejected(ErrorCode::InvalidArgs))?;
            let dev = b.special_cap(kind)?;
            Ok(Reply::with_cap(opcode::SPECIAL_CAP_RESPONSE, &[], Capability::Device(dev)))
        },
        false,
    )?;

    let b = Arc::clone(&backend);
    registry.register_fn(
        opcode::CREATE_SERVER_SOCKET,
        move |req| {
            let name = req.payload_string()?;
            let endpoint = received_endpoint(req)?;
            b.register_socket(&name, endpoint)?;
            Ok(Reply::Done)
        },
        true,
    )?;

    let b = backend;
    registry.register_fn(
        opcode::CONNECT_TO_SOCKET,
        move |req| {
            let endpoint = b.lookup_socket(&req.payload_string()?)?;
            Ok(Reply::with_cap(opcode::CONNECT_TO_SOCKET, &[], Capability::Endpoint(endpoint)))
        },
        false,
    )?;

    info!("init: {} services registered", registry.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_abi::{HostKernel, HostNameService, LmpChannel};

    fn backend() -> HostInitBackend {
        HostInitBackend::new(Arc::new(HostKernel::default()), Arc::new(HostNameService::new()))
    }

    #[test]
    fn process_table_tracks_spawn_and_exit() {
        let init = backend();
        let pid = init.spawn(&["hello".to_string(), "a".to_string()], 1).unwrap();
        assert_eq!(init.pids(), vec![INIT_PID, pid]);
        assert_eq!(init.name_of(pid).unwrap(), "hello");
        assert_eq!(init.core_of(pid), Some(1));
        init.exit(pid).unwrap();
        assert_eq!(init.exit(pid), Err(RpcError::Rejected(ErrorCode::DomainNotFound)));
        assert_eq!(init.name_of(pid), Err(RpcError::Rejected(ErrorCode::DomainNotFound)));
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert_eq!(backend().spawn(&[], 0), Err(RpcError::Rejected(ErrorCode::InvalidArgs)));
    }

    #[test]
    fn sockets_go_through_the_name_service() {
        let init = backend();
        let chan = LmpChannel::new(1);
        init.register_socket("serial", chan.local_cap()).unwrap();
        assert_eq!(init.lookup_socket("serial").unwrap(), chan.local_cap());
        assert_eq!(init.lookup_socket("led").unwrap_err().code(), ErrorCode::NameNotFound);
    }

    #[test]
    fn all_services_are_registered() {
        let mut registry = HandlerRegistry::new();
        register_init_handlers(&mut registry, Arc::new(backend())).unwrap();
        assert_eq!(registry.len(), 12);
        assert!(!registry.contains(opcode::HANDSHAKE));
        assert!(registry.contains(opcode::SPECIAL_CAP_QUERY));
    }
}
