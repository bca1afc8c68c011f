// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host harness for end-to-end messaging scenarios
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! An [`InitNode`] plays the init domain: one host kernel, the init services behind a threaded
//! RPC server, and a URPC bind handler that serves every bound channel on its own thread.
//! Client domains get their own address space from [`InitNode::address_space`].

#![forbid(unsafe_code)]

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use log::warn;
use nexus_abi::{HostKernel, HostNameService};
use nexus_rpc::{
    register_init_handlers, HandlerRegistry, HostInitBackend, RpcConfig, RpcServer, RpcSession,
    ServerHandle,
};
use nexus_urpc::channel::register_bind_handler;
use nexus_urpc::proto::register_init_services;
use nexus_urpc::{UrpcChannel, UrpcClient, UrpcConfig, UrpcError, UrpcServerHandle};
use nexus_vm::{PagingConfig, PagingState};

/// Init domain running on host threads.
pub struct InitNode {
    kernel: Arc<HostKernel>,
    backend: Arc<HostInitBackend>,
    rpc: ServerHandle,
    bound: Receiver<UrpcServerHandle>,
    urpc_servers: Vec<UrpcServerHandle>,
}

impl InitNode {
    /// Boots the init services with `urpc` as the configuration of bound channels.
    pub fn start(urpc: UrpcConfig) -> nexus_rpc::Result<Self> {
        let kernel = Arc::new(HostKernel::default());
        let backend =
            Arc::new(HostInitBackend::new(kernel.clone(), Arc::new(HostNameService::new())));
        let init_vm = Arc::new(PagingState::new(PagingConfig::new(), kernel.clone())?);

        let mut registry = HandlerRegistry::new();
        register_init_handlers(&mut registry, backend.clone())?;
        let (tx, bound) = mpsc::channel();
        let services = backend.clone();
        register_bind_handler(&mut registry, init_vm.clone(), urpc, move |channel| {
            let (_, mut server) = channel.split();
            let started =
                register_init_services(&mut server, services.clone()).and_then(|()| server.spawn());
            match started {
                Ok(handle) => {
                    if tx.send(handle).is_err() {
                        warn!("e2e: init node gone; dropping urpc server");
                    }
                }
                Err(err) => warn!("e2e: cannot serve bound channel: {}", err),
            }
        })?;
        let rpc = RpcServer::spawn(init_vm, RpcConfig::new(), registry)?;
        Ok(Self { kernel, backend, rpc, bound, urpc_servers: Vec::new() })
    }

    /// Host kernel shared by every domain of the node.
    pub fn kernel(&self) -> &Arc<HostKernel> {
        &self.kernel
    }

    /// Init service state (diagnostic sinks, process table).
    pub fn backend(&self) -> &Arc<HostInitBackend> {
        &self.backend
    }

    /// Fresh address space for a client domain.
    pub fn address_space(&self) -> nexus_vm::Result<Arc<PagingState>> {
        Ok(Arc::new(PagingState::new(PagingConfig::new(), self.kernel.clone())?))
    }

    /// Opens an RPC session to init from a fresh address space.
    pub fn connect(&self, config: RpcConfig) -> nexus_rpc::Result<RpcSession> {
        RpcSession::connect(&self.rpc.endpoint(), self.address_space()?, config)
    }

    /// Binds a URPC channel over `session`; returns the half that calls into init.
    pub fn bind_urpc(
        &mut self,
        session: &RpcSession,
        config: UrpcConfig,
    ) -> nexus_urpc::Result<UrpcClient> {
        let (client, _) = UrpcChannel::bootstrap(session, config)?.split();
        let server = self
            .bound
            .recv()
            .map_err(|_| UrpcError::Thread("bind handler did not start a server".into()))?;
        self.urpc_servers.push(server);
        Ok(client)
    }

    /// Stops every server thread of the node.
    pub fn shutdown(self) -> nexus_urpc::Result<()> {
        for server in self.urpc_servers {
            server.stop_and_join()?;
        }
        self.rpc.stop_and_join();
        Ok(())
    }
}
