// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Name registry: name -> endpoint capability.

use std::collections::HashMap;

use log::info;
use parking_lot::Mutex;

use crate::lmp::EndpointCap;
use crate::{AbiError, Result};

/// Registry contract used to publish and find service endpoints.
pub trait NameService: Send + Sync {
    /// Binds `name` to `endpoint`; fails if the name is taken.
    fn register(&self, name: &str, endpoint: EndpointCap) -> Result<()>;

    /// Resolves `name` to the registered endpoint.
    fn lookup(&self, name: &str) -> Result<EndpointCap>;
}

/// In-memory registry.
#[derive(Default)]
pub struct HostNameService {
    names: Mutex<HashMap<String, EndpointCap>>,
}

impl HostNameService {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameService for HostNameService {
    fn register(&self, name: &str, endpoint: EndpointCap) -> Result<()> {
        let mut names = self.names.lock();
        if names.contains_key(name) {
            return Err(AbiError::NameTaken(name.to_string()));
        }
        info!("names: '{}' -> {:?}", name, endpoint);
        names.insert(name.to_string(), endpoint);
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<EndpointCap> {
        self.names.lock().get(name).cloned().ok_or_else(|| AbiError::NameNotFound(name.to_string()))
    }
}
