// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cooperative event dispatcher for LMP channels
//! OWNERS: @runtime
//!
//! A [`WaitSet`] holds one-shot registrations ("call me when this channel becomes writable /
//! readable"). [`WaitSet::dispatch_once`] polls every registration once and runs the callbacks
//! whose event is ready. Callbacks may register again from inside the callback; the new
//! registration is considered on the next dispatch round.
//!
//! A wait set belongs to one execution context and is not `Sync`.

use core::cell::RefCell;
use core::fmt;

use crate::lmp::LmpChannel;

/// Channel condition a registration waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The remote queue has room for one more message.
    Writable,
    /// A message is waiting on the local endpoint.
    Readable,
}

struct Registration {
    channel: LmpChannel,
    event: Event,
    callback: Box<dyn FnOnce()>,
}

impl Registration {
    fn ready(&self) -> bool {
        match self.event {
            Event::Writable => self.channel.can_send(),
            Event::Readable => self.channel.can_recv(),
        }
    }
}

/// Set of pending one-shot channel registrations.
#[derive(Default)]
pub struct WaitSet {
    pending: RefCell<Vec<Registration>>,
}

impl WaitSet {
    /// Creates an empty wait set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `callback` once `channel` can accept a message.
    pub fn register_send(&self, channel: &LmpChannel, callback: impl FnOnce() + 'static) {
        self.register(channel, Event::Writable, Box::new(callback));
    }

    /// Runs `callback` once a message is waiting on `channel`.
    pub fn register_recv(&self, channel: &LmpChannel, callback: impl FnOnce() + 'static) {
        self.register(channel, Event::Readable, Box::new(callback));
    }

    fn register(&self, channel: &LmpChannel, event: Event, callback: Box<dyn FnOnce()>) {
        self.pending.borrow_mut().push(Registration { channel: channel.clone(), event, callback });
    }

    /// Number of registrations still waiting.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Polls every registration once; returns how many callbacks ran.
    pub fn dispatch_once(&self) -> usize {
        let round = core::mem::take(&mut *self.pending.borrow_mut());
        let mut waiting = Vec::with_capacity(round.len());
        let mut ready = Vec::new();
        for registration in round {
            if registration.ready() {
                ready.push(registration.callback);
            } else {
                waiting.push(registration);
            }
        }
        *self.pending.borrow_mut() = waiting;
        let fired = ready.len();
        for callback in ready {
            callback();
        }
        fired
    }
}

impl fmt::Debug for WaitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSet").field("pending", &self.pending()).finish()
    }
}
