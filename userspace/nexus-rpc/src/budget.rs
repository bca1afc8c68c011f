// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Deterministic, budgeted retry loops for RPC waits.
//!
//! Every wait in the runtime (channel writable, reply arrived, peer re-armed its receive slot)
//! is a non-blocking attempt returning `RpcError::WouldBlock`, driven by [`retry_until`]
//! against an explicit deadline computed from a [`Clock`].
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests (host)

use core::time::Duration;

use crate::{Result, RpcError};

/// Failed attempts between two reads of the clock.
const CLOCK_POLL_INTERVAL: usize = 128;

/// Time source and yield point of a budgeted wait.
pub trait Clock {
    /// Monotonic nanoseconds; `None` when the platform has no timer.
    fn now_ns(&self) -> Option<u64>;
    /// Gives up the CPU between two attempts.
    fn yield_now(&self);
}

/// Monotonic clock of the host process.
#[derive(Clone, Copy, Debug)]
pub struct HostClock {
    start: std::time::Instant,
}

impl HostClock {
    /// Clock whose epoch is the moment of the call.
    pub fn new() -> Self {
        Self { start: std::time::Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> Option<u64> {
        Some(duration_to_ns(self.start.elapsed()))
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// `d` in nanoseconds, saturating at `u64::MAX`.
pub fn duration_to_ns(d: Duration) -> u64 {
    d.as_secs().saturating_mul(1_000_000_000).saturating_add(d.subsec_nanos() as u64)
}

/// Absolute deadline `budget` from now.
pub fn deadline_after<C: Clock + ?Sized>(clock: &C, budget: Duration) -> Result<u64> {
    let now = clock.now_ns().ok_or(RpcError::Unsupported)?;
    Ok(now.saturating_add(duration_to_ns(budget)))
}

/// Repeats `op` while it reports `RpcError::WouldBlock`.
///
/// Any other outcome is returned as is. The deadline is checked before the first yield and then
/// every [`CLOCK_POLL_INTERVAL`] failed attempts; once it has passed the wait ends with
/// `RpcError::Timeout`.
pub fn retry_until<C: Clock + ?Sized, T>(
    clock: &C,
    deadline_ns: u64,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut until_poll = 0usize;
    loop {
        match op() {
            Err(RpcError::WouldBlock) => {}
            done => return done,
        }
        if until_poll == 0 {
            if clock.now_ns().ok_or(RpcError::Unsupported)? >= deadline_ns {
                return Err(RpcError::Timeout);
            }
            until_poll = CLOCK_POLL_INTERVAL;
        }
        until_poll -= 1;
        clock.yield_now();
    }
}

/// [`retry_until`] with a deadline `budget` from now.
pub fn retry_budgeted<C: Clock + ?Sized, T>(
    clock: &C,
    budget: Duration,
    op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let deadline_ns = deadline_after(clock, budget)?;
    retry_until(clock, deadline_ns, op)
}
