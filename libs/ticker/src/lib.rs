// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Monotonic time sources for the task-execution core.
//!
//! A [`Ticker`] hands out `u64` nanosecond readings relative to an
//! instance-specific epoch. Readings never go backwards for the lifetime of
//! the process, which lets schedulers store absolute deadlines and compare
//! them with plain integer arithmetic. Arithmetic on deadlines saturates at
//! [`u64::MAX`], so a deadline "infinitely far" in the future is well-formed
//! rather than an overflow.
//!
//! Two implementations are provided: [`SystemTicker`], backed by
//! [`std::time::Instant`], and [`MockTicker`], a hand-cranked source for
//! deterministic tests.

use core::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A monotonic nanosecond clock plus a sleep primitive.
pub trait Ticker: Send + Sync + fmt::Debug {
    /// The current reading in nanoseconds, relative to this ticker's epoch.
    ///
    /// Successive calls never observe a smaller value.
    fn nanos(&self) -> u64;

    /// The reading captured when this ticker was constructed.
    ///
    /// Subtracting this from [`Ticker::nanos`] yields elapsed time in a range
    /// that cannot overflow for the lifetime of the process.
    fn initial_nanos(&self) -> u64;

    /// Blocks the calling thread for at least `dur`.
    fn sleep(&self, dur: Duration);

    /// The absolute deadline `delay` from now, saturating at [`u64::MAX`].
    fn deadline(&self, delay: Duration) -> u64 {
        self.nanos().saturating_add(duration_to_nanos(delay))
    }
}

/// Clamps a `Duration` reading into the `u64` nanosecond domain.
#[inline]
#[must_use]
pub fn duration_to_nanos(dur: Duration) -> u64 {
    u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX)
}

// === impl SystemTicker ===

/// The default [`Ticker`], backed by [`Instant`].
///
/// Readings start at zero when the ticker is constructed.
#[derive(Debug)]
pub struct SystemTicker {
    epoch: Instant,
}

impl SystemTicker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// The process-wide shared instance.
    ///
    /// All executors that are not explicitly given a ticker share this one,
    /// so their deadlines live on a common timeline.
    pub fn shared() -> Arc<SystemTicker> {
        static SHARED: OnceLock<Arc<SystemTicker>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(SystemTicker::new())))
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn nanos(&self) -> u64 {
        duration_to_nanos(self.epoch.elapsed())
    }

    fn initial_nanos(&self) -> u64 {
        0
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

// === impl MockTicker ===

/// A [`Ticker`] that only moves when told to.
///
/// [`MockTicker::advance`] moves the reading forward and wakes every sleeper
/// whose target has been reached before it returns, in deadline order (the
/// sleepers re-check the reading under the same lock, so a sleeper whose
/// target is still in the future goes straight back to waiting).
#[derive(Debug)]
pub struct MockTicker {
    state: Mutex<MockState>,
    sleepers: Condvar,
}

#[derive(Debug)]
struct MockState {
    now: u64,
}

impl MockTicker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState { now: 0 }),
            sleepers: Condvar::new(),
        }
    }

    /// Moves the reading forward by `dur` and releases all sleepers whose
    /// deadline has been reached.
    pub fn advance(&self, dur: Duration) {
        let mut state = self.state.lock();
        state.now = state.now.saturating_add(duration_to_nanos(dur));
        tracing::trace!(now = state.now, "mock ticker advanced");
        // Wakes every sleeper while the lock is still held; the ones whose
        // target is still ahead re-park themselves immediately.
        self.sleepers.notify_all();
    }
}

impl Default for MockTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for MockTicker {
    fn nanos(&self) -> u64 {
        self.state.lock().now
    }

    fn initial_nanos(&self) -> u64 {
        0
    }

    fn sleep(&self, dur: Duration) {
        let mut state = self.state.lock();
        let target = state.now.saturating_add(duration_to_nanos(dur));
        while state.now < target {
            self.sleepers.wait(&mut state);
        }
    }
}
