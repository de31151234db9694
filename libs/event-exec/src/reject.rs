// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;

/// What a full task queue does to an outside-loop submission.
///
/// In-loop submissions never wait — blocking the worker on its own queue
/// cannot make progress — so a full queue always fails fast there.
#[derive(Debug, Clone, Copy)]
pub enum RejectionPolicy {
    /// Fail the submission with [`RejectedError::QueueFull`].
    ///
    /// [`RejectedError::QueueFull`]: crate::RejectedError::QueueFull
    Reject,
    /// Retry up to `retries` times, sleeping `delay` on the executor's
    /// ticker between attempts, then fail.
    Backoff { retries: usize, delay: Duration },
}

// === impl RejectionPolicy ===

impl RejectionPolicy {
    /// A backoff policy with sane lower bounds (at least one retry, at
    /// least a microsecond of sleep).
    #[must_use]
    pub fn backoff(retries: usize, delay: Duration) -> Self {
        Self::Backoff {
            retries: retries.max(1),
            delay: delay.max(Duration::from_micros(1)),
        }
    }
}

impl Default for RejectionPolicy {
    fn default() -> Self {
        Self::Reject
    }
}
