// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// An exponential backoff for contended compare-and-swap loops.
///
/// Each call to [`Backoff::spin`] issues `2^exp` spin-loop hints, doubling
/// the pause up to a fixed maximum exponent.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Backoff {
    exp: u8,
}

// === impl Backoff ===

impl Backoff {
    const MAX_EXPONENT: u8 = 6;

    pub(crate) const fn new() -> Self {
        Self { exp: 0 }
    }

    #[inline(always)]
    pub(crate) fn spin(&mut self) {
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            // In loom tests the "spinning" thread must yield back to the
            // model so other threads can make the progress we are waiting
            // for. See https://github.com/tokio-rs/loom/issues/162
            #[cfg(all(test, loom))]
            loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1;
        }
    }
}
