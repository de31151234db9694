// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Deref;

/// Aligns the producer and consumer cursors to their own cache lines so the
/// two sides of the queue never [false-share] one.
///
/// x86_64 prefetchers pull lines in adjacent pairs and big aarch64 cores use
/// 128-byte lines outright, so those targets get 128-byte alignment; the
/// common 64-byte line covers the rest.
///
/// [false-share]: <https://en.wikipedia.org/wiki/False_sharing>
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64"),
    repr(align(128))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64")),
    repr(align(64))
)]
#[derive(Debug, Default)]
pub(crate) struct CachePadded<T>(pub(crate) T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
