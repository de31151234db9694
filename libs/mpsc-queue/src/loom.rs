// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Swaps the queue's atomics and cells for their `loom` doubles under
//! `--cfg loom`, so the model checker can explore the interleavings of the
//! publication protocol. Regular builds compile straight to the `core`
//! types.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::cell;
        pub(crate) use loom::sync;

        #[cfg(test)]
        pub(crate) use loom::{model, thread};
    } else {
        pub(crate) mod sync {
            pub(crate) use core::sync::atomic;
        }

        /// The shape of `loom::cell::UnsafeCell`, backed by the plain core
        /// cell: all access goes through `with`/`with_mut` closures so the
        /// call sites compile unchanged under both cfgs.
        pub(crate) mod cell {
            #[derive(Debug)]
            pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

            impl<T> UnsafeCell<T> {
                pub(crate) const fn new(value: T) -> Self {
                    Self(core::cell::UnsafeCell::new(value))
                }

                #[inline(always)]
                pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
                    f(self.0.get())
                }

                #[inline(always)]
                pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
                    f(self.0.get())
                }
            }
        }

        #[cfg(test)]
        pub(crate) use std::thread;

        /// Without loom there is nothing to model; run the body once.
        #[cfg(test)]
        #[inline(always)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }
    }
}
