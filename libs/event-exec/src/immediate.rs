// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An executor that runs each task on the caller's thread.
//!
//! Re-entrant submissions do not recurse: the outermost `execute` call runs
//! tasks, inner calls append to a per-thread deferred queue and return, and
//! the outer frame drains that queue before returning. Task panics are
//! logged and swallowed so queued follow-ups still run.

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use static_assertions::assert_impl_all;

use crate::error::RejectedError;
use crate::executor::{Executor, Task};

/// Runs tasks on the submitting thread; see the module docs for the
/// re-entrancy protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateExecutor;

assert_impl_all!(ImmediateExecutor: Send, Sync);

std::thread_local! {
    static DEFERRED: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
    static RUNNING: Cell<bool> = const { Cell::new(false) };
}

// === impl ImmediateExecutor ===

impl ImmediateExecutor {
    /// The process-wide shared instance as an [`Executor`] handle.
    pub fn shared_dyn() -> Arc<dyn Executor> {
        static SHARED: OnceLock<Arc<ImmediateExecutor>> = OnceLock::new();
        let shared = Arc::clone(SHARED.get_or_init(|| Arc::new(ImmediateExecutor)));
        shared
    }

    fn run_task(task: Task) {
        if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("task submitted to the immediate executor panicked");
        }
    }
}

impl Executor for ImmediateExecutor {
    fn execute(&self, task: Task) -> Result<(), RejectedError> {
        if RUNNING.with(Cell::get) {
            // re-entrant call: defer to the outer frame
            DEFERRED.with(|queue| queue.borrow_mut().push_back(task));
            return Ok(());
        }

        RUNNING.with(|running| running.set(true));
        Self::run_task(task);
        loop {
            let Some(next) = DEFERRED.with(|queue| queue.borrow_mut().pop_front()) else {
                break;
            };
            Self::run_task(next);
        }
        RUNNING.with(|running| running.set(false));
        Ok(())
    }

    /// The caller's thread is by definition this executor's thread.
    fn in_executor(&self) -> bool {
        true
    }

    /// Promises bound to this executor complete on the waiting thread
    /// itself, so the deadlock guard does not apply.
    fn guards_blocking_calls(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_inline() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&ran);
        ImmediateExecutor
            .execute(Box::new(move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }))
            .unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn reentrant_submission_is_deferred() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        // records the order in which the tasks finish: with deferral, the
        // outer task finishes before the inner one starts
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let depth = Arc::new(AtomicUsize::new(0));
        let max_depth = Arc::new(AtomicUsize::new(0));

        let (order2, depth2, max2) = (Arc::clone(&order), Arc::clone(&depth), Arc::clone(&max_depth));
        ImmediateExecutor
            .execute(Box::new(move || {
                let d = depth2.fetch_add(1, Ordering::SeqCst) + 1;
                max2.fetch_max(d, Ordering::SeqCst);

                let (order3, depth3, max3) =
                    (Arc::clone(&order2), Arc::clone(&depth2), Arc::clone(&max2));
                ImmediateExecutor
                    .execute(Box::new(move || {
                        let d = depth3.fetch_add(1, Ordering::SeqCst) + 1;
                        max3.fetch_max(d, Ordering::SeqCst);
                        order3.lock().push("inner");
                        depth3.fetch_sub(1, Ordering::SeqCst);
                    }))
                    .unwrap();

                order2.lock().push("outer");
                depth2.fetch_sub(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert_eq!(*order.lock(), ["outer", "inner"]);
        // the inner task ran after the outer frame unwound
        assert_eq!(max_depth.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_does_not_stop_followups() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        ImmediateExecutor
            .execute(Box::new(move || {
                ImmediateExecutor
                    .execute(Box::new(move || flag.store(true, Ordering::SeqCst)))
                    .unwrap();
                panic!("boom");
            }))
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }
}
