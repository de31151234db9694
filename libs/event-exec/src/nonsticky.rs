// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ordered virtual executors on top of a group.
//!
//! A [`NonStickyExecutor`] serialises its own submissions through an
//! internal MPSC queue and a single drain task on the backing child, so
//! callers get FIFO ordering without being pinned to one worker forever: the
//! drain runs at most `max_tasks_per_run` tasks per turn and re-submits
//! itself while work remains. A `{NONE, SUBMITTED, RUNNING}` state machine
//! guarantees at most one outstanding drain per virtual executor.

use core::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use mpsc_queue::MpscArrayQueue;
use static_assertions::assert_impl_all;

use crate::config;
use crate::error::RejectedError;
use crate::executor::{Executor, Task};
use crate::group::ExecutorGroup;
use crate::single_thread::SingleThreadExecutor;

const NONE: u8 = 0;
const SUBMITTED: u8 = 1;
const RUNNING: u8 = 2;

/// Wraps a group and hands out ordered virtual executors.
#[derive(Clone)]
pub struct NonStickyGroup {
    group: ExecutorGroup,
    max_tasks_per_run: usize,
}

/// An ordered virtual executor on top of one chosen child; see the module
/// docs.
#[derive(Clone)]
pub struct NonStickyExecutor {
    inner: Arc<NonStickyInner>,
}

assert_impl_all!(NonStickyExecutor: Send, Sync);

struct NonStickyInner {
    child: SingleThreadExecutor,
    state: AtomicU8,
    tasks: MpscArrayQueue<Task>,
    max_tasks_per_run: usize,
    /// Fast-local id of the thread currently draining; `0` when idle.
    running_thread: AtomicU64,
}

// === impl NonStickyGroup ===

impl NonStickyGroup {
    /// Wraps `group`; each drain turn runs at most `max_tasks_per_run`
    /// tasks before yielding the child back to other users.
    #[must_use]
    pub fn new(group: ExecutorGroup, max_tasks_per_run: usize) -> Self {
        Self {
            group,
            max_tasks_per_run: max_tasks_per_run.max(1),
        }
    }

    /// A fresh ordered virtual executor over the next chosen child.
    #[must_use]
    pub fn next(&self) -> NonStickyExecutor {
        NonStickyExecutor {
            inner: Arc::new(NonStickyInner {
                child: self.group.next().clone(),
                state: AtomicU8::new(NONE),
                tasks: MpscArrayQueue::with_capacity(config::max_pending_tasks()),
                max_tasks_per_run: self.max_tasks_per_run,
                running_thread: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn group(&self) -> &ExecutorGroup {
        &self.group
    }
}

impl fmt::Debug for NonStickyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonStickyGroup")
            .field("max_tasks_per_run", &self.max_tasks_per_run)
            .finish_non_exhaustive()
    }
}

// === impl NonStickyExecutor ===

impl Executor for NonStickyExecutor {
    fn execute(&self, task: Task) -> Result<(), RejectedError> {
        if self.inner.tasks.try_enqueue(task).is_err() {
            return Err(RejectedError::QueueFull);
        }
        self.inner.submit_drain()
    }

    fn in_executor(&self) -> bool {
        let running = self.inner.running_thread.load(Ordering::Acquire);
        running != 0 && running == fast_local::current_thread_id()
    }
}

impl fmt::Debug for NonStickyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonStickyExecutor")
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .field("pending", &self.inner.tasks.len())
            .finish_non_exhaustive()
    }
}

// === impl NonStickyInner ===

impl NonStickyInner {
    /// Ensures exactly one drain task is outstanding.
    fn submit_drain(self: &Arc<Self>) -> Result<(), RejectedError> {
        loop {
            match self.state.load(Ordering::Acquire) {
                NONE => {
                    if self
                        .state
                        .compare_exchange(NONE, SUBMITTED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let this = Arc::clone(self);
                        if let Err(rejected) = self.child.execute(Box::new(move || this.drain())) {
                            // nobody will drain; undo so a later submission
                            // can retry
                            self.state.store(NONE, Ordering::Release);
                            return Err(rejected);
                        }
                        return Ok(());
                    }
                }
                SUBMITTED | RUNNING => return Ok(()),
                state => unreachable!("invalid non-sticky state {state}"),
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(SUBMITTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.running_thread
            .store(fast_local::current_thread_id(), Ordering::Release);

        loop {
            let mut ran = 0;
            while ran < self.max_tasks_per_run {
                let Some(task) = self.tasks.try_dequeue() else {
                    break;
                };
                if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::warn!("task on a non-sticky executor panicked");
                }
                ran += 1;
            }

            if ran == self.max_tasks_per_run {
                // budget spent: yield the child, keep the claim
                self.state.store(SUBMITTED, Ordering::Release);
                self.running_thread.store(0, Ordering::Release);
                let this = Arc::clone(self);
                if self.child.execute(Box::new(move || this.drain())).is_ok() {
                    return;
                }
                // the child refused the hand-off; keep draining here
                self.state.store(RUNNING, Ordering::Release);
                self.running_thread
                    .store(fast_local::current_thread_id(), Ordering::Release);
                continue;
            }

            self.running_thread.store(0, Ordering::Release);
            self.state.store(NONE, Ordering::Release);
            // a producer may have enqueued between our last dequeue and the
            // release above; reclaim the drain if so
            if self.tasks.is_empty()
                || self
                    .state
                    .compare_exchange(NONE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
            self.running_thread
                .store(fast_local::current_thread_id(), Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Lifecycle;
    use core::time::Duration;
    use parking_lot::Mutex;
    use std::sync::mpsc;

    fn drained(executor: &NonStickyExecutor) {
        let (tx, rx) = mpsc::channel();
        executor
            .execute(Box::new(move || {
                tx.send(()).unwrap();
            }))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn preserves_fifo_order() {
        let group = ExecutorGroup::new(4);
        let wrapper = NonStickyGroup::new(group.clone(), 3);
        let executor = wrapper.next();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let order = Arc::clone(&order);
            executor
                .execute(Box::new(move || order.lock().push(i)))
                .unwrap();
        }

        drained(&executor);
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn tasks_never_overlap() {
        let group = ExecutorGroup::new(2);
        let wrapper = NonStickyGroup::new(group.clone(), 1);
        let executor = wrapper.next();

        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let overlapped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        for _ in 0..32 {
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);
            executor
                .execute(Box::new(move || {
                    if active.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    std::thread::yield_now();
                    active.fetch_sub(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        drained(&executor);
        assert!(!overlapped.load(Ordering::SeqCst));
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn in_executor_only_while_draining() {
        let group = ExecutorGroup::new(2);
        let wrapper = NonStickyGroup::new(group.clone(), 8);
        let executor = wrapper.next();

        assert!(!executor.in_executor());
        let (tx, rx) = mpsc::channel();
        {
            let executor2 = executor.clone();
            executor
                .execute(Box::new(move || {
                    tx.send(executor2.in_executor()).unwrap();
                }))
                .unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn distinct_virtual_executors_are_independent() {
        let group = ExecutorGroup::new(2);
        let wrapper = NonStickyGroup::new(group.clone(), 4);
        let a = wrapper.next();
        let b = wrapper.next();

        drained(&a);
        drained(&b);
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }
}
