// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A writable, listenable future.
//!
//! The state lives in a single atomic cell driven by compare-and-swap:
//!
//! ```text
//! INCOMPLETE ──▶ UNCANCELLABLE ──▶ COMPLETING ──▶ SUCCESS | FAILED
//!      │                               ▲
//!      └────────── cancel ─────────────┴──▶ CANCELLED
//! ```
//!
//! `COMPLETING` is the exclusive-write window: the winner of the CAS stores
//! the outcome value, then publishes the terminal state with a release store.
//! Readers observe terminal states with an acquire load and may then read the
//! outcome without further synchronisation.
//!
//! Listeners are notified on the promise's associated executor. When the
//! completing thread *is* that executor, notification runs inline, bounded by
//! a per-thread stack-depth guard; past the guard the remaining work is
//! re-submitted to the executor to unwind the stack. Listener panics are
//! logged at warn and never poison the promise.

mod combiner;
mod notifier;

pub use combiner::PromiseCombiner;
pub use notifier::{cascade, propagate_outcome};

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::hint;
use core::time::Duration;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use fast_local::FastLocal;
use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;

use crate::config;
use crate::error::{AwaitError, Cancelled, Cause, SyncError};
use crate::executor::Executor;

const INCOMPLETE: u8 = 0;
const UNCANCELLABLE: u8 = 1;
const COMPLETING: u8 = 2;
const SUCCESS: u8 = 3;
const FAILED: u8 = 4;
const CANCELLED: u8 = 5;

enum Outcome<T> {
    Success(T),
    Failed(Cause),
    Cancelled,
}

type Listener<T> = Box<dyn FnOnce(&Promise<T>) + Send + 'static>;

struct ListenerSet<T> {
    listeners: Vec<Listener<T>>,
    /// A drain is in progress; late additions are picked up by the drainer.
    notifying: bool,
    waiters: usize,
}

struct Inner<T> {
    state: AtomicU8,
    /// Written exactly once, inside the `COMPLETING` window.
    outcome: UnsafeCell<Option<Outcome<T>>>,
    executor: Arc<dyn Executor>,
    set: Mutex<ListenerSet<T>>,
    done: Condvar,
}

// Safety: `outcome` is written once under the COMPLETING exclusion window
// and only read after an acquire load of a terminal state; everything else
// is atomics and locks.
unsafe impl<T: Send> Send for Inner<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Inner<T> {}

/// A writable future: a handle whose outcome may be set exactly once.
///
/// Handles are cheap to clone and all refer to the same underlying cell.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

assert_impl_all!(Promise<u32>: Send, Sync);

fn listener_depth() -> &'static FastLocal<Cell<usize>> {
    static DEPTH: OnceLock<FastLocal<Cell<usize>>> = OnceLock::new();
    DEPTH.get_or_init(FastLocal::new)
}

// === impl Promise ===

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Creates an incomplete promise whose listeners will be notified on
    /// `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(INCOMPLETE),
                outcome: UnsafeCell::new(None),
                executor,
                set: Mutex::new(ListenerSet {
                    listeners: Vec::new(),
                    notifying: false,
                    waiters: 0,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// An incomplete promise notified on the caller's thread (the immediate
    /// executor).
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(crate::immediate::ImmediateExecutor::shared_dyn())
    }

    /// The executor this promise notifies its listeners on.
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    // --- completion ---

    /// Marks this promise successful with `value`.
    ///
    /// # Panics
    ///
    /// Panics if the promise is already complete.
    pub fn set_success(&self, value: T) {
        assert!(self.try_success(value), "promise already complete");
    }

    /// Marks this promise successful; returns whether this call effected the
    /// transition.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(Outcome::Success(value), true)
    }

    /// Marks this promise failed with `cause`.
    ///
    /// # Panics
    ///
    /// Panics if the promise is already complete.
    pub fn set_failure(&self, cause: Cause) {
        assert!(self.try_failure(cause), "promise already complete");
    }

    /// Marks this promise failed; returns whether this call effected the
    /// transition.
    pub fn try_failure(&self, cause: Cause) -> bool {
        self.complete(Outcome::Failed(cause), true)
    }

    /// Cancels this promise. Succeeds only while the promise is incomplete
    /// and not marked uncancellable.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled, false)
    }

    /// Blocks future cancellation.
    ///
    /// Returns `false` only when the promise is already cancelled.
    pub fn set_uncancellable(&self) -> bool {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                INCOMPLETE => {
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            INCOMPLETE,
                            UNCANCELLABLE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
                UNCANCELLABLE | SUCCESS | FAILED => return true,
                CANCELLED => return false,
                // a completion is in flight; its terminal state decides
                COMPLETING => hint::spin_loop(),
                _ => unreachable!("invalid promise state"),
            }
        }
    }

    fn complete(&self, outcome: Outcome<T>, from_uncancellable: bool) -> bool {
        loop {
            let state = self.inner.state.load(Ordering::Acquire);
            let allowed = state == INCOMPLETE || (from_uncancellable && state == UNCANCELLABLE);
            if !allowed {
                if state == COMPLETING {
                    // another completer owns the write window; it wins
                    hint::spin_loop();
                    continue;
                }
                return false;
            }
            if self
                .inner
                .state
                .compare_exchange_weak(state, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let terminal = match &outcome {
            Outcome::Success(_) => SUCCESS,
            Outcome::Failed(_) => FAILED,
            Outcome::Cancelled => CANCELLED,
        };
        // Safety: the COMPLETING CAS above makes this the only writer, and
        // no reader dereferences the cell until the release store below.
        unsafe {
            *self.inner.outcome.get() = Some(outcome);
        }
        self.inner.state.store(terminal, Ordering::Release);

        {
            let set = self.inner.set.lock();
            if set.waiters > 0 {
                self.inner.done.notify_all();
            }
        }
        self.notify_listeners();
        true
    }

    // --- queries ---

    fn terminal_state(&self) -> Option<u8> {
        let state = self.inner.state.load(Ordering::Acquire);
        (state >= SUCCESS).then_some(state)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.terminal_state().is_some()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.terminal_state() == Some(SUCCESS)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.terminal_state() == Some(CANCELLED)
    }

    /// Whether the promise can still be cancelled.
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == INCOMPLETE
    }

    fn with_outcome<R>(&self, f: impl FnOnce(&Outcome<T>) -> R) -> Option<R> {
        self.terminal_state()?;
        // Safety: a terminal state means the outcome was written inside the
        // COMPLETING window and will never be mutated again.
        let outcome = unsafe { (*self.inner.outcome.get()).as_ref() }?;
        Some(f(outcome))
    }

    /// The failure cause, if the promise failed or was cancelled.
    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        self.with_outcome(|outcome| match outcome {
            Outcome::Failed(cause) => Some(Arc::clone(cause)),
            Outcome::Cancelled => Some(Arc::new(Cancelled) as Cause),
            Outcome::Success(_) => None,
        })
        .flatten()
    }

    /// The success value, if the promise already succeeded.
    #[must_use]
    pub fn get_now(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with_outcome(|outcome| match outcome {
            Outcome::Success(value) => Some(value.clone()),
            _ => None,
        })
        .flatten()
    }

    // --- blocking ---

    fn check_deadlock(&self) -> Result<(), AwaitError> {
        let executor = &self.inner.executor;
        if executor.guards_blocking_calls() && executor.in_executor() {
            return Err(AwaitError::Deadlock);
        }
        Ok(())
    }

    /// Blocks until the promise completes.
    ///
    /// # Errors
    ///
    /// [`AwaitError::Deadlock`] when called from the promise's own executor
    /// thread.
    pub fn await_done(&self) -> Result<(), AwaitError> {
        if self.is_done() {
            return Ok(());
        }
        self.check_deadlock()?;

        let mut set = self.inner.set.lock();
        while !self.is_done() {
            set.waiters += 1;
            self.inner.done.wait(&mut set);
            set.waiters -= 1;
        }
        Ok(())
    }

    /// Blocks until the promise completes or `timeout` elapses; returns
    /// whether it completed.
    ///
    /// The deadline is captured on entry against the monotonic clock.
    ///
    /// # Errors
    ///
    /// [`AwaitError::Deadlock`] when called from the promise's own executor
    /// thread.
    pub fn await_timeout(&self, timeout: Duration) -> Result<bool, AwaitError> {
        if self.is_done() {
            return Ok(true);
        }
        self.check_deadlock()?;
        let deadline = Instant::now() + timeout;

        let mut set = self.inner.set.lock();
        while !self.is_done() {
            set.waiters += 1;
            let timed_out = self.inner.done.wait_until(&mut set, deadline).timed_out();
            set.waiters -= 1;
            if timed_out {
                return Ok(self.is_done());
            }
        }
        Ok(true)
    }

    /// Blocks until the promise completes, then re-raises a non-successful
    /// outcome.
    ///
    /// # Errors
    ///
    /// [`SyncError::Deadlock`] when called in-loop, [`SyncError::Cancelled`]
    /// or [`SyncError::Failed`] mirroring the terminal state.
    pub fn sync(&self) -> Result<(), SyncError> {
        self.await_done()?;
        match self.terminal_state() {
            Some(SUCCESS) => Ok(()),
            Some(CANCELLED) => Err(SyncError::Cancelled),
            _ => Err(SyncError::Failed(
                self.cause().unwrap_or_else(|| Arc::new(Cancelled)),
            )),
        }
    }

    // --- listeners ---

    /// Registers `listener` to run when the promise completes. A listener
    /// added after completion is still delivered, exactly once, through the
    /// promise's executor.
    pub fn add_listener(&self, listener: impl FnOnce(&Promise<T>) + Send + 'static) {
        let already_done = {
            let mut set = self.inner.set.lock();
            set.listeners.push(Box::new(listener));
            self.is_done()
        };
        if already_done {
            self.notify_listeners();
        }
    }

    fn notify_listeners(&self) {
        let executor = &self.inner.executor;
        if executor.in_executor() {
            let depth = listener_depth();
            let current = depth.get_or_init(|| Cell::new(0)).get();
            if current < config::max_listener_stack_depth() {
                let _ = depth.with(|cell| cell.set(current + 1));
                self.notify_listeners_now();
                let _ = depth.with(|cell| cell.set(current));
                return;
            }
        }

        // off-loop, or the stack is deep enough: unwind through the executor
        let this = self.clone();
        let task = Box::new(move || this.notify_listeners_now());
        if let Err(err) = executor.execute(task) {
            tracing::warn!(
                error = %err,
                "promise executor rejected listener notification, falling back to the global executor"
            );
            let this = self.clone();
            let _ = crate::global::GlobalExecutor::shared()
                .to_dyn()
                .execute(Box::new(move || this.notify_listeners_now()));
        }
    }

    fn notify_listeners_now(&self) {
        let mut batch = {
            let mut set = self.inner.set.lock();
            if set.notifying || set.listeners.is_empty() {
                return;
            }
            set.notifying = true;
            core::mem::take(&mut set.listeners)
        };

        loop {
            for listener in batch {
                self.invoke(listener);
            }
            let mut set = self.inner.set.lock();
            if set.listeners.is_empty() {
                set.notifying = false;
                return;
            }
            // listeners added while we were outside the lock
            batch = core::mem::take(&mut set.listeners);
        }
    }

    fn invoke(&self, listener: Listener<T>) {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
            tracing::warn!("promise listener panicked");
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            INCOMPLETE => "incomplete",
            UNCANCELLABLE => "uncancellable",
            COMPLETING => "completing",
            SUCCESS => "success",
            FAILED => "failed",
            CANCELLED => "cancelled",
            _ => "invalid",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn failure() -> Cause {
        #[derive(Debug)]
        struct Boom;
        impl fmt::Display for Boom {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad("boom")
            }
        }
        impl core::error::Error for Boom {}
        Arc::new(Boom)
    }

    #[test]
    fn success_is_terminal() {
        let promise = Promise::immediate();
        promise.set_success(7_u32);
        assert!(promise.is_done());
        assert!(promise.is_success());
        assert_eq!(promise.get_now(), Some(7));
        assert!(promise.cause().is_none());

        assert!(!promise.try_success(8));
        assert!(!promise.try_failure(failure()));
        assert!(!promise.cancel());
        assert_eq!(promise.get_now(), Some(7));
    }

    #[test]
    #[should_panic(expected = "promise already complete")]
    fn double_set_panics() {
        let promise = Promise::immediate();
        promise.set_success(1_u32);
        promise.set_success(2);
    }

    #[test]
    fn failure_carries_cause() {
        let promise = Promise::<u32>::immediate();
        promise.set_failure(failure());
        assert!(promise.is_done());
        assert!(!promise.is_success());
        assert_eq!(promise.cause().unwrap().to_string(), "boom");
        assert!(matches!(promise.sync(), Err(SyncError::Failed(_))));
    }

    #[test]
    fn cancellation() {
        let promise = Promise::<u32>::immediate();
        assert!(promise.is_cancellable());
        assert!(promise.cancel());
        assert!(promise.is_cancelled());
        assert!(!promise.try_success(1));
        assert!(matches!(promise.sync(), Err(SyncError::Cancelled)));
        assert_eq!(promise.cause().unwrap().to_string(), "cancelled");
    }

    #[test]
    fn uncancellable_blocks_cancel() {
        let promise = Promise::<u32>::immediate();
        assert!(promise.set_uncancellable());
        assert!(!promise.cancel());
        assert!(promise.try_success(1));
        assert!(promise.is_success());
    }

    #[test]
    fn uncancellable_after_cancel_reports_false() {
        let promise = Promise::<u32>::immediate();
        assert!(promise.cancel());
        assert!(!promise.set_uncancellable());
    }

    #[test]
    fn uncancellable_after_success_reports_true() {
        let promise = Promise::immediate();
        promise.set_success(1_u32);
        assert!(promise.set_uncancellable());
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let promise = Promise::immediate();
        for i in 0..4 {
            let order = Arc::clone(&order);
            promise.add_listener(move |_| order.lock().push(i));
        }
        promise.set_success(());
        assert_eq!(*order.lock(), [0, 1, 2, 3]);
    }

    #[test]
    fn late_listener_is_still_delivered() {
        let promise = Promise::immediate();
        promise.set_success(1_u32);

        let delivered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered);
        promise.add_listener(move |p| {
            assert_eq!(p.get_now(), Some(1));
            flag.store(true, Ordering::SeqCst);
        });
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[test]
    fn listener_added_by_listener_runs() {
        let promise = Promise::immediate();
        promise.set_success(());

        let count = Arc::new(AtomicUsize::new(0));
        let outer_count = Arc::clone(&count);
        promise.add_listener(move |p| {
            outer_count.fetch_add(1, Ordering::SeqCst);
            let inner_count = Arc::clone(&outer_count);
            p.add_listener(move |_| {
                inner_count.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let promise = Promise::immediate();
        let ran = Arc::new(AtomicBool::new(false));
        promise.add_listener(|_| panic!("listener boom"));
        let flag = Arc::clone(&ran);
        promise.add_listener(move |_| flag.store(true, Ordering::SeqCst));
        promise.set_success(());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn nested_notification_respects_stack_depth_guard() {
        // a chain of promises, each completing the next from inside a
        // listener; the recorded depth must never exceed the configured
        // bound even though the chain is much longer
        let max = config::max_listener_stack_depth();
        let chain_len = max * 4;

        let observed_max = Arc::new(AtomicUsize::new(0));
        let depth = Arc::new(AtomicUsize::new(0));

        let promises: Vec<Promise<()>> = (0..chain_len).map(|_| Promise::immediate()).collect();
        for i in 0..chain_len {
            let next = promises.get(i + 1).cloned();
            let depth = Arc::clone(&depth);
            let observed_max = Arc::clone(&observed_max);
            promises[i].add_listener(move |_| {
                let d = depth.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(d, Ordering::SeqCst);
                if let Some(next) = next {
                    next.set_success(());
                }
                depth.fetch_sub(1, Ordering::SeqCst);
            });
        }

        promises[0].set_success(());

        for promise in &promises {
            assert!(promise.is_done());
        }
        assert!(
            observed_max.load(Ordering::SeqCst) <= max,
            "observed nesting {} exceeded bound {max}",
            observed_max.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn await_done_blocks_until_completion() {
        let promise = Promise::immediate();
        let waiter = {
            let promise = promise.clone();
            thread::spawn(move || {
                promise.await_done().unwrap();
                promise.get_now()
            })
        };
        thread::sleep(Duration::from_millis(20));
        promise.set_success(42_u32);
        assert_eq!(waiter.join().unwrap(), Some(42));
    }

    #[test]
    fn await_timeout_reports_incomplete() {
        let promise = Promise::<u32>::immediate();
        assert_eq!(promise.await_timeout(Duration::from_millis(10)), Ok(false));
        promise.set_success(1);
        assert_eq!(promise.await_timeout(Duration::from_millis(10)), Ok(true));
    }

    #[test]
    fn deadlock_guard_rejects_in_loop_waits() {
        struct InLoop;
        impl Executor for InLoop {
            fn execute(&self, task: crate::executor::Task) -> Result<(), crate::error::RejectedError> {
                task();
                Ok(())
            }
            fn in_executor(&self) -> bool {
                true
            }
        }

        let promise = Promise::<u32>::new(Arc::new(InLoop));
        assert_eq!(promise.await_done(), Err(AwaitError::Deadlock));
        assert_eq!(
            promise.await_timeout(Duration::from_millis(1)),
            Err(AwaitError::Deadlock)
        );
        assert!(matches!(promise.sync(), Err(SyncError::Deadlock)));
    }

    #[test]
    fn immediate_executor_opts_out_of_deadlock_guard() {
        let promise = Promise::<u32>::immediate();
        // not complete, executor is "in loop" by definition, but blocking is
        // allowed; use a timed wait so the test terminates
        assert_eq!(promise.await_timeout(Duration::from_millis(5)), Ok(false));
    }

    #[test]
    fn concurrent_completion_has_single_winner() {
        let promise = Promise::<usize>::immediate();
        let racers: Vec<_> = (0..8)
            .map(|i| {
                let promise = promise.clone();
                thread::spawn(move || promise.try_success(i))
            })
            .collect();
        let winners = racers
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(promise.is_success());
    }
}
