// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The capability seams every executor implements.
//!
//! Instead of an inheritance chain, executors compose two small traits:
//! [`Executor`] (task submission plus thread affinity) and [`Lifecycle`]
//! (graceful shutdown). Algorithms shared between executors — typed
//! submission, `invoke_all`/`invoke_any` — live here as free helpers over
//! `Arc<dyn Executor>`.

use core::time::Duration;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::error::{Cause, InvokeError, RejectedError, panic_cause};
use crate::promise::Promise;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs submitted tasks and knows whether the calling thread
/// is its worker.
pub trait Executor: Send + Sync {
    /// Enqueues `task` for execution.
    ///
    /// # Errors
    ///
    /// [`RejectedError::QueueFull`] when the task queue is at capacity and
    /// the rejection policy declines to wait, [`RejectedError::Shutdown`]
    /// once the executor no longer accepts work. A rejected task never runs;
    /// an accepted task runs at most once.
    fn execute(&self, task: Task) -> Result<(), RejectedError>;

    /// Whether the calling thread is this executor's worker thread.
    ///
    /// Everything single-threaded in this crate hangs off this check: code
    /// running "in-loop" may touch executor-owned state directly, everything
    /// else must go through [`Executor::execute`].
    fn in_executor(&self) -> bool;

    /// Whether blocking waits on promises bound to this executor must be
    /// refused in-loop. The immediate executor opts out.
    fn guards_blocking_calls(&self) -> bool {
        true
    }
}

/// Graceful-shutdown surface of an executor or executor group.
pub trait Lifecycle {
    /// Starts a graceful shutdown: new work keeps being accepted until the
    /// quiet period — a window of `quiet_period` with no task activity —
    /// elapses, or until `timeout` caps the wait. Returns the termination
    /// future.
    ///
    /// # Panics
    ///
    /// Panics if `quiet_period` exceeds `timeout`.
    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()>;

    /// A promise completed once the executor (or every child of a group) has
    /// fully terminated.
    fn termination_future(&self) -> Promise<()>;

    /// Whether a shutdown has been initiated.
    fn is_shutting_down(&self) -> bool;

    /// Whether the executor stopped accepting work.
    fn is_shutdown(&self) -> bool;

    /// Whether the executor has fully terminated.
    fn is_terminated(&self) -> bool;

    /// Blocks until termination or until `timeout` elapses; returns whether
    /// the executor terminated.
    fn await_termination(&self, timeout: Duration) -> bool {
        self.termination_future()
            .await_timeout(timeout)
            .unwrap_or(false)
    }
}

/// Runs `f`, completing `promise` with its outcome. Panics become the
/// promise's failure cause; a promise already cancelled skips the run.
pub(crate) fn run_and_complete<V: Send + 'static>(promise: &Promise<V>, f: impl FnOnce() -> V) {
    if !promise.set_uncancellable() {
        // cancelled before it ran
        return;
    }
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => {
            promise.try_success(value);
        }
        Err(payload) => {
            promise.try_failure(panic_cause(payload));
        }
    }
}

/// Submits `f` onto `executor`, returning a promise for its result.
pub(crate) fn submit_with<V, F>(
    executor: &Arc<dyn Executor>,
    f: F,
) -> Result<Promise<V>, RejectedError>
where
    V: Send + 'static,
    F: FnOnce() -> V + Send + 'static,
{
    let promise = Promise::new(Arc::clone(executor));
    let completion = promise.clone();
    executor.execute(Box::new(move || run_and_complete(&completion, f)))?;
    Ok(promise)
}

/// Submits every task and blocks until each has completed (or `timeout`
/// elapsed, in which case still-pending promises are cancelled). The caller
/// must not be the executor's own worker thread.
///
/// # Panics
///
/// Panics when called in-loop; blocking there would deadlock the executor.
pub(crate) fn invoke_all<V, F>(
    executor: &Arc<dyn Executor>,
    tasks: Vec<F>,
    timeout: Option<Duration>,
) -> Result<Vec<Promise<V>>, RejectedError>
where
    V: Send + 'static,
    F: FnOnce() -> V + Send + 'static,
{
    assert!(
        !executor.in_executor(),
        "invoke_all must not be called from the executor it submits to"
    );

    let deadline = timeout.map(|t| Instant::now() + t);
    let promises = tasks
        .into_iter()
        .map(|f| submit_with(executor, f))
        .collect::<Result<Vec<_>, _>>()?;

    for promise in &promises {
        match deadline {
            None => {
                let _ = promise.await_done();
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match promise.await_timeout(remaining) {
                    Ok(true) => {}
                    _ => {
                        // out of time: suppress whatever has not started yet
                        promise.cancel();
                    }
                }
            }
        }
    }
    Ok(promises)
}

/// Submits every task and blocks until the first succeeds, failing with the
/// first observed cause only when all of them fail. Remaining tasks are
/// cancelled once an outcome is decided.
///
/// # Panics
///
/// Panics when called in-loop, or when `tasks` is empty.
pub(crate) fn invoke_any<V, F>(
    executor: &Arc<dyn Executor>,
    tasks: Vec<F>,
    timeout: Option<Duration>,
) -> Result<V, InvokeError>
where
    V: Clone + Send + 'static,
    F: FnOnce() -> V + Send + 'static,
{
    assert!(
        !executor.in_executor(),
        "invoke_any must not be called from the executor it submits to"
    );
    assert!(!tasks.is_empty(), "invoke_any requires at least one task");

    let total = tasks.len();
    let outcome: Promise<V> = Promise::new(crate::immediate::ImmediateExecutor::shared_dyn());
    let failed = Arc::new(AtomicUsize::new(0));
    let first_cause: Arc<parking_lot::Mutex<Option<Cause>>> =
        Arc::new(parking_lot::Mutex::new(None));

    let mut promises = Vec::with_capacity(total);
    for f in tasks {
        let promise = submit_with(executor, f)?;
        let outcome = outcome.clone();
        let failed = Arc::clone(&failed);
        let first_cause = Arc::clone(&first_cause);
        promise.add_listener(move |done| {
            if done.is_success() {
                if let Some(value) = done.get_now() {
                    outcome.try_success(value);
                }
            } else {
                if let Some(cause) = done.cause() {
                    first_cause.lock().get_or_insert(cause);
                }
                if failed.fetch_add(1, Ordering::AcqRel) + 1 == total {
                    let cause = first_cause
                        .lock()
                        .clone()
                        .unwrap_or_else(|| Arc::new(crate::error::Cancelled));
                    outcome.try_failure(cause);
                }
            }
        });
        promises.push(promise);
    }

    let completed = match timeout {
        None => {
            let _ = outcome.await_done();
            true
        }
        Some(timeout) => outcome.await_timeout(timeout).unwrap_or(false),
    };

    // whatever has not run yet is no longer needed
    for promise in &promises {
        promise.cancel();
    }

    if !completed {
        return Err(InvokeError::TimedOut);
    }
    if let Some(value) = outcome.get_now() {
        return Ok(value);
    }
    Err(InvokeError::Failed(
        outcome
            .cause()
            .unwrap_or_else(|| Arc::new(crate::error::Cancelled)),
    ))
}
