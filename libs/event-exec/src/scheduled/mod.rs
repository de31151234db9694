// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadline-ordered tasks.
//!
//! A [`ScheduledTask`] is a record bound to one executor: a job, an absolute
//! deadline on the executor's ticker, an optional period, cancellation bits
//! and the slot it occupies in the executor-owned deadline heap. The heap is
//! mutated only from the worker thread; outside threads reach it by
//! submitting a task that performs the mutation (see [`engine`]).
//!
//! Period encoding: `0` is one-shot; `> 0` is fixed-rate, where the next
//! deadline is `previous deadline + period` — a run that falls behind fires
//! catch-up bursts rather than silently collapsing missed deadlines; `< 0`
//! is fixed-delay, where the next deadline is `completion time + |period|`.

pub(crate) mod engine;
pub(crate) mod heap;

use core::fmt;
use core::ops::Deref;
use core::time::Duration;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicIsize, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{Cause, RejectedError, panic_cause};
use crate::executor::{Executor, run_and_complete};
use crate::promise::Promise;
use crate::scheduled::engine::ScheduledHost;
use crate::scheduled::heap::{HeapNode, NOT_IN_HEAP};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct CancelState: u8 {
        /// Cancellation was requested.
        const REQUESTED = 1 << 0;
        /// The task reached the point of no return; cancellation is refused.
        const PROHIBITED = 1 << 1;
    }
}

enum Job {
    /// Completes its own promise (success, failure and uncancellable
    /// handling included); consumed on first run.
    Once(Option<Box<dyn FnOnce() + Send + 'static>>),
    Periodic(Box<dyn FnMut() + Send + 'static>),
}

/// The subset of promise operations the type-erased record needs.
pub(crate) trait PromiseControl: Send + Sync {
    fn try_cancel(&self) -> bool;
    fn try_fail(&self, cause: Cause) -> bool;
}

impl<T: Send + 'static> PromiseControl for Promise<T> {
    fn try_cancel(&self) -> bool {
        self.cancel()
    }

    fn try_fail(&self, cause: Cause) -> bool {
        self.try_failure(cause)
    }
}

/// How a repeating schedule derives its next deadline.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Period {
    FixedRate(Duration),
    FixedDelay(Duration),
}

/// A deadline-ordered task record; see the module docs.
pub(crate) struct ScheduledTask {
    /// Assigned by the owning engine at first enqueue; `0` means unassigned.
    /// Orders tasks with equal deadlines by submission.
    id: AtomicU64,
    deadline_nanos: AtomicU64,
    /// `0` one-shot, `> 0` fixed-rate, `< 0` fixed-delay (see module docs).
    period_nanos: i64,
    job: Mutex<Job>,
    promise: Box<dyn PromiseControl>,
    cancel_state: AtomicU8,
    heap_index: AtomicIsize,
    host: Weak<dyn ScheduledHost>,
}

// === impl ScheduledTask ===

impl ScheduledTask {
    fn new(
        job: Job,
        promise: Box<dyn PromiseControl>,
        deadline_nanos: u64,
        period_nanos: i64,
        host: Weak<dyn ScheduledHost>,
    ) -> Self {
        Self {
            id: AtomicU64::new(0),
            deadline_nanos: AtomicU64::new(deadline_nanos),
            period_nanos,
            job: Mutex::new(job),
            promise,
            cancel_state: AtomicU8::new(CancelState::empty().bits()),
            heap_index: AtomicIsize::new(NOT_IN_HEAP),
            host,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn assign_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub(crate) fn deadline_nanos(&self) -> u64 {
        self.deadline_nanos.load(Ordering::Relaxed)
    }

    fn host(&self) -> Option<Arc<dyn ScheduledHost>> {
        self.host.upgrade()
    }

    fn cancel_bits(&self) -> CancelState {
        CancelState::from_bits_truncate(self.cancel_state.load(Ordering::Acquire))
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_bits().contains(CancelState::REQUESTED)
    }

    /// CAS in the `REQUESTED` bit. Fails when cancellation was already
    /// requested or is prohibited.
    fn request_cancel(&self) -> bool {
        self.set_cancel_bit(CancelState::REQUESTED, CancelState::PROHIBITED)
    }

    /// CAS in the `PROHIBITED` bit. Fails when cancellation was already
    /// requested.
    fn prohibit_cancel(&self) -> bool {
        self.set_cancel_bit(CancelState::PROHIBITED, CancelState::REQUESTED)
    }

    fn set_cancel_bit(&self, bit: CancelState, unless: CancelState) -> bool {
        let mut current = self.cancel_bits();
        loop {
            if current.intersects(bit | unless) {
                return false;
            }
            match self.cancel_state.compare_exchange_weak(
                current.bits(),
                (current | bit).bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = CancelState::from_bits_truncate(actual),
            }
        }
    }

    /// Cancels the record and its promise without touching the heap. Used by
    /// `cancel_scheduled_tasks`, which clears the heap wholesale afterwards.
    ///
    /// Interrupt-if-running semantics are deliberately absent: a task that is
    /// already running is never interrupted, only its next firing suppressed.
    pub(crate) fn cancel_without_remove(&self) -> bool {
        if !self.request_cancel() {
            return false;
        }
        self.promise.try_cancel();
        true
    }

    /// Executes the record on the owning worker. See spec of the execution
    /// algorithm in the module docs.
    pub(crate) fn run(self: &Arc<Self>) {
        let Some(host) = self.host() else {
            return;
        };
        debug_assert!(host.in_loop(), "scheduled task run off-loop");

        let now = host.ticker_nanos();
        if self.deadline_nanos() > now {
            // woken early (e.g. a wakeup task ran ahead of the deadline):
            // put the record back unless it is already dead
            if !self.is_cancel_requested() {
                host.engine().insert(Arc::clone(self));
            }
            return;
        }

        if self.period_nanos == 0 {
            self.run_once();
        } else {
            self.run_periodic(&*host);
        }
    }

    fn run_once(&self) {
        // once running, cancel() must no longer win
        if !self.prohibit_cancel() {
            return;
        }
        let job = {
            let mut job = self.job.lock();
            match &mut *job {
                Job::Once(slot) => slot.take(),
                Job::Periodic(_) => unreachable!("one-shot record holding a periodic job"),
            }
        };
        if let Some(job) = job {
            // the closure completes the promise itself, panics included
            job();
        }
    }

    fn run_periodic(self: &Arc<Self>, host: &dyn ScheduledHost) {
        if self.is_cancel_requested() {
            return;
        }

        let outcome = {
            let mut job = self.job.lock();
            match &mut *job {
                Job::Periodic(f) => std::panic::catch_unwind(AssertUnwindSafe(f)),
                Job::Once(_) => unreachable!("periodic record holding a one-shot job"),
            }
        };

        if let Err(payload) = outcome {
            // a panicking firing ends the series and fails the promise
            self.promise.try_fail(panic_cause(payload));
            return;
        }

        if host.is_shutting_down() {
            return;
        }

        let next = if self.period_nanos > 0 {
            // fixed-rate: catch-up model, anchored on the previous deadline
            self.deadline_nanos()
                .saturating_add(unsigned(self.period_nanos))
        } else {
            // fixed-delay: anchored on completion time
            host.ticker_nanos().saturating_add(unsigned(-self.period_nanos))
        };
        self.deadline_nanos.store(next, Ordering::Relaxed);

        // the next instance is only admitted once this one has returned
        if !self.is_cancel_requested() {
            host.engine().insert(Arc::clone(self));
        }
    }
}

fn unsigned(nanos: i64) -> u64 {
    u64::try_from(nanos).expect("period sign already normalised")
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id())
            .field("deadline_nanos", &self.deadline_nanos())
            .field("period_nanos", &self.period_nanos)
            .field("cancel", &self.cancel_bits())
            .finish_non_exhaustive()
    }
}

/// `Arc<ScheduledTask>` as a heap node ordered by `(deadline, id)`.
#[derive(Clone, Debug)]
pub(crate) struct TaskRef(pub(crate) Arc<ScheduledTask>);

impl HeapNode for TaskRef {
    fn heap_index(&self) -> isize {
        self.0.heap_index.load(Ordering::Relaxed)
    }

    fn set_heap_index(&self, index: isize) {
        self.0.heap_index.store(index, Ordering::Relaxed);
    }

    fn precedes(&self, other: &Self) -> bool {
        (self.0.deadline_nanos(), self.0.id()) < (other.0.deadline_nanos(), other.0.id())
    }

    fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Handle to a scheduled task: the promise for its outcome plus
/// cancellation.
///
/// Dereferences to the underlying [`Promise`].
pub struct ScheduledHandle<T> {
    promise: Promise<T>,
    task: Arc<ScheduledTask>,
}

// === impl ScheduledHandle ===

impl<T: Send + 'static> ScheduledHandle<T> {
    /// The promise completed by this task.
    #[must_use]
    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    /// The absolute deadline of the (next) firing, in the owning executor's
    /// ticker nanos.
    #[must_use]
    pub fn deadline_nanos(&self) -> u64 {
        self.task.deadline_nanos()
    }

    /// Requests cancellation. Returns whether this call changed anything.
    ///
    /// A pending task is removed from the executor's heap (directly when
    /// called in-loop, via a submitted removal task otherwise) and its
    /// promise completes cancelled. A task that is currently running is not
    /// interrupted; for a periodic task the next firing is suppressed.
    pub fn cancel(&self) -> bool {
        if !self.task.request_cancel() {
            return false;
        }
        self.promise.cancel();

        if let Some(host) = self.task.host() {
            if host.in_loop() {
                host.engine().remove(&self.task);
            } else {
                let host2 = Arc::clone(&host);
                let task = Arc::clone(&self.task);
                let submitted = host.execute_internal(Box::new(move || {
                    host2.engine().remove(&task);
                    host2.removal_task_epilogue();
                }));
                if submitted.is_err() {
                    // the executor is gone; the heap dies with it
                    tracing::debug!("scheduled-task removal skipped, executor is shut down");
                }
            }
        }
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }
}

impl<T> Deref for ScheduledHandle<T> {
    type Target = Promise<T>;

    fn deref(&self) -> &Self::Target {
        &self.promise
    }
}

impl<T> fmt::Debug for ScheduledHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

/// Builds and submits a one-shot record. `delay` is measured on the host's
/// ticker; a zero delay makes the task immediately eligible.
pub(crate) fn schedule_one_shot<V, F>(
    host: &Arc<dyn ScheduledHost>,
    executor: Arc<dyn Executor>,
    delay: Duration,
    f: F,
) -> Result<ScheduledHandle<V>, RejectedError>
where
    V: Send + 'static,
    F: FnOnce() -> V + Send + 'static,
{
    let promise = Promise::new(executor);
    let completion = promise.clone();
    let job = Job::Once(Some(Box::new(move || run_and_complete(&completion, f))));

    let deadline = host.ticker_nanos().saturating_add(ticker::duration_to_nanos(delay));
    let task = Arc::new(ScheduledTask::new(
        job,
        Box::new(promise.clone()),
        deadline,
        0,
        Arc::downgrade(host),
    ));
    engine::submit(host, Arc::clone(&task))?;
    Ok(ScheduledHandle { promise, task })
}

/// Builds and submits a periodic record.
///
/// # Panics
///
/// Panics on a zero period; that is an API misuse, not a schedulable value.
pub(crate) fn schedule_periodic<F>(
    host: &Arc<dyn ScheduledHost>,
    executor: Arc<dyn Executor>,
    initial_delay: Duration,
    period: Period,
    f: F,
) -> Result<ScheduledHandle<()>, RejectedError>
where
    F: FnMut() + Send + 'static,
{
    let period_nanos = match period {
        Period::FixedRate(period) => signed_period(period),
        Period::FixedDelay(delay) => -signed_period(delay),
    };

    let promise = Promise::new(executor);
    let job = Job::Periodic(Box::new(f));

    let deadline = host
        .ticker_nanos()
        .saturating_add(ticker::duration_to_nanos(initial_delay));
    let task = Arc::new(ScheduledTask::new(
        job,
        Box::new(promise.clone()),
        deadline,
        period_nanos,
        Arc::downgrade(host),
    ));
    engine::submit(host, Arc::clone(&task))?;
    Ok(ScheduledHandle { promise, task })
}

fn signed_period(period: Duration) -> i64 {
    assert!(!period.is_zero(), "period must be positive");
    i64::try_from(period.as_nanos()).unwrap_or(i64::MAX)
}
