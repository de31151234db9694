// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide fallback executor.
//!
//! A single on-demand worker thread that starts with the first submission
//! and exits again after a quiet interval (default one second, see
//! [`config::global_quiet_period`]) with no tasks and no scheduled work.
//! Used as a safety net for listener callbacks whose natural executor is
//! gone, and as the home of termination promises.
//!
//! The global executor never shuts down; it has no [`Lifecycle`].
//!
//! [`Lifecycle`]: crate::executor::Lifecycle

use core::time::Duration;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;
use ticker::{SystemTicker, Ticker};

use crate::config;
use crate::error::RejectedError;
use crate::executor::{Executor, Task};
use crate::promise::Promise;
use crate::scheduled::engine::{Engine, ScheduledHost};
use crate::scheduled::{Period, ScheduledHandle};

/// Handle to the process-wide executor; see the module docs.
#[derive(Clone)]
pub struct GlobalExecutor {
    inner: Arc<GlobalInner>,
}

assert_impl_all!(GlobalExecutor: Send, Sync);

struct GlobalInner {
    self_weak: Weak<GlobalInner>,
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    engine: Engine,
    ticker: Arc<dyn Ticker>,
    /// Whether a worker thread currently exists (or is being spawned).
    started: AtomicBool,
    worker_thread: AtomicU64,
    /// Signals worker exit for [`GlobalExecutor::await_inactivity`].
    lifecycle: Mutex<u64>,
    stopped: Condvar,
    quiet_period: Duration,
}

// === impl GlobalExecutor ===

impl GlobalExecutor {
    /// The shared instance.
    pub fn shared() -> GlobalExecutor {
        static SHARED: OnceLock<GlobalExecutor> = OnceLock::new();
        SHARED
            .get_or_init(|| GlobalExecutor {
                inner: Arc::new_cyclic(|self_weak| GlobalInner {
                    self_weak: self_weak.clone(),
                    queue: Mutex::new(VecDeque::new()),
                    available: Condvar::new(),
                    engine: Engine::new(),
                    ticker: SystemTicker::shared(),
                    started: AtomicBool::new(false),
                    worker_thread: AtomicU64::new(0),
                    lifecycle: Mutex::new(0),
                    stopped: Condvar::new(),
                    quiet_period: config::global_quiet_period(),
                }),
            })
            .clone()
    }

    pub(crate) fn to_dyn(&self) -> Arc<dyn Executor> {
        Arc::new(self.clone())
    }

    fn host(&self) -> Arc<dyn ScheduledHost> {
        self.inner.clone()
    }

    /// Submits `f`, returning a promise for its result.
    pub fn submit<V, F>(&self, f: F) -> Result<Promise<V>, RejectedError>
    where
        V: Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        crate::executor::submit_with(&self.to_dyn(), f)
    }

    /// Schedules `f` to run once after `delay`.
    pub fn schedule<V, F>(&self, delay: Duration, f: F) -> Result<ScheduledHandle<V>, RejectedError>
    where
        V: Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        crate::scheduled::schedule_one_shot(&self.host(), self.to_dyn(), delay, f)
    }

    /// Schedules `f` at a fixed rate.
    ///
    /// # Panics
    ///
    /// Panics on a zero `period`.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<ScheduledHandle<()>, RejectedError>
    where
        F: FnMut() + Send + 'static,
    {
        crate::scheduled::schedule_periodic(
            &self.host(),
            self.to_dyn(),
            initial_delay,
            Period::FixedRate(period),
            f,
        )
    }

    /// Schedules `f` with a fixed delay between completions.
    ///
    /// # Panics
    ///
    /// Panics on a zero `delay`.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> Result<ScheduledHandle<()>, RejectedError>
    where
        F: FnMut() + Send + 'static,
    {
        crate::scheduled::schedule_periodic(
            &self.host(),
            self.to_dyn(),
            initial_delay,
            Period::FixedDelay(delay),
            f,
        )
    }

    /// Blocks until the worker thread has exited (gone idle), or `timeout`
    /// elapses. Test support, mirroring the on-demand lifecycle.
    pub fn await_inactivity(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut lifecycle = self.inner.lifecycle.lock();
        while self.inner.started.load(Ordering::Acquire) {
            if self
                .inner
                .stopped
                .wait_until(&mut lifecycle, deadline)
                .timed_out()
            {
                return !self.inner.started.load(Ordering::Acquire);
            }
        }
        true
    }

    #[cfg(test)]
    fn worker_is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }
}

impl Executor for GlobalExecutor {
    /// Never rejects; the queue is unbounded and the executor never shuts
    /// down.
    fn execute(&self, task: Task) -> Result<(), RejectedError> {
        self.inner.queue.lock().push_back(task);
        self.inner.available.notify_one();
        self.inner.start_worker_if_needed();
        Ok(())
    }

    fn in_executor(&self) -> bool {
        let worker = self.inner.worker_thread.load(Ordering::Acquire);
        worker != 0 && worker == fast_local::current_thread_id()
    }
}

impl core::fmt::Debug for GlobalExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GlobalExecutor")
            .field("running", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl GlobalInner ===

impl GlobalInner {
    fn start_worker_if_needed(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("global-executor".to_owned())
            .spawn(move || {
                worker_main(&inner);
                fast_local::remove_all();
            });
        if let Err(error) = spawned {
            tracing::error!(%error, "failed to spawn the global executor worker");
            self.started.store(false, Ordering::Release);
        }
    }

    /// Blocks for a task, merging due scheduled work, for at most the quiet
    /// period (or the nearest scheduled deadline, whichever is closer).
    /// `None` means the quiet period elapsed without activity.
    fn take_task(&self) -> Option<Task> {
        let mut queue = self.queue.lock();
        loop {
            self.merge_due_scheduled(&mut queue);
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }

            let now = self.ticker.nanos();
            let quiet_deadline = now.saturating_add(ticker::duration_to_nanos(self.quiet_period));
            let wake_at = match self.engine.peek_deadline() {
                Some(deadline) => deadline.min(quiet_deadline),
                None => quiet_deadline,
            };
            if wake_at <= now {
                continue;
            }

            let timed_out = self
                .available
                .wait_for(&mut queue, Duration::from_nanos(wake_at - now))
                .timed_out();

            let scheduled_due = self
                .engine
                .peek_deadline()
                .is_some_and(|deadline| deadline <= self.ticker.nanos());
            if timed_out && queue.is_empty() && !scheduled_due {
                return None;
            }
        }
    }

    fn merge_due_scheduled(&self, queue: &mut VecDeque<Task>) {
        let now = self.ticker.nanos();
        while let Some(task) = self.engine.poll_expired(now) {
            queue.push_back(Box::new(move || task.run()));
        }
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl ScheduledHost for GlobalInner {
    fn engine(&self) -> &Engine {
        &self.engine
    }

    fn ticker_nanos(&self) -> u64 {
        self.ticker.nanos()
    }

    fn in_loop(&self) -> bool {
        let worker = self.worker_thread.load(Ordering::Acquire);
        worker != 0 && worker == fast_local::current_thread_id()
    }

    /// The global executor never shuts down.
    fn is_shutting_down(&self) -> bool {
        false
    }

    fn execute_internal(&self, task: Task) -> Result<(), RejectedError> {
        let this = self.self_weak.upgrade().ok_or(RejectedError::Shutdown)?;
        this.queue.lock().push_back(task);
        this.available.notify_one();
        this.start_worker_if_needed();
        Ok(())
    }

    fn enqueue_wakeup(&self) {
        self.available.notify_one();
    }
}

fn worker_main(inner: &Arc<GlobalInner>) {
    inner
        .worker_thread
        .store(fast_local::current_thread_id(), Ordering::Release);
    let _span = tracing::debug_span!("global-executor").entered();
    tracing::debug!("worker started");

    loop {
        if let Some(task) = inner.take_task() {
            if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::warn!("a task raised an exception; the global worker keeps running");
            }
            continue;
        }

        // idle past the quiet period, but never with scheduled work pending
        if inner.engine.peek_deadline().is_some() {
            continue;
        }

        // give up the worker identity before standing down, so a replacement
        // worker's identity is never clobbered by this one
        inner.worker_thread.store(0, Ordering::Release);
        inner.started.store(false, Ordering::Release);
        if inner.queue_is_empty() {
            break;
        }
        // a task raced in after we stood down; take the worker role back or
        // yield to whoever else already did
        if inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            break;
        }
        inner
            .worker_thread
            .store(fast_local::current_thread_id(), Ordering::Release);
    }

    {
        let mut lifecycle = inner.lifecycle.lock();
        *lifecycle += 1;
        inner.stopped.notify_all();
    }
    tracing::debug!("worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global executor is process-wide state, so tests here are written
    // to tolerate each other: they only ever assert on their own promises
    // and on quiescence, never on exclusive ownership of the worker.

    #[test]
    fn runs_submitted_tasks() {
        let global = GlobalExecutor::shared();
        let promise = global.submit(|| 21 * 2).unwrap();
        promise.await_done().unwrap();
        assert_eq!(promise.get_now(), Some(42));
    }

    #[test]
    fn schedules_tasks() {
        let global = GlobalExecutor::shared();
        let handle = global.schedule(Duration::from_millis(20), || 7).unwrap();
        handle.await_done().unwrap();
        assert_eq!(handle.get_now(), Some(7));
    }

    #[test]
    fn worker_exits_when_idle_and_restarts() {
        let global = GlobalExecutor::shared();
        global.submit(|| ()).unwrap().await_done().unwrap();

        // quiet period (1s) plus slack: the worker must stand down
        assert!(global.await_inactivity(Duration::from_secs(10)));
        assert!(!global.worker_is_running());

        // and come back for the next submission
        let promise = global.submit(|| 1).unwrap();
        promise.await_done().unwrap();
        assert_eq!(promise.get_now(), Some(1));
    }
}
