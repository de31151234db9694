// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single-threaded ordered event executor.
//!
//! One worker thread owns the task queue and the scheduled-task heap and
//! drains them in deadline-interleaved FIFO order. Everything else talks to
//! the executor through the MPSC queue; thread identity (checked through
//! [`Executor::in_executor`]) decides which side of that line code is on.
//!
//! Lifecycle:
//!
//! ```text
//! NOT_STARTED ──execute()──▶ STARTED ──shutdown_gracefully()──▶ SHUTTING_DOWN
//!      │                        │  ▲                                  │
//!      ▼                 trySuspend  execute()                        ▼
//!  SUSPENDED ◀── SUSPENDING ────┘  │                              SHUTDOWN
//!      └───────────────────────────┘                                  │
//!                                                                     ▼
//!                                                                TERMINATED
//! ```
//!
//! Shutdown is graceful: once `SHUTTING_DOWN`, submissions are still
//! accepted, and the worker keeps draining until a full quiet period passes
//! with no task activity (or the hard timeout caps the wait). Only then does
//! the executor advance to `SHUTDOWN` and refuse work.

use core::fmt;
use core::time::Duration;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use mpsc_queue::{Full, MpscArrayQueue};
use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;
use ticker::{SystemTicker, Ticker, duration_to_nanos};

use crate::config;
use crate::error::{InvokeError, RejectedError};
use crate::executor::{Executor, Lifecycle, Task};
use crate::promise::Promise;
use crate::reject::RejectionPolicy;
use crate::scheduled::engine::{Engine, ScheduledHost};
use crate::scheduled::{Period, ScheduledHandle};
use crate::thread_factory::{DefaultThreadFactory, ThreadFactory};

const NOT_STARTED: u8 = 1;
const STARTED: u8 = 2;
const SUSPENDING: u8 = 3;
const SUSPENDED: u8 = 4;
const SHUTTING_DOWN: u8 = 5;
const SHUTDOWN: u8 = 6;
const TERMINATED: u8 = 7;

/// What travels through the task queue: real work, or the `WAKEUP` sentinel
/// whose only effect is to pop the worker out of a timed wait so it
/// re-checks its state. Sentinels are discarded on dequeue.
enum TaskCell {
    Run(Task),
    Wakeup,
}

pub(crate) struct Inner {
    self_weak: Weak<Inner>,
    name: String,
    state: AtomicU8,
    /// Fast-local id of the current worker thread; `0` while no worker runs.
    worker_thread: AtomicU64,
    queue: MpscArrayQueue<TaskCell>,
    /// Worker parking: `permit` absorbs unparks that race ahead of the park.
    permit: Mutex<bool>,
    unparked: Condvar,
    engine: Engine,
    ticker: Arc<dyn Ticker>,
    thread_factory: Arc<dyn ThreadFactory>,
    rejection: RejectionPolicy,
    wakes_on_add: bool,
    supports_suspension: bool,
    termination: Promise<()>,
    quiet_period_nanos: AtomicU64,
    shutdown_timeout_nanos: AtomicU64,
    /// Ticker reading when the worker first confirmed the shutdown; `0`
    /// until then.
    shutdown_start_nanos: AtomicU64,
    last_execution_nanos: AtomicU64,
    shutdown_hooks: Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
    parent: OnceLock<Weak<crate::group::GroupInner>>,
}

/// A single-threaded ordered event executor; cheap to clone, all handles
/// refer to the same executor.
#[derive(Clone)]
pub struct SingleThreadExecutor {
    pub(crate) inner: Arc<Inner>,
}

assert_impl_all!(SingleThreadExecutor: Send, Sync);

/// Configures and builds a [`SingleThreadExecutor`].
pub struct Builder {
    name: Option<String>,
    queue_capacity: usize,
    ticker: Option<Arc<dyn Ticker>>,
    thread_factory: Option<Arc<dyn ThreadFactory>>,
    rejection: RejectionPolicy,
    supports_suspension: bool,
    wakes_on_add: bool,
}

// === impl Builder ===

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            queue_capacity: config::max_pending_tasks(),
            ticker: None,
            thread_factory: None,
            rejection: RejectionPolicy::Reject,
            supports_suspension: false,
            wakes_on_add: true,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bound on pending tasks; rounded up to a power of two.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    #[must_use]
    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection = policy;
        self
    }

    /// Allows the worker to exit while idle and restart on the next
    /// submission.
    #[must_use]
    pub fn supports_suspension(mut self, supported: bool) -> Self {
        self.supports_suspension = supported;
        self
    }

    /// Whether enqueueing alone wakes the worker. When `false`, immediate
    /// submissions additionally enqueue a `WAKEUP` sentinel.
    #[must_use]
    pub fn wakes_on_add(mut self, wakes: bool) -> Self {
        self.wakes_on_add = wakes;
        self
    }

    #[must_use]
    pub fn build(self) -> SingleThreadExecutor {
        static NEXT_NAME: AtomicUsize = AtomicUsize::new(0);
        let name = self.name.unwrap_or_else(|| {
            format!("executor-{}", NEXT_NAME.fetch_add(1, Ordering::Relaxed))
        });

        let inner = Arc::new_cyclic(|self_weak| Inner {
            self_weak: self_weak.clone(),
            name,
            state: AtomicU8::new(NOT_STARTED),
            worker_thread: AtomicU64::new(0),
            queue: MpscArrayQueue::with_capacity(self.queue_capacity),
            permit: Mutex::new(false),
            unparked: Condvar::new(),
            engine: Engine::new(),
            ticker: self
                .ticker
                .unwrap_or_else(|| -> Arc<dyn Ticker> { SystemTicker::shared() }),
            thread_factory: self
                .thread_factory
                .unwrap_or_else(|| -> Arc<dyn ThreadFactory> { DefaultThreadFactory::shared() }),
            rejection: self.rejection,
            wakes_on_add: self.wakes_on_add,
            supports_suspension: self.supports_suspension,
            termination: Promise::new(crate::global::GlobalExecutor::shared().to_dyn()),
            quiet_period_nanos: AtomicU64::new(0),
            shutdown_timeout_nanos: AtomicU64::new(0),
            shutdown_start_nanos: AtomicU64::new(0),
            last_execution_nanos: AtomicU64::new(0),
            shutdown_hooks: Mutex::new(Vec::new()),
            parent: OnceLock::new(),
        });
        SingleThreadExecutor { inner }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// === impl SingleThreadExecutor ===

impl SingleThreadExecutor {
    /// A default-configured executor.
    #[must_use]
    pub fn new() -> Self {
        Builder::new().build()
    }

    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The group this executor belongs to, if any.
    #[must_use]
    pub fn parent(&self) -> Option<crate::group::ExecutorGroup> {
        let weak = self.inner.parent.get()?;
        weak.upgrade()
            .map(|inner| crate::group::ExecutorGroup { inner })
    }

    pub(crate) fn set_parent(&self, parent: &Weak<crate::group::GroupInner>) {
        let _ = self.inner.parent.set(parent.clone());
    }

    pub(crate) fn to_dyn(&self) -> Arc<dyn Executor> {
        Arc::new(self.clone())
    }

    fn host(&self) -> Arc<dyn ScheduledHost> {
        self.inner.clone()
    }

    /// Number of tasks waiting in the queue (sentinels included).
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.len()
    }

    /// Enqueues `task` without waking the worker; it runs no later than the
    /// next time the worker is awake anyway.
    pub fn execute_lazy(&self, task: Task) -> Result<(), RejectedError> {
        self.inner.execute_cell(TaskCell::Run(task), false)
    }

    /// Submits `f`, returning a promise for its result.
    pub fn submit<V, F>(&self, f: F) -> Result<Promise<V>, RejectedError>
    where
        V: Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        crate::executor::submit_with(&self.to_dyn(), f)
    }

    /// Schedules `f` to run once after `delay` on this executor's ticker.
    pub fn schedule<V, F>(&self, delay: Duration, f: F) -> Result<ScheduledHandle<V>, RejectedError>
    where
        V: Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        crate::scheduled::schedule_one_shot(&self.host(), self.to_dyn(), delay, f)
    }

    /// Schedules `f` at a fixed rate: firings at `initial_delay`,
    /// `initial_delay + period`, `initial_delay + 2·period`, …, anchored on
    /// the previous *deadline* — a worker that falls behind fires catch-up
    /// bursts.
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

    /// Schedules `f` with a fixed delay between the *completion* of one
    /// firing and the start of the next.
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

    /// Runs every task and blocks until all are done; see
    /// [`Lifecycle::shutdown_gracefully`] for the in-loop restriction.
    ///
    /// # Panics
    ///
    /// Panics when called from this executor's own worker thread.
    pub fn invoke_all<V, F>(
        &self,
        tasks: Vec<F>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Promise<V>>, RejectedError>
    where
        V: Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        crate::executor::invoke_all(&self.to_dyn(), tasks, timeout)
    }

    /// Runs the tasks and blocks until the first success.
    ///
    /// # Panics
    ///
    /// Panics when called from this executor's own worker thread, or with no
    /// tasks.
    pub fn invoke_any<V, F>(
        &self,
        tasks: Vec<F>,
        timeout: Option<Duration>,
    ) -> Result<V, InvokeError>
    where
        V: Clone + Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        crate::executor::invoke_any(&self.to_dyn(), tasks, timeout)
    }

    /// Registers a hook run (FIFO, re-entrantly) by the worker during
    /// graceful shutdown.
    pub fn add_shutdown_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.shutdown_hooks.lock().push(Box::new(hook));
    }

    /// Asks the worker to suspend once its queues drain. Returns whether the
    /// executor is (now) suspending or suspended.
    pub fn try_suspend(&self) -> bool {
        if !self.inner.supports_suspension {
            return false;
        }
        loop {
            match self.inner.state() {
                STARTED => {
                    if self
                        .inner
                        .state
                        .compare_exchange(STARTED, SUSPENDING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.inner.wakeup(false);
                        return true;
                    }
                }
                SUSPENDING | SUSPENDED => return true,
                _ => return false,
            }
        }
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.state() == SUSPENDED
    }

    /// The deadline of the nearest scheduled task, if any.
    #[must_use]
    pub fn next_scheduled_deadline_nanos(&self) -> Option<u64> {
        self.inner.engine.peek_deadline()
    }

    /// Cancels every pending scheduled task and clears the deadline heap.
    ///
    /// # Panics
    ///
    /// Panics when called from outside this executor's worker thread; the
    /// heap is executor-owned.
    pub fn cancel_scheduled_tasks(&self) {
        assert!(
            self.in_executor(),
            "cancel_scheduled_tasks may only be called in-loop"
        );
        self.inner.engine.cancel_all();
    }
}

impl Default for SingleThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SingleThreadExecutor {
    fn execute(&self, task: Task) -> Result<(), RejectedError> {
        self.inner.execute_cell(TaskCell::Run(task), true)
    }

    fn in_executor(&self) -> bool {
        self.inner.in_loop()
    }
}

impl Lifecycle for SingleThreadExecutor {
    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        assert!(
            quiet_period <= timeout,
            "quiet period must not exceed the shutdown timeout"
        );
        let inner = &self.inner;
        if !inner.is_shutting_down() {
            inner
                .quiet_period_nanos
                .store(duration_to_nanos(quiet_period), Ordering::Relaxed);
            inner
                .shutdown_timeout_nanos
                .store(duration_to_nanos(timeout), Ordering::Relaxed);

            loop {
                let state = inner.state();
                if state >= SHUTTING_DOWN {
                    break;
                }
                // a worker must exist to run the shutdown protocol
                let needs_worker = state == NOT_STARTED || state == SUSPENDED;
                if inner
                    .state
                    .compare_exchange(state, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if needs_worker {
                        inner.spawn_worker();
                    }
                    break;
                }
            }
        }
        inner.wakeup(inner.in_loop());
        self.termination_future()
    }

    fn termination_future(&self) -> Promise<()> {
        self.inner.termination.clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    fn is_shutdown(&self) -> bool {
        self.inner.state() >= SHUTDOWN
    }

    fn is_terminated(&self) -> bool {
        self.inner.state() == TERMINATED
    }
}

impl fmt::Debug for SingleThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleThreadExecutor")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .field("pending", &self.inner.queue.len())
            .finish()
    }
}

// === impl Inner ===

impl Inner {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn in_loop(&self) -> bool {
        let worker = self.worker_thread.load(Ordering::Acquire);
        worker != 0 && worker == fast_local::current_thread_id()
    }

    fn is_shutting_down(&self) -> bool {
        self.state() >= SHUTTING_DOWN
    }

    fn has_tasks(&self) -> bool {
        !self.queue.is_empty()
    }

    fn update_last_execution(&self) {
        self.last_execution_nanos
            .store(self.ticker.nanos().max(1), Ordering::Relaxed);
    }

    /// Monotonically advances the lifecycle state to at least `target`.
    fn advance_state(&self, target: u8) {
        loop {
            let state = self.state();
            if state >= target {
                return;
            }
            if self
                .state
                .compare_exchange_weak(state, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    // --- parking ---

    fn park(&self, timeout: Option<Duration>) {
        let mut permit = self.permit.lock();
        if *permit {
            *permit = false;
            return;
        }
        match timeout {
            Some(timeout) => {
                let _ = self.unparked.wait_for(&mut permit, timeout);
            }
            None => self.unparked.wait(&mut permit),
        }
        *permit = false;
    }

    fn unpark(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.unparked.notify_one();
    }

    /// Forces the worker out of a timed wait so it re-checks its state.
    fn wakeup(&self, in_loop: bool) {
        if !in_loop {
            // the sentinel is best-effort: a full queue wakes the worker
            // anyway
            let _ = self.queue.try_enqueue(TaskCell::Wakeup);
            self.unpark();
        }
    }

    // --- submission ---

    fn execute_cell(self: &Arc<Self>, cell: TaskCell, immediate: bool) -> Result<(), RejectedError> {
        let in_loop = self.in_loop();
        if self.state() >= SHUTDOWN {
            return Err(RejectedError::Shutdown);
        }

        if let Err(Full(cell)) = self.queue.try_enqueue(cell) {
            self.handle_full(cell, in_loop)?;
        }

        if !in_loop {
            self.start_worker();
            if self.state() >= SHUTDOWN {
                // the task may already be unreachable; see DESIGN.md on this
                // race — the caller must treat Rejected as "may not run"
                return Err(RejectedError::Shutdown);
            }
        }

        if immediate {
            if !self.wakes_on_add {
                let _ = self.queue.try_enqueue(TaskCell::Wakeup);
            }
            self.unpark();
        }
        Ok(())
    }

    fn handle_full(&self, cell: TaskCell, in_loop: bool) -> Result<(), RejectedError> {
        if in_loop {
            // the worker must never sleep on its own full queue
            return Err(RejectedError::QueueFull);
        }
        match self.rejection {
            RejectionPolicy::Reject => Err(RejectedError::QueueFull),
            RejectionPolicy::Backoff { retries, delay } => {
                let mut cell = cell;
                for attempt in 0..retries {
                    self.ticker.sleep(delay);
                    match self.queue.try_enqueue(cell) {
                        Ok(()) => return Ok(()),
                        Err(Full(back)) => cell = back,
                    }
                    tracing::trace!(attempt, "task queue still full after backoff");
                }
                Err(RejectedError::QueueFull)
            }
        }
    }

    fn start_worker(self: &Arc<Self>) {
        loop {
            let state = self.state();
            if state != NOT_STARTED && state != SUSPENDED {
                return;
            }
            if self
                .state
                .compare_exchange(state, STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_worker();
                return;
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let spawned = self
            .thread_factory
            .spawn_worker(self.name.clone(), Box::new(move || worker_main(&inner)));
        if let Err(error) = spawned {
            tracing::error!(%error, name = %self.name, "failed to spawn worker thread");
            // fall back so a later submission can retry
            let _ = self.state.compare_exchange(
                STARTED,
                NOT_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    // --- worker side ---

    /// Blocks for at most one park round; `None` means "nothing ran, check
    /// state" (wakeup sentinel, state change, or deadline expiry).
    fn take_task(self: &Arc<Self>) -> Option<Task> {
        debug_assert!(self.in_loop());
        loop {
            self.fetch_expired_scheduled();
            match self.queue.try_dequeue() {
                Some(TaskCell::Run(task)) => return Some(task),
                Some(TaskCell::Wakeup) => return None,
                None => {}
            }

            let state = self.state();
            if state >= SHUTTING_DOWN {
                return None;
            }
            if state == SUSPENDING && !self.has_tasks() && self.engine.peek_deadline().is_none() {
                // fully idle: hand control back so the caller can suspend
                return None;
            }

            match self.engine.peek_deadline() {
                Some(deadline) => {
                    let now = self.ticker.nanos();
                    if deadline <= now {
                        // expired while we were looking; merge and retry
                        continue;
                    }
                    self.park(Some(Duration::from_nanos(deadline - now)));
                }
                None => self.park(None),
            }
            return None;
        }
    }

    /// Moves every due scheduled task into the task queue, preserving
    /// deadline order. A full task queue puts the head back for a later
    /// round.
    fn fetch_expired_scheduled(self: &Arc<Self>) -> bool {
        let now = self.ticker.nanos();
        let mut moved = false;
        while let Some(task) = self.engine.poll_expired(now) {
            let runnable = {
                let task = Arc::clone(&task);
                TaskCell::Run(Box::new(move || task.run()))
            };
            if self.queue.try_enqueue(runnable).is_err() {
                self.engine.insert(task);
                break;
            }
            moved = true;
        }
        moved
    }

    fn run_task(task: Task) {
        if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("a task raised an exception; the worker keeps running");
        }
    }

    /// Drains the task queue (merging due scheduled tasks) until empty;
    /// returns whether anything ran.
    fn run_all_tasks(self: &Arc<Self>) -> bool {
        let mut ran = false;
        loop {
            self.fetch_expired_scheduled();
            match self.queue.try_dequeue() {
                Some(TaskCell::Run(task)) => {
                    Self::run_task(task);
                    ran = true;
                }
                Some(TaskCell::Wakeup) => {}
                None => break,
            }
        }
        if ran {
            self.update_last_execution();
        }
        ran
    }

    /// Runs shutdown hooks FIFO; hooks may add more hooks, which run in the
    /// same pass.
    fn run_shutdown_hooks(&self) -> bool {
        let mut ran = false;
        loop {
            let hooks: Vec<_> = {
                let mut hooks = self.shutdown_hooks.lock();
                if hooks.is_empty() {
                    break;
                }
                hooks.drain(..).collect()
            };
            for hook in hooks {
                if std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
                    tracing::warn!("shutdown hook panicked");
                }
                ran = true;
            }
        }
        if ran {
            self.update_last_execution();
        }
        ran
    }

    /// One round of the graceful-shutdown protocol; `true` means the worker
    /// may terminate.
    fn confirm_shutdown(self: &Arc<Self>) -> bool {
        if !self.is_shutting_down() {
            return false;
        }
        debug_assert!(self.in_loop());

        self.engine.cancel_all();

        if self.shutdown_start_nanos.load(Ordering::Relaxed) == 0 {
            self.shutdown_start_nanos
                .store(self.ticker.nanos().max(1), Ordering::Relaxed);
        }

        let ran = self.run_all_tasks() | self.run_shutdown_hooks();
        if ran {
            if self.state() >= SHUTDOWN {
                return true;
            }
            // activity restarts the quiet period, unless there is none
            return self.quiet_period_nanos.load(Ordering::Relaxed) == 0;
        }

        let now = self.ticker.nanos();
        let start = self.shutdown_start_nanos.load(Ordering::Relaxed);
        let timeout = self.shutdown_timeout_nanos.load(Ordering::Relaxed);
        if self.state() >= SHUTDOWN || now.saturating_sub(start) >= timeout {
            return true;
        }

        let quiet = self.quiet_period_nanos.load(Ordering::Relaxed);
        let idle = now.saturating_sub(self.last_execution_nanos.load(Ordering::Relaxed));
        if idle <= quiet {
            // inside the quiet window: nap, but wake early for arrivals
            let nap = Duration::from_nanos((quiet - idle).min(100_000_000));
            self.park(Some(nap));
            return false;
        }
        true
    }

    fn can_suspend(&self) -> bool {
        self.state() == SUSPENDING && !self.has_tasks() && self.engine.peek_deadline().is_none()
    }
}

impl ScheduledHost for Inner {
    fn engine(&self) -> &Engine {
        &self.engine
    }

    fn ticker_nanos(&self) -> u64 {
        self.ticker.nanos()
    }

    fn in_loop(&self) -> bool {
        Inner::in_loop(self)
    }

    fn is_shutting_down(&self) -> bool {
        Inner::is_shutting_down(self)
    }

    fn execute_internal(&self, task: Task) -> Result<(), RejectedError> {
        let this = self.self_weak.upgrade().ok_or(RejectedError::Shutdown)?;
        this.execute_cell(TaskCell::Run(task), true)
    }

    fn execute_lazy_internal(&self, task: Task) -> Result<(), RejectedError> {
        let this = self.self_weak.upgrade().ok_or(RejectedError::Shutdown)?;
        this.execute_cell(TaskCell::Run(task), false)
    }

    fn enqueue_wakeup(&self) {
        self.wakeup(Inner::in_loop(self));
    }

    fn removal_task_epilogue(&self) {
        // the removal task forced the executor awake; if it left nothing
        // behind, steer it back towards suspension
        if !self.supports_suspension {
            return;
        }
        if !self.has_tasks() && self.engine.peek_deadline().is_none() {
            let _ = self.state.compare_exchange(
                STARTED,
                SUSPENDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            self.unpark();
        }
    }
}

fn worker_main(inner: &Arc<Inner>) {
    inner
        .worker_thread
        .store(fast_local::current_thread_id(), Ordering::Release);
    let _span = tracing::debug_span!("event-executor", name = %inner.name).entered();
    tracing::debug!("worker started");
    inner.update_last_execution();

    loop {
        if let Some(task) = inner.take_task() {
            Inner::run_task(task);
            inner.update_last_execution();
        }
        if inner.supports_suspension && inner.can_suspend() {
            // give up the worker identity before publishing SUSPENDED, so a
            // revived worker's identity is never clobbered by this one
            inner.worker_thread.store(0, Ordering::Release);
            if inner
                .state
                .compare_exchange(SUSPENDING, SUSPENDED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::debug!("worker suspended");
                return;
            }
            // lost the race (a shutdown overtook us); keep running
            inner
                .worker_thread
                .store(fast_local::current_thread_id(), Ordering::Release);
        }
        if inner.state() >= SHUTTING_DOWN {
            break;
        }
    }

    while !inner.confirm_shutdown() {}

    // past this point submissions are refused
    inner.advance_state(SHUTDOWN);

    let mut leftover = 0_usize;
    while let Some(cell) = inner.queue.try_dequeue() {
        if let TaskCell::Run(_) = cell {
            leftover += 1;
        }
    }
    if leftover > 0 {
        tracing::warn!(leftover, "executor terminated with tasks still queued");
    }

    inner.worker_thread.store(0, Ordering::Release);
    inner.advance_state(TERMINATED);
    inner.termination.try_success(());
    tracing::debug!("worker terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AwaitError;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use tracing_subscriber::util::SubscriberInitExt;

    fn executor() -> SingleThreadExecutor {
        Builder::new().build()
    }

    #[test]
    fn runs_submitted_task() {
        let exec = executor();
        let promise = exec.submit(|| 40 + 2).unwrap();
        promise.await_done().unwrap();
        assert_eq!(promise.get_now(), Some(42));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn preserves_submission_order() {
        let exec = executor();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = Arc::clone(&order);
            exec.execute(Box::new(move || order.lock().push(i))).unwrap();
        }
        exec.submit(|| ()).unwrap().await_done().unwrap();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn in_executor_is_worker_only() {
        let exec = executor();
        assert!(!exec.in_executor());
        let probe = {
            let exec2 = exec.clone();
            exec.submit(move || exec2.in_executor()).unwrap()
        };
        probe.await_done().unwrap();
        assert_eq!(probe.get_now(), Some(true));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn task_panic_keeps_worker_alive() {
        let exec = executor();
        exec.execute(Box::new(|| panic!("boom"))).unwrap();
        let after = exec.submit(|| 7).unwrap();
        after.await_done().unwrap();
        assert_eq!(after.get_now(), Some(7));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn submit_failure_captures_panic_cause() {
        let exec = executor();
        let promise: Promise<()> = exec.submit(|| panic!("kaput")).unwrap();
        promise.await_done().unwrap();
        let cause = promise.cause().unwrap();
        assert!(cause.to_string().contains("kaput"));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn schedule_runs_after_delay() {
        let exec = executor();
        let started = std::time::Instant::now();
        let handle = exec
            .schedule(Duration::from_millis(50), move || started.elapsed())
            .unwrap();
        handle.await_done().unwrap();
        assert!(handle.get_now().unwrap() >= Duration::from_millis(50));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn scheduled_cancel_before_deadline_never_runs() {
        let exec = executor();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = exec
            .schedule(Duration::from_secs(3600), move || {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        // let the insertion task reach the heap before cancelling
        exec.submit(|| ()).unwrap().await_done().unwrap();
        assert!(exec.next_scheduled_deadline_nanos().is_some());

        assert!(handle.cancel());
        assert!(handle.is_cancelled());

        // drain the removal task, then the heap must be empty
        exec.submit(|| ()).unwrap().await_done().unwrap();
        assert_eq!(exec.next_scheduled_deadline_nanos(), None);
        assert!(!ran.load(Ordering::SeqCst));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn fixed_rate_fires_repeatedly() {
        let exec = executor();
        let (tx, rx) = mpsc::channel();
        let handle = exec
            .schedule_at_fixed_rate(Duration::from_millis(5), Duration::from_millis(5), move || {
                let _ = tx.send(());
            })
            .unwrap();

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(handle.cancel());
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn graceful_shutdown_runs_pending_tasks() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .set_default();

        let exec = executor();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            exec.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        let termination =
            exec.shutdown_gracefully(Duration::from_millis(100), Duration::from_secs(1));
        assert!(termination.await_timeout(Duration::from_millis(1200)).unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(exec.is_terminated());
    }

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let exec = executor();
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
            .await_done()
            .unwrap();
        assert_eq!(
            exec.execute(Box::new(|| ())).unwrap_err(),
            RejectedError::Shutdown
        );
    }

    #[test]
    fn submissions_during_quiet_period_still_run() {
        let exec = executor();
        exec.submit(|| ()).unwrap().await_done().unwrap();

        let termination =
            exec.shutdown_gracefully(Duration::from_millis(300), Duration::from_secs(5));

        let late = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&late);
        // shutting down, not yet shut down: still accepted
        exec.execute(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }))
        .unwrap();

        assert!(termination.await_timeout(Duration::from_secs(6)).unwrap());
        assert!(late.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_hooks_run_fifo_and_reentrant() {
        let exec = executor();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (order1, order2) = (Arc::clone(&order), Arc::clone(&order));
        let exec2 = exec.clone();
        exec.add_shutdown_hook(move || {
            order1.lock().push("first");
            let order3 = Arc::clone(&order1);
            exec2.add_shutdown_hook(move || order3.lock().push("nested"));
        });
        exec.add_shutdown_hook(move || order2.lock().push("second"));

        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
            .await_done()
            .unwrap();
        assert_eq!(*order.lock(), ["first", "second", "nested"]);
    }

    #[test]
    fn deadlock_guard_fires_in_loop() {
        let exec = executor();
        let victim: Promise<()> = Promise::new(exec.to_dyn());

        let observed = {
            let victim = victim.clone();
            exec.submit(move || victim.await_done()).unwrap()
        };
        observed.await_done().unwrap();
        assert_eq!(observed.get_now(), Some(Err(AwaitError::Deadlock)));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn queue_full_is_reported_to_producers() {
        // a worker that is blocked keeps the queue from draining
        let exec = Builder::new().queue_capacity(2).build();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        exec.execute(Box::new(move || {
            let _ = release_rx.recv();
        }))
        .unwrap();

        // fill the queue past capacity; eventually producers see QueueFull
        let mut saw_full = false;
        for _ in 0..64 {
            if exec.execute(Box::new(|| ())) == Err(RejectedError::QueueFull) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);

        release_tx.send(()).unwrap();
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn suspension_and_revival() {
        let exec = Builder::new().supports_suspension(true).build();
        exec.submit(|| ()).unwrap().await_done().unwrap();

        assert!(exec.try_suspend());
        // the worker drains and parks itself as suspended
        for _ in 0..200 {
            if exec.is_suspended() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(exec.is_suspended());

        // a new submission revives the executor with a fresh worker
        let promise = exec.submit(|| 11).unwrap();
        promise.await_done().unwrap();
        assert_eq!(promise.get_now(), Some(11));
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn invoke_all_returns_completed_promises() {
        let exec = executor();
        let promises = exec
            .invoke_all((0..4).map(|i| move || i * 2).collect::<Vec<_>>(), None)
            .unwrap();
        let values: Vec<_> = promises.iter().map(|p| p.get_now().unwrap()).collect();
        assert_eq!(values, [0, 2, 4, 6]);
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    fn invoke_any_returns_first_success() {
        let exec = executor();
        let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
            Box::new(|| panic!("first fails")),
            Box::new(|| 5),
        ];
        let value = exec.invoke_any(tasks, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(value, 5);
        exec.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
    }
}
