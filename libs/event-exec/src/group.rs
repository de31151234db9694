// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fleet of single-threaded executors behind one facade.
//!
//! Children are created eagerly at construction; a chooser maps each
//! `next()` to one of them. Work submitted through the group lands on the
//! chosen child, so everything submitted *through one child* keeps that
//! child's ordering guarantees. Lifecycle calls fan out to all children and
//! aggregate.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::assert_impl_all;
use ticker::Ticker;

use crate::chooser::{Chooser, ChooserFactory, DefaultChooserFactory};
use crate::config;
use crate::error::RejectedError;
use crate::executor::{Executor, Lifecycle, Task};
use crate::promise::Promise;
use crate::reject::RejectionPolicy;
use crate::scheduled::ScheduledHandle;
use crate::single_thread::{Builder as ChildBuilder, SingleThreadExecutor};
use crate::thread_factory::ThreadFactory;

pub(crate) struct GroupInner {
    children: Box<[SingleThreadExecutor]>,
    chooser: Chooser,
    termination: Promise<()>,
}

/// A group of [`SingleThreadExecutor`]s with a pluggable chooser.
#[derive(Clone)]
pub struct ExecutorGroup {
    pub(crate) inner: Arc<GroupInner>,
}

assert_impl_all!(ExecutorGroup: Send, Sync);

/// Configures and builds an [`ExecutorGroup`].
pub struct GroupBuilder {
    threads: usize,
    name: Option<String>,
    ticker: Option<Arc<dyn Ticker>>,
    thread_factory: Option<Arc<dyn ThreadFactory>>,
    rejection: RejectionPolicy,
    queue_capacity: Option<usize>,
    supports_suspension: bool,
    chooser_factory: Arc<dyn ChooserFactory>,
}

// === impl GroupBuilder ===

impl GroupBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: 0,
            name: None,
            ticker: None,
            thread_factory: None,
            rejection: RejectionPolicy::Reject,
            queue_capacity: None,
            supports_suspension: false,
            chooser_factory: Arc::new(DefaultChooserFactory),
        }
    }

    /// Number of children; `0` means `available_processors() * 2`.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
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

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn supports_suspension(mut self, supported: bool) -> Self {
        self.supports_suspension = supported;
        self
    }

    #[must_use]
    pub fn chooser_factory(mut self, factory: Arc<dyn ChooserFactory>) -> Self {
        self.chooser_factory = factory;
        self
    }

    #[must_use]
    pub fn build(self) -> ExecutorGroup {
        let name = self.name.clone();
        let ticker = self.ticker.clone();
        let factory = self.thread_factory.clone();
        let rejection = self.rejection;
        let queue_capacity = self.queue_capacity;
        let suspension = self.supports_suspension;

        self.try_build_with(|index| {
            let mut builder = ChildBuilder::new();
            if let Some(name) = &name {
                builder = builder.name(format!("{name}-{index}"));
            }
            if let Some(ticker) = &ticker {
                builder = builder.ticker(Arc::clone(ticker));
            }
            if let Some(factory) = &factory {
                builder = builder.thread_factory(Arc::clone(factory));
            }
            if let Some(capacity) = queue_capacity {
                builder = builder.queue_capacity(capacity);
            }
            builder = builder
                .rejection_policy(rejection)
                .supports_suspension(suspension);
            Ok::<_, core::convert::Infallible>(builder.build())
        })
        .unwrap_or_else(|infallible| match infallible {})
    }

    /// Builds the group with a caller-supplied per-child constructor. If any
    /// child fails to construct, every already-created child is shut down
    /// gracefully before the error is returned.
    pub fn try_build_with<E>(
        self,
        mut new_child: impl FnMut(usize) -> Result<SingleThreadExecutor, E>,
    ) -> Result<ExecutorGroup, E> {
        let threads = effective_threads(self.threads);

        let mut children = Vec::with_capacity(threads);
        for index in 0..threads {
            match new_child(index) {
                Ok(child) => children.push(child),
                Err(error) => {
                    for child in &children {
                        child.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
                    }
                    return Err(error);
                }
            }
        }

        let chooser = self.chooser_factory.new_chooser(threads);
        let termination = Promise::new(crate::global::GlobalExecutor::shared().to_dyn());

        let inner = Arc::new(GroupInner {
            children: children.into_boxed_slice(),
            chooser,
            termination,
        });

        // the group terminates exactly when the last child does
        let pending = Arc::new(AtomicUsize::new(inner.children.len()));
        for child in &inner.children {
            child.set_parent(&Arc::downgrade(&inner));
            let pending = Arc::clone(&pending);
            let termination = inner.termination.clone();
            child.termination_future().add_listener(move |_| {
                if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    termination.try_success(());
                }
            });
        }

        Ok(ExecutorGroup { inner })
    }
}

impl Default for GroupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn effective_threads(requested: usize) -> usize {
    if requested == 0 {
        config::available_processors() * 2
    } else {
        requested
    }
}

// === impl ExecutorGroup ===

impl ExecutorGroup {
    /// A group with `threads` default-configured children (`0` = CPU-sized
    /// default).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        GroupBuilder::new().threads(threads).build()
    }

    #[must_use]
    pub fn builder() -> GroupBuilder {
        GroupBuilder::new()
    }

    /// The next child, per the chooser.
    #[must_use]
    pub fn next(&self) -> &SingleThreadExecutor {
        &self.inner.children[self.inner.chooser.next()]
    }

    pub fn children(&self) -> impl ExactSizeIterator<Item = &SingleThreadExecutor> {
        self.inner.children.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.children.is_empty()
    }

    /// Submits `f` on the next child.
    pub fn submit<V, F>(&self, f: F) -> Result<Promise<V>, RejectedError>
    where
        V: Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        self.next().submit(f)
    }

    /// Schedules `f` once after `delay` on the next child.
    pub fn schedule<V, F>(&self, delay: Duration, f: F) -> Result<ScheduledHandle<V>, RejectedError>
    where
        V: Send + 'static,
        F: FnOnce() -> V + Send + 'static,
    {
        self.next().schedule(delay, f)
    }

    /// Schedules `f` at a fixed rate on the next child.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<ScheduledHandle<()>, RejectedError>
    where
        F: FnMut() + Send + 'static,
    {
        self.next()
            .schedule_at_fixed_rate(initial_delay, period, f)
    }

    /// Schedules `f` with a fixed delay on the next child.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> Result<ScheduledHandle<()>, RejectedError>
    where
        F: FnMut() + Send + 'static,
    {
        self.next()
            .schedule_with_fixed_delay(initial_delay, delay, f)
    }
}

impl Executor for ExecutorGroup {
    fn execute(&self, task: Task) -> Result<(), RejectedError> {
        self.next().execute(task)
    }

    fn in_executor(&self) -> bool {
        self.children().any(|child| child.in_executor())
    }
}

impl Lifecycle for ExecutorGroup {
    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        for child in self.children() {
            child.shutdown_gracefully(quiet_period, timeout);
        }
        self.termination_future()
    }

    fn termination_future(&self) -> Promise<()> {
        self.inner.termination.clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.children().all(Lifecycle::is_shutting_down)
    }

    fn is_shutdown(&self) -> bool {
        self.children().all(Lifecycle::is_shutdown)
    }

    fn is_terminated(&self) -> bool {
        self.children().all(Lifecycle::is_terminated)
    }
}

impl fmt::Debug for ExecutorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorGroup")
            .field("children", &self.inner.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn power_of_two_round_robin_pattern() {
        let group = ExecutorGroup::new(4);
        let first: Vec<String> = (0..4).map(|_| group.next().name().to_owned()).collect();
        // the next three laps repeat the exact same order
        for _ in 0..3 {
            for expected in &first {
                assert_eq!(group.next().name(), expected);
            }
        }
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn work_lands_on_children() {
        let group = ExecutorGroup::builder().threads(2).name("pair").build();
        let seen = Arc::new(Mutex::new(std::collections::BTreeSet::new()));
        let mut promises = Vec::new();
        for _ in 0..8 {
            let seen = Arc::clone(&seen);
            promises.push(
                group
                    .submit(move || {
                        seen.lock()
                            .insert(std::thread::current().name().map(str::to_owned));
                    })
                    .unwrap(),
            );
        }
        for promise in &promises {
            promise.await_done().unwrap();
        }
        // both children served the round-robin stream
        assert_eq!(seen.lock().len(), 2);
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn children_know_their_parent() {
        let group = ExecutorGroup::new(2);
        let child = group.next().clone();
        let parent = child.parent().expect("child must know its group");
        assert_eq!(parent.len(), 2);
        group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
    }

    #[test]
    fn group_terminates_when_all_children_do() {
        let group = ExecutorGroup::new(3);
        for child in group.children() {
            child.submit(|| ()).unwrap();
        }

        let termination = group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(5));
        assert!(termination.await_timeout(Duration::from_secs(10)).unwrap());
        assert!(group.is_terminated());
        assert!(group.is_shutdown());
    }

    #[test]
    fn failed_child_construction_rolls_back() {
        #[derive(Debug, PartialEq)]
        struct Nope;

        let created = Arc::new(Mutex::new(Vec::new()));
        let created2 = Arc::clone(&created);
        let result = GroupBuilder::new().threads(3).try_build_with(move |index| {
            if index == 2 {
                return Err(Nope);
            }
            let child = crate::single_thread::Builder::new()
                .name(format!("rollback-{index}"))
                .build();
            created2.lock().push(child.clone());
            Ok(child)
        });

        assert_eq!(result.err(), Some(Nope));
        for child in created.lock().iter() {
            assert!(child.is_shutting_down());
        }
    }

    #[test]
    fn default_size_tracks_processors() {
        assert_eq!(effective_threads(0), config::available_processors() * 2);
        assert_eq!(effective_threads(5), 5);
    }
}
