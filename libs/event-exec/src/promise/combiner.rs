// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Cause;
use crate::executor::Executor;
use crate::promise::Promise;

/// Aggregates the outcomes of any number of promises into one.
///
/// Add the source promises with [`PromiseCombiner::add`], then hand over the
/// aggregate with [`PromiseCombiner::finish`]; the aggregate completes once
/// every added promise has completed. If any of them failed, the aggregate
/// fails with the *first observed* cause, otherwise it succeeds.
///
/// The combiner is confined to the thread that created it: `add` and
/// `finish` panic when called from anywhere else. Source promises may
/// complete on other threads; their outcomes are marshalled back through the
/// combiner's executor.
pub struct PromiseCombiner {
    inner: Arc<CombinerInner>,
}

struct CombinerInner {
    executor: Arc<dyn Executor>,
    owner: u64,
    state: Mutex<CombinerState>,
}

#[derive(Default)]
struct CombinerState {
    expected: usize,
    done: usize,
    first_cause: Option<Cause>,
    aggregate: Option<Promise<()>>,
}

// === impl PromiseCombiner ===

impl PromiseCombiner {
    /// Creates a combiner marshalled through `executor` and confined to the
    /// calling thread.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(CombinerInner {
                executor,
                owner: fast_local::current_thread_id(),
                state: Mutex::new(CombinerState::default()),
            }),
        }
    }

    /// A combiner marshalled through the immediate executor.
    #[must_use]
    pub fn new_immediate() -> Self {
        Self::new(crate::immediate::ImmediateExecutor::shared_dyn())
    }

    /// Adds `promise` to the set the aggregate waits for.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the creating one, or
    /// after [`PromiseCombiner::finish`].
    pub fn add<T: Send + 'static>(&self, promise: &Promise<T>) {
        self.inner.check_owner();
        {
            let mut state = self.inner.state.lock();
            assert!(
                state.aggregate.is_none(),
                "PromiseCombiner::add after finish"
            );
            state.expected += 1;
        }

        let inner = Arc::clone(&self.inner);
        promise.add_listener(move |done| {
            let cause = done.cause();
            if inner.executor.in_executor() {
                inner.child_done(cause);
            } else {
                let inner2 = Arc::clone(&inner);
                let _ = inner
                    .executor
                    .execute(Box::new(move || inner2.child_done(cause)));
            }
        });
    }

    /// Hands over the aggregate promise; it completes once all added
    /// promises have.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the creating one, or a
    /// second time.
    pub fn finish(&self, aggregate: Promise<()>) {
        self.inner.check_owner();
        let complete_now = {
            let mut state = self.inner.state.lock();
            assert!(
                state.aggregate.is_none(),
                "PromiseCombiner::finish called twice"
            );
            state.aggregate = Some(aggregate);
            state.done == state.expected
        };
        if complete_now {
            self.inner.complete_aggregate();
        }
    }
}

// === impl CombinerInner ===

impl CombinerInner {
    fn check_owner(&self) {
        assert_eq!(
            fast_local::current_thread_id(),
            self.owner,
            "PromiseCombiner used from a thread other than its creator"
        );
    }

    fn child_done(&self, cause: Option<Cause>) {
        let finished = {
            let mut state = self.state.lock();
            state.done += 1;
            if let Some(cause) = cause {
                state.first_cause.get_or_insert(cause);
            }
            state.aggregate.is_some() && state.done == state.expected
        };
        if finished {
            self.complete_aggregate();
        }
    }

    fn complete_aggregate(&self) {
        let (aggregate, cause) = {
            let mut state = self.state.lock();
            (state.aggregate.clone(), state.first_cause.take())
        };
        let Some(aggregate) = aggregate else { return };
        match cause {
            Some(cause) => {
                aggregate.try_failure(cause);
            }
            None => {
                aggregate.try_success(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    fn boom() -> Cause {
        #[derive(Debug)]
        struct Boom;
        impl core::fmt::Display for Boom {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.pad("boom")
            }
        }
        impl core::error::Error for Boom {}
        Arc::new(Boom)
    }

    #[test]
    fn aggregate_succeeds_when_all_succeed() {
        let combiner = PromiseCombiner::new_immediate();
        let sources: Vec<Promise<u32>> = (0..3).map(|_| Promise::immediate()).collect();
        for source in &sources {
            combiner.add(source);
        }

        let aggregate = Promise::immediate();
        combiner.finish(aggregate.clone());
        assert!(!aggregate.is_done());

        for (i, source) in sources.iter().enumerate() {
            source.set_success(u32::try_from(i).unwrap());
        }
        assert!(aggregate.is_success());
    }

    #[test]
    fn aggregate_fails_with_first_observed_cause() {
        let combiner = PromiseCombiner::new_immediate();
        let a = Promise::<u32>::immediate();
        let b = Promise::<u32>::immediate();
        combiner.add(&a);
        combiner.add(&b);

        let aggregate = Promise::immediate();
        combiner.finish(aggregate.clone());

        a.set_failure(boom());
        assert!(!aggregate.is_done(), "waits for every source");
        b.cancel();

        match aggregate.sync() {
            Err(SyncError::Failed(cause)) => assert_eq!(cause.to_string(), "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn sources_completed_before_finish_count() {
        let combiner = PromiseCombiner::new_immediate();
        let source = Promise::immediate();
        source.set_success(1_u32);
        combiner.add(&source);

        let aggregate = Promise::immediate();
        combiner.finish(aggregate.clone());
        assert!(aggregate.is_success());
    }

    #[test]
    fn empty_combiner_completes_on_finish() {
        let combiner = PromiseCombiner::new_immediate();
        let aggregate = Promise::immediate();
        combiner.finish(aggregate.clone());
        assert!(aggregate.is_success());
    }

    #[test]
    #[should_panic(expected = "after finish")]
    fn add_after_finish_panics() {
        let combiner = PromiseCombiner::new_immediate();
        combiner.finish(Promise::immediate());
        combiner.add(&Promise::<u32>::immediate());
    }

    #[test]
    #[should_panic(expected = "other than its creator")]
    fn cross_thread_use_panics() {
        let combiner = PromiseCombiner::new_immediate();
        std::thread::scope(|scope| {
            let result = scope.spawn(|| combiner.add(&Promise::<u32>::immediate())).join();
            if let Err(payload) = result {
                std::panic::resume_unwind(payload);
            }
        });
    }
}
