// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::promise::Promise;

/// Propagates `source`'s terminal outcome onto every target promise.
///
/// A target that is already complete when the outcome arrives is left alone
/// (logged at warn, since that usually indicates two writers racing for the
/// same promise).
pub fn propagate_outcome<T>(source: &Promise<T>, targets: Vec<Promise<T>>)
where
    T: Clone + Send + 'static,
{
    source.add_listener(move |done| {
        for target in &targets {
            deliver(done, target);
        }
    });
}

/// Links `source` and `target` bidirectionally: the source's outcome is
/// propagated onto the target, and cancelling the target cancels the source.
pub fn cascade<T>(source: &Promise<T>, target: &Promise<T>)
where
    T: Clone + Send + 'static,
{
    propagate_outcome(source, vec![target.clone()]);

    let source = source.clone();
    target.add_listener(move |done| {
        if done.is_cancelled() {
            source.cancel();
        }
    });
}

fn deliver<T: Clone + Send + 'static>(source: &Promise<T>, target: &Promise<T>) {
    if source.is_cancelled() {
        if !target.cancel() && !target.is_cancelled() {
            tracing::warn!("failed to cancel a notified promise, it is already complete");
        }
    } else if source.is_success() {
        let Some(value) = source.get_now() else {
            return;
        };
        if !target.try_success(value) {
            tracing::warn!("failed to mark a notified promise as success, it is already complete");
        }
    } else if let Some(cause) = source.cause() {
        if !target.try_failure(cause) {
            tracing::warn!("failed to mark a notified promise as failed, it is already complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Cause;
    use std::sync::Arc;

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
    fn success_propagates_to_all_targets() {
        let source = Promise::immediate();
        let targets: Vec<Promise<u32>> = (0..3).map(|_| Promise::immediate()).collect();
        propagate_outcome(&source, targets.clone());

        source.set_success(5);
        for target in &targets {
            assert_eq!(target.get_now(), Some(5));
        }
    }

    #[test]
    fn failure_propagates() {
        let source = Promise::<u32>::immediate();
        let target = Promise::immediate();
        propagate_outcome(&source, vec![target.clone()]);

        source.set_failure(boom());
        assert_eq!(target.cause().unwrap().to_string(), "boom");
    }

    #[test]
    fn cancellation_propagates() {
        let source = Promise::<u32>::immediate();
        let target = Promise::immediate();
        propagate_outcome(&source, vec![target.clone()]);

        source.cancel();
        assert!(target.is_cancelled());
    }

    #[test]
    fn cascade_cancels_source_from_target() {
        let source = Promise::<u32>::immediate();
        let target = Promise::immediate();
        cascade(&source, &target);

        assert!(target.cancel());
        assert!(source.is_cancelled());
    }

    #[test]
    fn cascade_propagates_forward() {
        let source = Promise::immediate();
        let target = Promise::immediate();
        cascade(&source, &target);

        source.set_success(9_u32);
        assert_eq!(target.get_now(), Some(9));
    }
}
