// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;
use std::sync::Arc;

/// The cause of a promise failure.
///
/// Stored by reference count so that every listener and waiter can observe
/// the same cause.
pub type Cause = Arc<dyn core::error::Error + Send + Sync + 'static>;

/// A submission was refused.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RejectedError {
    /// The executor's task queue was at capacity.
    QueueFull,
    /// The executor no longer accepts work.
    Shutdown,
}

impl fmt::Display for RejectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectedError::QueueFull => f.write_str("task queue is full"),
            RejectedError::Shutdown => f.write_str("executor is shut down"),
        }
    }
}

impl core::error::Error for RejectedError {}

/// A blocking wait could not be entered.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AwaitError {
    /// The wait was attempted from the thread that is expected to complete
    /// the promise; blocking would hang the executor.
    Deadlock,
}

impl fmt::Display for AwaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwaitError::Deadlock => {
                f.write_str("blocking wait from the promise's own executor thread")
            }
        }
    }
}

impl core::error::Error for AwaitError {}

/// Error returned by [`Promise::sync`](crate::Promise::sync), re-raising
/// the terminal outcome of the promise.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// See [`AwaitError::Deadlock`].
    Deadlock,
    /// The promise was cancelled.
    Cancelled,
    /// The task failed; carries the original cause.
    Failed(Cause),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Deadlock => {
                f.write_str("blocking wait from the promise's own executor thread")
            }
            SyncError::Cancelled => f.write_str("promise was cancelled"),
            SyncError::Failed(cause) => write!(f, "task failed: {cause}"),
        }
    }
}

impl core::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            SyncError::Failed(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<AwaitError> for SyncError {
    fn from(err: AwaitError) -> Self {
        match err {
            AwaitError::Deadlock => SyncError::Deadlock,
        }
    }
}

/// Error returned by the `invoke_*` helpers.
#[derive(Debug, Clone)]
pub enum InvokeError {
    /// One of the submissions was refused.
    Rejected(RejectedError),
    /// The deadline elapsed before an outcome was available.
    TimedOut,
    /// Every submitted task failed; carries the first observed cause.
    Failed(Cause),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Rejected(err) => write!(f, "submission rejected: {err}"),
            InvokeError::TimedOut => f.write_str("timed out"),
            InvokeError::Failed(cause) => write!(f, "all tasks failed: {cause}"),
        }
    }
}

impl core::error::Error for InvokeError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            InvokeError::Rejected(err) => Some(err),
            InvokeError::Failed(cause) => Some(cause.as_ref()),
            InvokeError::TimedOut => None,
        }
    }
}

impl From<RejectedError> for InvokeError {
    fn from(err: RejectedError) -> Self {
        InvokeError::Rejected(err)
    }
}

/// Terminal state of a cancelled promise, used as its [`Cause`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("cancelled")
    }
}

impl core::error::Error for Cancelled {}

/// A task panicked; carries the panic message as the failure cause.
#[derive(Debug, Clone)]
pub struct ExecutionPanic {
    message: String,
}

impl ExecutionPanic {
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ExecutionPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task panicked: {}", self.message)
    }
}

impl core::error::Error for ExecutionPanic {}

/// Converts a `catch_unwind` payload into a [`Cause`].
pub(crate) fn panic_cause(payload: Box<dyn Any + Send>) -> Cause {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    };
    Arc::new(ExecutionPanic { message })
}
