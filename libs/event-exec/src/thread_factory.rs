// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Spawns worker threads for executors.
///
/// The host controls naming and any platform attributes; the executor only
/// hands over the worker body. Workers are detached — executors observe
/// their lifetime through state transitions, not joins.
pub trait ThreadFactory: Send + Sync {
    /// Spawns a detached worker thread named `name` running `body`.
    ///
    /// # Errors
    ///
    /// Propagates the OS error when the thread cannot be created.
    fn spawn_worker(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<()>;
}

/// The default factory: `std::thread::Builder` with a numbered name prefix.
///
/// Every worker tears down its fast-local storage on exit, so per-thread
/// state registered by tasks is removed on the thread that owns it.
#[derive(Debug)]
pub struct DefaultThreadFactory {
    prefix: String,
    counter: AtomicUsize,
}

// === impl DefaultThreadFactory ===

impl DefaultThreadFactory {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
        }
    }

    /// The shared default instance (prefix `event-exec`).
    pub fn shared() -> Arc<DefaultThreadFactory> {
        static SHARED: std::sync::OnceLock<Arc<DefaultThreadFactory>> = std::sync::OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(DefaultThreadFactory::new("event-exec"))))
    }
}

impl ThreadFactory for DefaultThreadFactory {
    fn spawn_worker(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<()> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}-{name}", self.prefix, id);
        std::thread::Builder::new().name(name).spawn(move || {
            body();
            fast_local::remove_all();
        })?;
        Ok(())
    }
}
