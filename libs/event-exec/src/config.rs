// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-environment configuration, read once at first use.

use core::time::Duration;
use std::sync::OnceLock;

fn env_parse<T: core::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, raw, "ignoring unparsable configuration value");
            None
        }
    }
}

/// Default bound on a per-executor task queue (`MAX_PENDING_EXECUTOR_TASKS`).
///
/// Clamped to at least 16; the queue rounds it up to a power of two.
pub fn max_pending_tasks() -> usize {
    static VALUE: OnceLock<usize> = OnceLock::new();
    *VALUE.get_or_init(|| {
        let value = env_parse("MAX_PENDING_EXECUTOR_TASKS")
            .unwrap_or(65536_usize)
            .max(16);
        tracing::debug!(value, "max pending executor tasks");
        value
    })
}

/// Idle interval before the global executor's worker exits
/// (`GLOBAL_EXECUTOR_QUIET_PERIOD_SECONDS`, default 1 second).
pub fn global_quiet_period() -> Duration {
    static VALUE: OnceLock<Duration> = OnceLock::new();
    *VALUE.get_or_init(|| {
        let secs = env_parse("GLOBAL_EXECUTOR_QUIET_PERIOD_SECONDS")
            .unwrap_or(1_u64)
            .max(1);
        tracing::debug!(secs, "global executor quiet period");
        Duration::from_secs(secs)
    })
}

/// Bound on nested inline listener notification
/// (`MAX_LISTENER_STACK_DEPTH`, default 8, minimum 1).
pub fn max_listener_stack_depth() -> usize {
    static VALUE: OnceLock<usize> = OnceLock::new();
    *VALUE.get_or_init(|| {
        let value = env_parse("MAX_LISTENER_STACK_DEPTH")
            .unwrap_or(8_usize)
            .max(1);
        tracing::debug!(value, "max listener stack depth");
        value
    })
}

/// The CPU count used for default group sizing; `AVAILABLE_PROCESSORS`
/// overrides detection.
pub fn available_processors() -> usize {
    static VALUE: OnceLock<usize> = OnceLock::new();
    *VALUE.get_or_init(|| {
        let value = env_parse("AVAILABLE_PROCESSORS").unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, usize::from)
        });
        let value = value.max(1);
        tracing::debug!(value, "available processors");
        value
    })
}
