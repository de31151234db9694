// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduled-task engine: an executor-owned deadline heap plus the
//! submission protocol that keeps it executor-owned.
//!
//! In-loop submissions insert into the heap directly. Outside-loop
//! submissions go through a two-phase handshake with the host:
//!
//! 1. `before_scheduled_task_submitted(deadline)` returning `true` means the
//!    host wants to be woken immediately — the insertion travels as a
//!    regular (waking) task.
//! 2. Otherwise the insertion travels as a lazy task, and
//!    `after_scheduled_task_submitted(deadline)` decides whether a `WAKEUP`
//!    sentinel must chase it.
//!
//! Hosts that block on I/O use the hooks to wake their selector exactly when
//! a nearer deadline appears; the default host answers `true` to the first
//! hook and never sees the second.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RejectedError;
use crate::executor::Task;
use crate::scheduled::heap::IndexedHeap;
use crate::scheduled::{ScheduledTask, TaskRef};

/// The executor side of the scheduled engine.
pub(crate) trait ScheduledHost: Send + Sync {
    fn engine(&self) -> &Engine;

    /// The current reading of the executor's ticker.
    fn ticker_nanos(&self) -> u64;

    /// Whether the calling thread is the executor's worker.
    fn in_loop(&self) -> bool;

    fn is_shutting_down(&self) -> bool;

    /// Enqueues an internal task, waking the worker.
    fn execute_internal(&self, task: Task) -> Result<(), RejectedError>;

    /// Enqueues an internal task without waking the worker.
    fn execute_lazy_internal(&self, task: Task) -> Result<(), RejectedError> {
        self.execute_internal(task)
    }

    /// First phase of the outside-loop submission handshake; `true` requests
    /// an immediately-waking submission.
    fn before_scheduled_task_submitted(&self, _deadline_nanos: u64) -> bool {
        true
    }

    /// Second phase; `true` requests a `WAKEUP` sentinel after a lazy
    /// submission.
    fn after_scheduled_task_submitted(&self, _deadline_nanos: u64) -> bool {
        true
    }

    /// Enqueues the `WAKEUP` sentinel.
    fn enqueue_wakeup(&self) {}

    /// Runs after an off-loop cancellation's removal task; hosts that
    /// support suspension use it to re-enter suspension when idle.
    fn removal_task_epilogue(&self) {}
}

struct SchedQueue {
    heap: IndexedHeap<TaskRef>,
    /// Monotonic id source; ids order tasks with equal deadlines.
    next_id: u64,
}

/// The deadline heap plus its id counter, guarded as one unit.
pub(crate) struct Engine {
    queue: Mutex<SchedQueue>,
}

// === impl Engine ===

impl Engine {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(SchedQueue {
                heap: IndexedHeap::new(),
                next_id: 1,
            }),
        }
    }

    /// Inserts `task`, assigning its id on first contact. Cancelled records
    /// are dropped instead of queued.
    pub(crate) fn insert(&self, task: Arc<ScheduledTask>) {
        let mut queue = self.queue.lock();
        if task.id() == 0 {
            task.assign_id(queue.next_id);
            queue.next_id += 1;
        }
        if task.is_cancel_requested() {
            return;
        }
        queue.heap.push(TaskRef(task));
    }

    /// Removes `task` from the heap; no-op if it is not queued.
    pub(crate) fn remove(&self, task: &Arc<ScheduledTask>) -> bool {
        self.queue.lock().heap.remove(&TaskRef(Arc::clone(task)))
    }

    /// Pops the head if its deadline is due at `now`.
    pub(crate) fn poll_expired(&self, now: u64) -> Option<Arc<ScheduledTask>> {
        let mut queue = self.queue.lock();
        let due = queue
            .heap
            .peek()
            .is_some_and(|head| head.0.deadline_nanos() <= now);
        if !due {
            return None;
        }
        queue.heap.pop().map(|node| node.0)
    }

    /// The deadline of the nearest scheduled task.
    pub(crate) fn peek_deadline(&self) -> Option<u64> {
        self.queue
            .lock()
            .heap
            .peek()
            .map(|head| head.0.deadline_nanos())
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().heap.len()
    }

    /// Cancels every queued record (without individual removal) and clears
    /// the heap. In-loop only; the caller asserts that.
    pub(crate) fn cancel_all(&self) {
        let tasks: Vec<Arc<ScheduledTask>> = {
            let mut queue = self.queue.lock();
            let tasks = queue.heap.iter().map(|node| Arc::clone(&node.0)).collect();
            queue.heap.clear_ignoring_indexes();
            tasks
        };
        // promise completion may run listeners; keep it outside the lock
        for task in tasks {
            task.cancel_without_remove();
        }
    }
}

/// Routes `task` into the host's heap, honouring executor ownership: direct
/// insertion in-loop, the two-phase handshake otherwise.
pub(crate) fn submit(
    host: &Arc<dyn ScheduledHost>,
    task: Arc<ScheduledTask>,
) -> Result<(), RejectedError> {
    if host.in_loop() {
        host.engine().insert(task);
        return Ok(());
    }

    let deadline = task.deadline_nanos();
    let insert = {
        let host = Arc::clone(host);
        let task = Arc::clone(&task);
        Box::new(move || host.engine().insert(task))
    };

    if host.before_scheduled_task_submitted(deadline) {
        host.execute_internal(insert)
    } else {
        host.execute_lazy_internal(insert)?;
        if host.after_scheduled_task_submitted(deadline) {
            host.enqueue_wakeup();
        }
        Ok(())
    }
}
