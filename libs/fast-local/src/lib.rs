// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Slot-indexed per-thread storage for hot-path lookups.
//!
//! A [`FastLocal`] owns one slot index, allocated once from a process-wide
//! counter, and reads/writes the value stored at that index in the calling
//! thread's slot vector. Compared to a keyed map this makes every access an
//! array index — the structure the executor hot paths (thread-affinity
//! checks, listener depth counters) want.
//!
//! Values are strictly thread-confined: they are created, read and dropped on
//! one thread and never synchronised. A variable may register an `on_removal`
//! hook; [`remove_all`] — which executor worker threads call on exit — and
//! thread teardown both deliver the hook for every value the thread still
//! holds.

use core::any::Any;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Hard ceiling on the number of distinct [`FastLocal`] variables in one
/// process, far below the usable index space.
pub const MAX_SLOTS: usize = 4096;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

type ErasedHook = Arc<dyn Fn(&dyn Any) + Send + Sync>;

std::thread_local! {
    static MAP: RefCell<LocalMap> = RefCell::new(LocalMap::new());
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// A cheap, stable identifier for the calling thread, assigned on first use.
///
/// Never zero, so executors can use `0` as "no worker thread".
#[must_use]
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|cell| {
        let id = cell.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        cell.set(id);
        id
    })
}

/// Removes every fast-local value held by the calling thread, delivering each
/// variable's `on_removal` hook.
///
/// Worker threads call this as the last thing before exiting so that
/// per-thread caches registered by tasks are torn down on the thread that
/// owns them.
pub fn remove_all() {
    let (mut slots, cleanup) = MAP.with(|map| {
        let mut map = map.borrow_mut();
        (core::mem::take(&mut map.slots), core::mem::take(&mut map.cleanup))
    });

    // Hooks run outside the borrow: they are allowed to touch other
    // fast-locals of this thread.
    for (index, hook) in cleanup {
        if let Some(value) = slots.get_mut(index).and_then(Option::take) {
            deliver_hook(&hook, value.as_ref());
        }
    }
}

fn deliver_hook(hook: &ErasedHook, value: &dyn Any) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| hook(value)));
    if result.is_err() {
        tracing::warn!("fast-local removal hook panicked");
    }
}

struct LocalMap {
    /// One entry per allocated slot index this thread has touched.
    slots: Vec<Option<Box<dyn Any>>>,
    /// Slots holding a value whose variable registered a removal hook.
    cleanup: Vec<(usize, ErasedHook)>,
}

// === impl LocalMap ===

impl LocalMap {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Option<Box<dyn Any>> {
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        &mut self.slots[index]
    }
}

impl Drop for LocalMap {
    fn drop(&mut self) {
        let mut slots = core::mem::take(&mut self.slots);
        for (index, hook) in core::mem::take(&mut self.cleanup) {
            if let Some(value) = slots.get_mut(index).and_then(Option::take) {
                deliver_hook(&hook, value.as_ref());
            }
        }
    }
}

/// A per-thread variable stored at a fixed slot index.
///
/// The variable itself is typically long-lived (held in a `static` or inside
/// a long-lived component); each thread that touches it gets its own
/// independent value.
pub struct FastLocal<T> {
    index: usize,
    on_removal: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    _p: PhantomData<fn(T) -> T>,
}

// === impl FastLocal ===

impl<T: 'static> FastLocal<T> {
    /// Allocates a fresh slot index for this variable.
    ///
    /// # Panics
    ///
    /// Panics when the process has exhausted [`MAX_SLOTS`] variables; that is
    /// an API misuse (leaking `FastLocal`s in a loop), not a recoverable
    /// condition.
    #[must_use]
    pub fn new() -> Self {
        let index = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
        assert!(index < MAX_SLOTS, "fast-local slot space exhausted");
        Self {
            index,
            on_removal: None,
            _p: PhantomData,
        }
    }

    /// Like [`FastLocal::new`], with a hook delivered whenever a thread's
    /// value is removed ([`FastLocal::remove`], [`remove_all`], or thread
    /// teardown).
    #[must_use]
    pub fn with_on_removal(hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        let mut this = Self::new();
        this.on_removal = Some(Arc::new(hook));
        this
    }

    /// The slot index backing this variable.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Calls `f` with the calling thread's value, or returns `None` when the
    /// slot is unset.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        MAP.with(|map| {
            let map = map.borrow();
            let value = map.slots.get(self.index)?.as_ref()?;
            // the downcast cannot fail: this variable is the only writer of
            // its slot index
            Some(f(value.downcast_ref::<T>()?))
        })
    }

    /// Calls `f` with the calling thread's value, initialising the slot with
    /// `init` first if it is unset.
    pub fn with_or_init<R>(&self, init: impl FnOnce() -> T, f: impl FnOnce(&T) -> R) -> R {
        let initialised = MAP.with(|map| {
            let mut map = map.borrow_mut();
            let slot = map.slot_mut(self.index);
            if slot.is_none() {
                *slot = Some(Box::new(init()));
                true
            } else {
                false
            }
        });
        if initialised {
            self.register_cleanup();
        }
        self.with(f).expect("fast-local slot initialised above")
    }

    /// A copy of the calling thread's value.
    #[must_use]
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// A copy of the calling thread's value, initialising it first if unset.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> T
    where
        T: Clone,
    {
        self.with_or_init(init, T::clone)
    }

    /// Sets the calling thread's value.
    pub fn set(&self, value: T) {
        MAP.with(|map| {
            let mut map = map.borrow_mut();
            *map.slot_mut(self.index) = Some(Box::new(value));
        });
        self.register_cleanup();
    }

    /// Replaces the calling thread's value, returning the previous one.
    pub fn get_and_set(&self, value: T) -> Option<T> {
        let previous = MAP.with(|map| {
            let mut map = map.borrow_mut();
            map.slot_mut(self.index).replace(Box::new(value))
        });
        self.register_cleanup();
        previous.and_then(|v| v.downcast::<T>().ok()).map(|v| *v)
    }

    /// Removes the calling thread's value, delivering the `on_removal` hook
    /// and returning the value.
    pub fn remove(&self) -> Option<T> {
        let value = MAP.with(|map| {
            let mut map = map.borrow_mut();
            let taken = map.slots.get_mut(self.index).and_then(Option::take);
            if taken.is_some() {
                map.cleanup.retain(|(index, _)| *index != self.index);
            }
            taken
        })?;
        let value = *value.downcast::<T>().ok()?;
        if let Some(hook) = &self.on_removal {
            hook(&value);
        }
        Some(value)
    }

    /// Whether the calling thread has a value in this slot.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.with(|_| ()).is_some()
    }

    fn register_cleanup(&self) {
        let Some(hook) = &self.on_removal else {
            return;
        };
        let hook = Arc::clone(hook);
        let index = self.index;
        MAP.with(|map| {
            let mut map = map.borrow_mut();
            if map.cleanup.iter().any(|(i, _)| *i == index) {
                return;
            }
            let erased: ErasedHook = Arc::new(move |value: &dyn Any| {
                if let Some(value) = value.downcast_ref::<T>() {
                    hook(value);
                }
            });
            map.cleanup.push((index, erased));
        });
    }
}

impl<T: 'static> Default for FastLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FastLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastLocal")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
