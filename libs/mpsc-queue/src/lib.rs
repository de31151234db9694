// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded multi-producer, single-consumer (MPSC) array queue.
//!
//! The queue is a power-of-two ring of sequence-stamped slots in the style of
//! [Dmitry Vyukov's bounded queue][vyukov]: producers claim a slot by
//! compare-and-swapping the producer cursor and publish the element with a
//! release store of the slot's sequence number; the consumer observes
//! publication with an acquire load and recycles the slot for the next lap.
//!
//! Any number of threads may enqueue concurrently. The consumer side assumes
//! a **single** consumer; calling [`MpscArrayQueue::try_dequeue`],
//! [`MpscArrayQueue::peek_with`] or [`MpscArrayQueue::drain_with`] from two
//! threads at once is a contract violation (it will not corrupt memory, but
//! elements may be lost or duplicated).
//!
//! [vyukov]: http://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue

mod backoff;
mod cache_padded;
mod loom;

use core::fmt;
use core::mem::MaybeUninit;

use crate::backoff::Backoff;
use crate::cache_padded::CachePadded;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};

/// Error returned by [`MpscArrayQueue::try_enqueue`] when the queue is at
/// capacity, handing the rejected element back to the caller.
pub struct Full<T>(pub T);

struct Slot<T> {
    /// Lap stamp. `seq == pos` means the slot is free for the producer that
    /// claims index `pos`; `seq == pos + 1` means an element for consumer
    /// index `pos` has been published.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded MPSC FIFO queue backed by a power-of-two ring buffer.
pub struct MpscArrayQueue<T> {
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
    mask: usize,
    buffer: Box<[Slot<T>]>,
}

// Safety: elements cross threads through the queue, so `T: Send` is required;
// the queue itself holds no thread-affine state.
unsafe impl<T: Send> Send for MpscArrayQueue<T> {}
// Safety: all shared mutation goes through atomics and the slot publication
// protocol described on `Slot::seq`.
unsafe impl<T: Send> Sync for MpscArrayQueue<T> {}

// === impl MpscArrayQueue ===

impl<T> MpscArrayQueue<T> {
    /// Creates a queue with space for at least `capacity` elements, rounded
    /// up to the next power of two (minimum 2).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);

        let buffer = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Box<[_]>>();

        Self {
            enqueue_pos: CachePadded(AtomicUsize::new(0)),
            dequeue_pos: CachePadded(AtomicUsize::new(0)),
            mask: capacity - 1,
            buffer,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to enqueue `value`, failing with [`Full`] when the ring has
    /// no free slot.
    ///
    /// Safe to call from any number of threads concurrently.
    pub fn try_enqueue(&self, value: T) -> Result<(), Full<T>> {
        match self.claim() {
            Some(pos) => {
                self.publish(pos, value);
                Ok(())
            }
            None => Err(Full(value)),
        }
    }

    /// Claims the next producer index, or `None` when the queue is full.
    fn claim(&self) -> Option<usize> {
        let mut backoff = Backoff::new();
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = (seq as isize).wrapping_sub(pos as isize);

            if diff == 0 {
                // the slot is free for this lap; race other producers for it
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(pos),
                    Err(current) => {
                        pos = current;
                        backoff.spin();
                    }
                }
            } else if diff < 0 {
                // the consumer has not recycled this slot yet
                return None;
            } else {
                // another producer claimed `pos`; reload and retry
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    fn publish(&self, pos: usize, value: T) {
        let slot = &self.buffer[pos & self.mask];
        slot.value.with_mut(|p| {
            // Safety: the claim CAS gives this producer exclusive access to
            // the slot until the release store below.
            unsafe { (*p).write(value) };
        });
        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
    }

    /// Dequeues the oldest element, or `None` when no published element is
    /// available.
    ///
    /// Single consumer only.
    pub fn try_dequeue(&self) -> Option<T> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & self.mask];
        let seq = slot.seq.load(Ordering::Acquire);
        let diff = (seq as isize).wrapping_sub(pos.wrapping_add(1) as isize);

        if diff == 0 {
            // single consumer, so a plain store suffices for the cursor
            self.dequeue_pos
                .store(pos.wrapping_add(1), Ordering::Relaxed);
            let value = slot.value.with_mut(|p| {
                // Safety: the acquire load of `seq` synchronises with the
                // producer's publish; we are the only consumer.
                unsafe { (*p).assume_init_read() }
            });
            // recycle the slot for the producer one lap ahead
            slot.seq
                .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
            Some(value)
        } else {
            None
        }
    }

    /// Calls `f` with a reference to the oldest element without consuming it.
    ///
    /// Single consumer only.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buffer[pos & self.mask];
        let seq = slot.seq.load(Ordering::Acquire);
        let diff = (seq as isize).wrapping_sub(pos.wrapping_add(1) as isize);

        if diff == 0 {
            slot.value.with(|p| {
                // Safety: published (acquire above) and stable until this —
                // the single — consumer advances the cursor.
                Some(f(unsafe { (*p).assume_init_ref() }))
            })
        } else {
            None
        }
    }

    /// Dequeues up to `limit` elements, feeding each to `sink`. Returns how
    /// many were drained.
    ///
    /// Single consumer only.
    pub fn drain_with(&self, mut sink: impl FnMut(T), limit: usize) -> usize {
        let mut drained = 0;
        while drained < limit {
            let Some(value) = self.try_dequeue() else {
                break;
            };
            sink(value);
            drained += 1;
        }
        drained
    }

    /// Enqueues up to `limit` elements produced by `supplier`, stopping early
    /// when the queue fills up. Returns how many were enqueued.
    ///
    /// The supplier is only invoked after a slot has been claimed, so no
    /// produced element is ever discarded.
    pub fn fill_with(&self, mut supplier: impl FnMut() -> T, limit: usize) -> usize {
        let mut filled = 0;
        while filled < limit {
            let Some(pos) = self.claim() else {
                break;
            };
            self.publish(pos, supplier());
            filled += 1;
        }
        filled
    }

    /// The number of elements in the queue.
    ///
    /// Like all sizes of concurrent queues this is a moment-in-time
    /// approximation while producers are active.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for MpscArrayQueue<T> {
    fn drop(&mut self) {
        // drop any elements still in flight
        while self.try_dequeue().is_some() {}
    }
}

impl<T> fmt::Debug for MpscArrayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpscArrayQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

// === impl Full ===

impl<T> Full<T> {
    /// Returns the element that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("queue is full")
    }
}

impl<T> core::error::Error for Full<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{model, thread};
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let queue = MpscArrayQueue::with_capacity(8);
        for i in 0..5 {
            queue.try_enqueue(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.try_dequeue(), Some(i));
        }
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn capacity_rounds_up() {
        let queue = MpscArrayQueue::<u32>::with_capacity(5);
        assert_eq!(queue.capacity(), 8);
        let queue = MpscArrayQueue::<u32>::with_capacity(0);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn rejects_when_full() {
        let queue = MpscArrayQueue::with_capacity(2);
        queue.try_enqueue(1).unwrap();
        queue.try_enqueue(2).unwrap();
        let Full(rejected) = queue.try_enqueue(3).unwrap_err();
        assert_eq!(rejected, 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn wraps_around() {
        let queue = MpscArrayQueue::with_capacity(4);
        for lap in 0..3 {
            for i in 0..4 {
                queue.try_enqueue(lap * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(queue.try_dequeue(), Some(lap * 4 + i));
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let queue = MpscArrayQueue::with_capacity(2);
        assert_eq!(queue.peek_with(|v: &u32| *v), None);
        queue.try_enqueue(7).unwrap();
        assert_eq!(queue.peek_with(|v| *v), Some(7));
        assert_eq!(queue.peek_with(|v| *v), Some(7));
        assert_eq!(queue.try_dequeue(), Some(7));
    }

    #[test]
    fn drain_and_fill() {
        let queue = MpscArrayQueue::with_capacity(8);
        let mut next = 0;
        let supplier = || {
            let v = next;
            next += 1;
            v
        };
        assert_eq!(queue.fill_with(supplier, 100), 8);

        let mut drained = Vec::new();
        assert_eq!(queue.drain_with(|v| drained.push(v), 3), 3);
        assert_eq!(drained, [0, 1, 2]);
        assert_eq!(queue.drain_with(|v| drained.push(v), usize::MAX), 5);
        assert_eq!(drained, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn drops_leftover_elements() {
        let queue = MpscArrayQueue::with_capacity(4);
        let value = Arc::new(());
        queue.try_enqueue(Arc::clone(&value)).unwrap();
        queue.try_enqueue(Arc::clone(&value)).unwrap();
        drop(queue);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn two_producers_one_consumer() {
        const PER_PRODUCER: usize = if cfg!(loom) { 2 } else { 1000 };

        model(|| {
            let queue = Arc::new(MpscArrayQueue::with_capacity(
                (2 * PER_PRODUCER).next_power_of_two(),
            ));

            let producers: Vec<_> = (0..2)
                .map(|p| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            queue.try_enqueue(p * PER_PRODUCER + i).unwrap();
                        }
                    })
                })
                .collect();

            for producer in producers {
                producer.join().unwrap();
            }

            let mut seen = Vec::new();
            while let Some(v) = queue.try_dequeue() {
                seen.push(v);
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..2 * PER_PRODUCER).collect::<Vec<_>>());
        });
    }

    // Per-producer FIFO: elements from the same producer come out in the
    // order that producer pushed them, even with a concurrent second
    // producer in the mix.
    #[test]
    fn per_producer_order_is_preserved() {
        const PER_PRODUCER: usize = if cfg!(loom) { 2 } else { 500 };

        model(|| {
            let queue = Arc::new(MpscArrayQueue::with_capacity(
                (2 * PER_PRODUCER).next_power_of_two(),
            ));

            let producers: Vec<_> = (0..2_usize)
                .map(|p| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            queue.try_enqueue((p, i)).unwrap();
                        }
                    })
                })
                .collect();

            for producer in producers {
                producer.join().unwrap();
            }

            let mut last = [None, None];
            while let Some((p, i)) = queue.try_dequeue() {
                if let Some(prev) = last[p] {
                    assert!(i > prev, "producer {p} reordered: {i} after {prev}");
                }
                last[p] = Some(i);
            }
            assert_eq!(last, [Some(PER_PRODUCER - 1), Some(PER_PRODUCER - 1)]);
        });
    }
}
