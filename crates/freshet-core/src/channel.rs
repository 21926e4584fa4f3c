//! Lock-free SPSC channels between adjacent replicas.
//!
//! Each graph edge installs one bounded single-producer single-consumer
//! ring per `(upstream replica, downstream replica)` pair. Cache-line
//! padded head/tail indices prevent false sharing; the capacity is rounded
//! to a power of two so the wrap is a bitmask. Blocking operations use a
//! spin → yield → sleep backoff ladder.
//!
//! Closing is one-directional: dropping the [`SendPort`] closes the
//! channel, and a drained closed channel reports `Disconnected`. This is
//! how end-of-stream propagates through the graph.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Pads a value to a cache line to prevent false sharing between the
/// producer and consumer indices.
#[repr(C, align(64))]
pub(crate) struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// Bounded spin-then-park backoff used whenever a replica would busy-wait.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// One wait step: spin first, then yield, then short sleeps capped at
    /// 100µs so a parked replica wakes promptly under load changes.
    pub(crate) fn snooze(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts <= 16 {
            std::hint::spin_loop();
        } else if self.attempts <= 32 {
            thread::yield_now();
        } else {
            let sleep_us = (1u64 << (self.attempts - 32).min(6)).min(100);
            thread::sleep(Duration::from_micros(sleep_us));
        }
    }

}

struct Ring<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    capacity_mask: usize,
    closed: AtomicBool,
}

// SAFETY: the ring is shared between exactly one producer and one consumer;
// the atomic head/tail publish slot ownership with Acquire/Release.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be > 0");
        let capacity = capacity.next_power_of_two();
        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();
        Self {
            buffer: buffer.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            capacity_mask: capacity - 1,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    const fn next_index(&self, index: usize) -> usize {
        (index + 1) & self.capacity_mask
    }

    fn try_push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next_tail = self.next_index(tail);
        if next_tail == self.head.load(Ordering::Acquire) {
            return Err(item);
        }
        // SAFETY: single producer; the consumer never reads a slot before
        // tail publishes it.
        unsafe {
            (*self.buffer[tail].get()).write(item);
        }
        self.tail.store(next_tail, Ordering::Release);
        Ok(())
    }

    fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: single consumer; the slot was published by the producer's
        // tail store.
        let item = unsafe { (*self.buffer[head].get()).assume_init_read() };
        self.head.store(self.next_index(head), Ordering::Release);
        Some(item)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

/// Error returned by [`RecvPort::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TryRecvError {
    /// The channel is currently empty but the producer is alive.
    Empty,
    /// The producer dropped its port and the ring is drained.
    Disconnected,
}

/// Producer side of an SPSC channel. Not cloneable; dropping it closes the
/// channel.
pub(crate) struct SendPort<T> {
    ring: Arc<Ring<T>>,
}

/// Consumer side of an SPSC channel.
pub(crate) struct RecvPort<T> {
    ring: Arc<Ring<T>>,
}

/// Creates a bounded SPSC channel.
pub(crate) fn channel<T>(capacity: usize) -> (SendPort<T>, RecvPort<T>) {
    let ring = Arc::new(Ring::new(capacity));
    (SendPort { ring: Arc::clone(&ring) }, RecvPort { ring })
}

impl<T> SendPort<T> {
    /// Pushes, blocking while the ring is full. Backpressure propagates to
    /// the producing replica and, transitively, back to the sources.
    pub(crate) fn send(&self, item: T) {
        let mut item = item;
        let mut backoff = Backoff::new();
        loop {
            match self.ring.try_push(item) {
                Ok(()) => return,
                Err(back) => {
                    item = back;
                    backoff.snooze();
                }
            }
        }
    }
}

impl<T> Drop for SendPort<T> {
    fn drop(&mut self) {
        self.ring.closed.store(true, Ordering::Release);
    }
}

impl<T> RecvPort<T> {
    /// Non-blocking receive.
    pub(crate) fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.ring.try_pop() {
            Some(item) => Ok(item),
            None => {
                if self.ring.closed.load(Ordering::Acquire) && self.ring.is_empty() {
                    Err(TryRecvError::Disconnected)
                } else {
                    Err(TryRecvError::Empty)
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for SendPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPort")
            .field("capacity", &(self.ring.capacity_mask + 1))
            .finish()
    }
}

impl<T> std::fmt::Debug for RecvPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvPort")
            .field("capacity", &(self.ring.capacity_mask + 1))
            .finish()
    }
}
