//! Recycling of batch shells.
//!
//! Every batching emitter owns a bounded MPMC free-list of emptied
//! [`Batch`] shells. Consumers return shells after draining them; the
//! emitter drains the list before freshly allocating, so steady-state
//! batched edges run without heap churn. The list is dropped together with
//! the emitter wiring, releasing any shells still parked in it.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::message::Batch;

/// A bounded MPMC free-list of batch shells shared between one emitter and
/// its downstream consumers.
pub(crate) struct BatchPool<T> {
    slots: Arc<ArrayQueue<Batch<T>>>,
}

impl<T> BatchPool<T> {
    /// Creates a pool holding at most `capacity` parked shells.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    /// Takes a recycled shell, or allocates a fresh one sized `batch_size`.
    pub(crate) fn acquire(&self, batch_size: usize) -> Batch<T> {
        self.slots
            .pop()
            .unwrap_or_else(|| Batch::with_capacity(batch_size))
    }

    /// Returns a drained shell; drops it if the pool is full.
    pub(crate) fn release(&self, mut shell: Batch<T>) {
        shell.clear();
        let _ = self.slots.push(shell);
    }

    /// Number of shells currently parked.
    #[cfg(test)]
    pub(crate) fn parked(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Clone for BatchPool<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> std::fmt::Debug for BatchPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPool").field("parked", &self.slots.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_shells() {
        let pool: BatchPool<u64> = BatchPool::new(4);
        let mut b = pool.acquire(8);
        b.push(1, 0, 0, 0);
        pool.release(b);
        assert_eq!(pool.parked(), 1);

        let b = pool.acquire(8);
        assert!(b.is_empty(), "released shells come back cleared");
        assert_eq!(pool.parked(), 0);
    }

    #[test]
    fn full_pool_drops_extra_shells() {
        let pool: BatchPool<u64> = BatchPool::new(1);
        pool.release(Batch::with_capacity(8));
        pool.release(Batch::with_capacity(8));
        assert_eq!(pool.parked(), 1);
    }

    #[test]
    fn shared_across_clones() {
        let pool: BatchPool<u64> = BatchPool::new(2);
        let other = pool.clone();
        other.release(Batch::with_capacity(4));
        assert_eq!(pool.parked(), 1);
    }
}
