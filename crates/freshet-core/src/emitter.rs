//! Output emitters: per-stage distribution of tuples to downstream replicas.
//!
//! Every replica owns exactly one [`Emitter`] (sinks own none). An emitter
//! is a tagged sum over the routing modes — forward, broadcast, key-by,
//! reshuffle — plus a split wrapper that dispatches whole sub-emitters by a
//! user selector. Emitters run inline in the producing replica's thread.
//!
//! With a batch size `B > 0`, an emitter accumulates up to `B` tuples per
//! destination and ships the batch when it fills, when `flush` is called,
//! or just before a punctuation leaves. Batch shells are recycled through
//! the emitter's [`BatchPool`].
//!
//! In default execution mode, multi-destination emitters periodically
//! check for quiet destinations: every `amount` received inputs, if the
//! sampling interval elapsed, destinations with zero deliveries in the
//! sample receive a punctuation carrying the current watermark so that
//! event time keeps progressing on quiet key classes.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use fxhash::FxHasher;

use crate::channel::SendPort;
use crate::config::{WatermarkCadence, DEFAULT_POOL_CAPACITY};
use crate::message::{Batch, Data, Message, Single};
use crate::pool::BatchPool;

/// Routing rule of a basic (non-split) emitter.
pub(crate) enum Routing<T> {
    /// Single destination, pass-through.
    Forward,
    /// Every tuple to every destination.
    Broadcast,
    /// `FxHash(key) % num_dests`.
    KeyBy(Arc<dyn Fn(&T) -> u64 + Send + Sync>),
    /// Round-robin, advancing one destination per tuple.
    Reshuffle,
}

impl<T> Routing<T> {
    fn name(&self) -> &'static str {
        match self {
            Self::Forward => "FORWARD",
            Self::Broadcast => "BROADCAST",
            Self::KeyBy(_) => "KEYBY",
            Self::Reshuffle => "RESHUFFLE",
        }
    }
}

/// Hashes a key with the router's fixed hasher.
pub(crate) fn hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

pub(crate) struct BasicEmitter<T> {
    routing: Routing<T>,
    dests: Vec<SendPort<Message<T>>>,
    batch_size: usize,
    batches: Vec<Option<Batch<T>>>,
    pool: BatchPool<T>,
    /// Monotonicity guard, one per destination.
    last_sent_wm: Vec<u64>,
    /// Deliveries per destination since the last punctuation sample.
    delivered: Vec<u64>,
    received_inputs: u64,
    last_punct_at: Instant,
    cadence: WatermarkCadence,
    /// Punctuation generation runs only in default mode and only with
    /// multiple destinations.
    punct_generation: bool,
    /// Round-robin cursor.
    rr_next: usize,
}

impl<T: Data> BasicEmitter<T> {
    pub(crate) fn new(
        routing: Routing<T>,
        dests: Vec<SendPort<Message<T>>>,
        batch_size: usize,
        punct_generation: bool,
        cadence: WatermarkCadence,
    ) -> Self {
        let n = dests.len();
        debug_assert!(n > 0, "emitter needs at least one destination");
        if let Routing::Forward = routing {
            debug_assert_eq!(n, 1, "forward emitter has exactly one destination");
        }
        Self {
            routing,
            dests,
            batch_size,
            batches: (0..n).map(|_| None).collect(),
            pool: BatchPool::new(DEFAULT_POOL_CAPACITY),
            last_sent_wm: vec![0; n],
            delivered: vec![0; n],
            received_inputs: 0,
            last_punct_at: Instant::now(),
            cadence,
            punct_generation: punct_generation && n > 1,
            rr_next: 0,
        }
    }

    /// Handle on this emitter's recycling pool, for installation on the
    /// downstream gates.
    pub(crate) fn pool_handle(&self) -> BatchPool<T> {
        self.pool.clone()
    }

    /// Hands a tuple to the emitter.
    pub(crate) fn emit(&mut self, payload: T, identifier: u64, timestamp: u64, watermark: u64) {
        self.received_inputs += 1;
        if self.punct_generation && self.received_inputs % self.cadence.amount == 0 {
            self.generate_punctuation(watermark);
        }
        match &self.routing {
            Routing::Forward => self.route_to(0, payload, identifier, timestamp, watermark),
            Routing::Reshuffle => {
                let dest = self.rr_next;
                self.rr_next = (self.rr_next + 1) % self.dests.len();
                self.route_to(dest, payload, identifier, timestamp, watermark);
            }
            Routing::KeyBy(hasher) => {
                let dest = (hasher(&payload) % self.dests.len() as u64) as usize;
                self.route_to(dest, payload, identifier, timestamp, watermark);
            }
            Routing::Broadcast => {
                let last = self.dests.len() - 1;
                for dest in 0..last {
                    self.route_to(dest, payload.clone(), identifier, timestamp, watermark);
                }
                // The last destination takes the original.
                self.route_to(last, payload, identifier, timestamp, watermark);
            }
        }
    }

    fn route_to(&mut self, dest: usize, payload: T, identifier: u64, timestamp: u64, watermark: u64) {
        if self.batch_size == 0 {
            self.send(dest, Message::Single(Single::new(payload, identifier, timestamp, watermark)));
            return;
        }
        if self.batches[dest].is_none() {
            self.batches[dest] = Some(self.pool.acquire(self.batch_size));
        }
        let batch = self.batches[dest].as_mut().expect("slot just populated");
        batch.push(payload, identifier, timestamp, watermark);
        if batch.len() >= self.batch_size {
            let full = self.batches[dest].take().expect("batch just filled");
            self.send(dest, Message::Batch(full));
        }
    }

    fn send(&mut self, dest: usize, msg: Message<T>) {
        let wm = msg.watermark();
        debug_assert!(
            self.last_sent_wm[dest] <= wm,
            "outgoing watermark regression to destination {dest}: {} -> {wm}",
            self.last_sent_wm[dest],
        );
        self.last_sent_wm[dest] = wm;
        self.dests[dest].send(msg);
        self.delivered[dest] += 1;
    }

    /// Ships any partially filled batches.
    pub(crate) fn flush(&mut self) {
        for dest in 0..self.dests.len() {
            if let Some(batch) = self.batches[dest].take() {
                if batch.is_empty() {
                    self.pool.release(batch);
                } else {
                    self.send(dest, Message::Batch(batch));
                }
            }
        }
    }

    /// Flushes and sends a punctuation to every destination.
    pub(crate) fn propagate_punctuation(&mut self, watermark: u64) {
        self.flush();
        for dest in 0..self.dests.len() {
            debug_assert!(self.last_sent_wm[dest] <= watermark);
            self.last_sent_wm[dest] = watermark;
            self.dests[dest].send(Message::Punct { watermark });
        }
    }

    /// End-of-sample check: punctuate destinations that saw no deliveries.
    fn generate_punctuation(&mut self, watermark: u64) {
        if self.last_punct_at.elapsed() < self.cadence.interval {
            return;
        }
        let mut any_quiet = false;
        for dest in 0..self.dests.len() {
            if self.delivered[dest] == 0 {
                // A quiet destination first gets its partial batch, if any.
                if let Some(batch) = self.batches[dest].take() {
                    debug_assert!(!batch.is_empty());
                    self.send(dest, Message::Batch(batch));
                }
                let wm = watermark.max(self.last_sent_wm[dest]);
                self.last_sent_wm[dest] = wm;
                self.dests[dest].send(Message::Punct { watermark: wm });
                any_quiet = true;
            } else {
                self.delivered[dest] = 0;
            }
        }
        if any_quiet {
            tracing::trace!(watermark, "punctuated quiet destinations");
        }
        self.last_punct_at = Instant::now();
    }

}

/// A replica's output side.
pub(crate) enum Emitter<T> {
    /// One routing mode, one destination set.
    Basic(BasicEmitter<T>),
    /// Split stage: a selector picks the branch, each branch is a full
    /// emitter of its own (with its own routing, batching, destinations).
    Split {
        selector: Arc<dyn Fn(&T) -> usize + Send + Sync>,
        branches: Vec<Emitter<T>>,
    },
}

impl<T: Data> Emitter<T> {
    /// Hands a tuple to the emitter.
    pub(crate) fn emit(&mut self, payload: T, identifier: u64, timestamp: u64, watermark: u64) {
        match self {
            Self::Basic(e) => e.emit(payload, identifier, timestamp, watermark),
            Self::Split { selector, branches } => {
                let idx = selector(&payload);
                assert!(
                    idx < branches.len(),
                    "split selector returned {idx} for {} branches",
                    branches.len()
                );
                branches[idx].emit(payload, identifier, timestamp, watermark);
            }
        }
    }

    /// Ships partially filled batches on every path.
    pub(crate) fn flush(&mut self) {
        match self {
            Self::Basic(e) => e.flush(),
            Self::Split { branches, .. } => {
                for b in branches {
                    b.flush();
                }
            }
        }
    }

    /// Flushes, then forwards a punctuation to every destination of every
    /// path.
    pub(crate) fn propagate_punctuation(&mut self, watermark: u64) {
        match self {
            Self::Basic(e) => e.propagate_punctuation(watermark),
            Self::Split { branches, .. } => {
                for b in branches {
                    b.propagate_punctuation(watermark);
                }
            }
        }
    }

}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic(e) => f
                .debug_struct("Emitter")
                .field("routing", &e.routing.name())
                .field("destinations", &e.dests.len())
                .field("batch_size", &e.batch_size)
                .finish(),
            Self::Split { branches, .. } => f
                .debug_struct("Emitter")
                .field("routing", &"SPLIT")
                .field("branches", &branches.len())
                .finish(),
        }
    }
}
