//! Message envelopes exchanged between replicas.
//!
//! Every channel carries [`Message`] values: a single tuple, a batch of
//! tuples, or a payload-less punctuation that only advances the channel's
//! watermark. Batches keep one `(identifier, timestamp, watermark)` triple
//! per slot in parallel arrays so that slots can be replayed individually on
//! the consumer side.

/// Marker for types that can flow through a pipeline.
///
/// Tuples move by value along channels and are cloned on broadcast edges,
/// so they must be cheap to clone.
pub trait Data: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Data for T {}

/// A single tuple envelope.
#[derive(Debug, Clone)]
pub struct Single<T> {
    /// User payload.
    pub payload: T,
    /// Sequence number assigned by the producing source replica.
    pub identifier: u64,
    /// Event time in microseconds.
    pub timestamp: u64,
    /// Lower bound on the timestamps of all later envelopes on this channel.
    pub watermark: u64,
}

impl<T> Single<T> {
    /// Creates a new envelope.
    #[must_use]
    pub fn new(payload: T, identifier: u64, timestamp: u64, watermark: u64) -> Self {
        Self {
            payload,
            identifier,
            timestamp,
            watermark,
        }
    }
}

/// A bounded sequence of tuples sharing one envelope.
///
/// Slot metadata lives in parallel arrays; slot watermarks are
/// non-decreasing because the producer's watermark is monotone.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    payloads: Vec<T>,
    identifiers: Vec<u64>,
    timestamps: Vec<u64>,
    watermarks: Vec<u64>,
}

impl<T> Batch<T> {
    /// Creates an empty batch with room for `capacity` slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            payloads: Vec::with_capacity(capacity),
            identifiers: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
            watermarks: Vec::with_capacity(capacity),
        }
    }

    /// Appends a slot.
    pub fn push(&mut self, payload: T, identifier: u64, timestamp: u64, watermark: u64) {
        debug_assert!(
            self.watermarks.last().map_or(true, |&w| w <= watermark),
            "slot watermarks must be non-decreasing within a batch"
        );
        self.payloads.push(payload);
        self.identifiers.push(identifier);
        self.timestamps.push(timestamp);
        self.watermarks.push(watermark);
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Returns true when no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// The batch-level watermark: the watermark of the last slot.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.watermarks.last().copied().unwrap_or(0)
    }

    /// Consumes the slots in order, retaining the buffer allocations so the
    /// shell can be recycled.
    pub fn drain(&mut self) -> impl Iterator<Item = Single<T>> + '_ {
        self.payloads
            .drain(..)
            .zip(self.identifiers.drain(..))
            .zip(self.timestamps.drain(..))
            .zip(self.watermarks.drain(..))
            .map(|(((payload, identifier), timestamp), watermark)| Single {
                payload,
                identifier,
                timestamp,
                watermark,
            })
    }

    /// Clears all slots, retaining allocations for reuse.
    pub fn clear(&mut self) {
        self.payloads.clear();
        self.identifiers.clear();
        self.timestamps.clear();
        self.watermarks.clear();
    }
}

/// A message on a channel.
#[derive(Debug, Clone)]
pub enum Message<T> {
    /// One tuple.
    Single(Single<T>),
    /// A batch of tuples.
    Batch(Batch<T>),
    /// A watermark-only advance; carries no payload.
    Punct {
        /// The advanced watermark.
        watermark: u64,
    },
}

impl<T> Message<T> {
    /// The watermark carried by this message.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        match self {
            Self::Single(s) => s.watermark,
            Self::Batch(b) => b.watermark(),
            Self::Punct { watermark } => *watermark,
        }
    }

    /// Returns true for punctuations.
    #[must_use]
    pub fn is_punct(&self) -> bool {
        matches!(self, Self::Punct { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_parallel_arrays() {
        let mut b = Batch::with_capacity(4);
        assert!(b.is_empty());
        b.push("a", 0, 10, 5);
        b.push("b", 1, 20, 15);
        b.push("c", 2, 30, 15);
        assert_eq!(b.len(), 3);
        assert_eq!(b.watermark(), 15);

        let slots: Vec<_> = b.drain().collect();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].payload, "a");
        assert_eq!(slots[0].timestamp, 10);
        assert_eq!(slots[2].identifier, 2);
        assert_eq!(slots[2].watermark, 15);
    }

    #[test]
    fn batch_clear_retains_nothing() {
        let mut b = Batch::with_capacity(2);
        b.push(1u32, 0, 0, 0);
        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.watermark(), 0);
    }

    #[test]
    fn message_watermark() {
        let m: Message<u32> = Message::Punct { watermark: 42 };
        assert!(m.is_punct());
        assert_eq!(m.watermark(), 42);

        let m = Message::Single(Single::new(7u32, 0, 1, 2));
        assert!(!m.is_punct());
        assert_eq!(m.watermark(), 2);
    }
}
