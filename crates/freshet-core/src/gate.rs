//! Input gates: how a replica consumes its input channels.
//!
//! A gate owns the replica's receive ports and its watermark tracker and
//! hands the worker loop a stream of [`GateEvent`]s. The consumption
//! discipline depends on the execution mode:
//!
//! - **Default**: FIFO per channel, round-robin across channels.
//! - **Deterministic**: K-way merge in non-decreasing
//!   `(timestamp, channel index)` order. A channel with nothing buffered
//!   holds the merge back until its received watermark passes the smallest
//!   candidate, so the delivery order is a pure function of the input.
//! - **Probabilistic**: the deterministic merge with a slack: an empty
//!   channel is considered "past" once its watermark is within `slack` of
//!   the candidate timestamp.
//!
//! The tracker is updated with an envelope's watermark at the moment that
//! envelope is *delivered* (not when it is drained into the merge buffers),
//! so window firing never observes a watermark ahead of still-pending
//! earlier tuples.

use std::collections::VecDeque;

use crate::channel::{Backoff, RecvPort, TryRecvError};
use crate::config::ExecutionMode;
use crate::message::{Batch, Message, Single};
use crate::pool::BatchPool;
use crate::watermark::WatermarkTracker;

/// An event delivered by an input gate.
#[derive(Debug)]
pub(crate) enum GateEvent<T> {
    /// A tuple; the gate has already folded its watermark into the tracker.
    Single(Single<T>),
    /// A batch of tuples; its batch-level watermark has been applied.
    /// After draining it, hand the shell back via [`InputGate::recycle`].
    Batch {
        /// Input channel the batch arrived on.
        channel: usize,
        /// The batch itself.
        batch: Batch<T>,
    },
    /// A punctuation advanced the replica's minimum input watermark to the
    /// carried value.
    Watermark(u64),
    /// Every input channel is closed and drained.
    Eos,
}

/// Entry buffered per channel by the ordered modes.
#[derive(Debug)]
enum Pending<T> {
    Tuple(Single<T>),
    Punct(u64),
}

impl<T> Pending<T> {
    /// Merge position: a punctuation sorts at its watermark, which bounds
    /// every later timestamp on the channel.
    fn order_ts(&self) -> u64 {
        match self {
            Self::Tuple(s) => s.timestamp,
            Self::Punct(wm) => *wm,
        }
    }
}

/// A replica's input side: receive ports plus watermark tracking.
pub(crate) struct InputGate<T> {
    inputs: Vec<RecvPort<Message<T>>>,
    tracker: WatermarkTracker,
    mode: ExecutionMode,
    /// Round-robin cursor (default mode).
    next_channel: usize,
    /// Channels that have not yet disconnected.
    open: Vec<bool>,
    /// Per-channel merge buffers (ordered modes).
    pending: Vec<VecDeque<Pending<T>>>,
    /// Highest watermark drained off each channel (ordered modes); a lower
    /// bound on everything the channel will deliver later.
    received_wm: Vec<u64>,
    /// Per-channel handle on the producing emitter's recycling pool.
    pools: Vec<Option<BatchPool<T>>>,
}

impl<T> InputGate<T> {
    pub(crate) fn new(inputs: Vec<RecvPort<Message<T>>>, mode: ExecutionMode) -> Self {
        let n = inputs.len();
        Self {
            inputs,
            tracker: WatermarkTracker::new(n),
            mode,
            next_channel: 0,
            open: vec![true; n],
            pending: (0..n).map(|_| VecDeque::new()).collect(),
            received_wm: vec![0; n],
            pools: (0..n).map(|_| None).collect(),
        }
    }

    /// Installs the recycling pools, one per input channel, so drained
    /// batch shells find their way back to the producing emitters.
    pub(crate) fn set_pools(&mut self, pools: Vec<Option<BatchPool<T>>>) {
        debug_assert_eq!(pools.len(), self.inputs.len());
        self.pools = pools;
    }

    /// Returns a drained batch shell to the emitter that allocated it.
    pub(crate) fn recycle(&self, channel: usize, shell: Batch<T>) {
        if let Some(pool) = self.pools.get(channel).and_then(Option::as_ref) {
            pool.release(shell);
        }
    }

    /// The replica's current minimum input watermark.
    pub(crate) fn current_watermark(&self) -> u64 {
        self.tracker.current()
    }

    /// Blocks until the next event is available.
    pub(crate) fn next(&mut self) -> GateEvent<T> {
        match self.mode {
            ExecutionMode::Default => self.next_fifo(),
            ExecutionMode::Deterministic => self.next_ordered(0),
            ExecutionMode::Probabilistic { slack_usec } => self.next_ordered(slack_usec),
        }
    }

    fn next_fifo(&mut self) -> GateEvent<T> {
        let n = self.inputs.len();
        let mut backoff = Backoff::new();
        loop {
            let mut any_open = false;
            for step in 0..n {
                let ch = (self.next_channel + step) % n;
                if !self.open[ch] {
                    continue;
                }
                any_open = true;
                match self.inputs[ch].try_recv() {
                    Ok(msg) => {
                        self.next_channel = (ch + 1) % n;
                        return self.deliver(ch, msg);
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        self.open[ch] = false;
                    }
                }
            }
            if !any_open {
                return GateEvent::Eos;
            }
            backoff.snooze();
        }
    }

    fn deliver(&mut self, channel: usize, msg: Message<T>) -> GateEvent<T> {
        match msg {
            Message::Single(s) => {
                self.tracker.update(channel, s.watermark);
                GateEvent::Single(s)
            }
            Message::Batch(b) => {
                self.tracker.update(channel, b.watermark());
                GateEvent::Batch { channel, batch: b }
            }
            Message::Punct { watermark } => {
                let min = self.tracker.update(channel, watermark);
                GateEvent::Watermark(min)
            }
        }
    }

    fn next_ordered(&mut self, slack: u64) -> GateEvent<T> {
        let mut backoff = Backoff::new();
        loop {
            self.drain_into_buffers();

            let candidate = self
                .pending
                .iter()
                .enumerate()
                .filter_map(|(ch, q)| q.front().map(|p| (p.order_ts(), ch)))
                .min();

            let Some((cand_ts, cand_ch)) = candidate else {
                if self.open.iter().all(|o| !o) {
                    return GateEvent::Eos;
                }
                backoff.snooze();
                continue;
            };

            if self.all_channels_past(cand_ts.saturating_sub(slack), cand_ch) {
                let entry = self.pending[cand_ch]
                    .pop_front()
                    .expect("candidate channel has a buffered entry");
                return match entry {
                    Pending::Tuple(s) => {
                        self.tracker.update(cand_ch, s.watermark);
                        GateEvent::Single(s)
                    }
                    Pending::Punct(wm) => {
                        let min = self.tracker.update(cand_ch, wm);
                        GateEvent::Watermark(min)
                    }
                };
            }
            backoff.snooze();
        }
    }

    /// True when every channel other than `cand_ch` either has something
    /// buffered (its head bounds it), is closed, or has already promised —
    /// via its received watermark — that nothing at or before `threshold`
    /// is still coming. The comparison is strict so an equal-timestamp
    /// tuple on a lower channel index can never be overtaken.
    fn all_channels_past(&self, threshold: u64, cand_ch: usize) -> bool {
        self.pending.iter().enumerate().all(|(ch, q)| {
            ch == cand_ch
                || !q.is_empty()
                || !self.open[ch]
                || self.received_wm[ch] > threshold
        })
    }

    /// Moves everything currently sitting in the rings into the per-channel
    /// merge buffers, exploding batches into their slots.
    fn drain_into_buffers(&mut self) {
        for ch in 0..self.inputs.len() {
            if !self.open[ch] {
                continue;
            }
            loop {
                match self.inputs[ch].try_recv() {
                    Ok(Message::Single(s)) => {
                        self.received_wm[ch] = self.received_wm[ch].max(s.watermark);
                        self.pending[ch].push_back(Pending::Tuple(s));
                    }
                    Ok(Message::Batch(mut b)) => {
                        self.received_wm[ch] = self.received_wm[ch].max(b.watermark());
                        for s in b.drain() {
                            self.pending[ch].push_back(Pending::Tuple(s));
                        }
                        if let Some(pool) = self.pools.get(ch).and_then(Option::as_ref) {
                            pool.release(b);
                        }
                    }
                    Ok(Message::Punct { watermark }) => {
                        self.received_wm[ch] = self.received_wm[ch].max(watermark);
                        self.pending[ch].push_back(Pending::Punct(watermark));
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.open[ch] = false;
                        break;
                    }
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for InputGate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputGate")
            .field("fan_in", &self.inputs.len())
            .field("mode", &self.mode)
            .field("watermark", &self.tracker.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use crate::config::DEFAULT_CHANNEL_CAPACITY;

    fn single(v: u32, ts: u64, wm: u64) -> Message<u32> {
        Message::Single(Single::new(v, 0, ts, wm))
    }

    #[test]
    fn fifo_round_robin_and_eos() {
        let (tx0, rx0) = channel(DEFAULT_CHANNEL_CAPACITY);
        let (tx1, rx1) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut gate = InputGate::new(vec![rx0, rx1], ExecutionMode::Default);

        tx0.send(single(1, 10, 10));
        tx1.send(single(2, 5, 5));
        drop(tx0);
        drop(tx1);

        let mut got = Vec::new();
        loop {
            match gate.next() {
                GateEvent::Single(s) => got.push(s.payload),
                GateEvent::Eos => break,
                _ => {}
            }
        }
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn punct_advances_watermark() {
        let (tx, rx) = channel::<Message<u32>>(DEFAULT_CHANNEL_CAPACITY);
        let mut gate = InputGate::new(vec![rx], ExecutionMode::Default);

        tx.send(Message::Punct { watermark: 77 });
        match gate.next() {
            GateEvent::Watermark(wm) => assert_eq!(wm, 77),
            other => panic!("expected watermark event, got {other:?}"),
        }
        assert_eq!(gate.current_watermark(), 77);
        drop(tx);
        assert!(matches!(gate.next(), GateEvent::Eos));
    }

    #[test]
    fn deterministic_merge_orders_by_timestamp_then_channel() {
        let (tx0, rx0) = channel(DEFAULT_CHANNEL_CAPACITY);
        let (tx1, rx1) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut gate = InputGate::new(vec![rx0, rx1], ExecutionMode::Deterministic);

        tx0.send(single(10, 10, 10));
        tx0.send(single(30, 30, 30));
        tx1.send(single(20, 20, 20));
        tx1.send(single(31, 30, 30));
        drop(tx0);
        drop(tx1);

        let mut got = Vec::new();
        loop {
            match gate.next() {
                GateEvent::Single(s) => got.push(s.payload),
                GateEvent::Eos => break,
                _ => {}
            }
        }
        // Equal timestamps (30) break ties by channel index: channel 0 first.
        assert_eq!(got, vec![10, 20, 30, 31]);
    }

    #[test]
    fn deterministic_merge_waits_for_lagging_channel() {
        use std::thread;
        use std::time::Duration;

        let (tx0, rx0) = channel(DEFAULT_CHANNEL_CAPACITY);
        let (tx1, rx1) = channel(DEFAULT_CHANNEL_CAPACITY);
        let mut gate = InputGate::new(vec![rx0, rx1], ExecutionMode::Deterministic);

        tx0.send(single(100, 100, 100));
        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx1.send(single(50, 50, 50));
            drop(tx1);
        });

        // The first delivery must be the late channel's earlier tuple.
        match gate.next() {
            GateEvent::Single(s) => assert_eq!(s.payload, 50),
            other => panic!("unexpected event {other:?}"),
        }
        match gate.next() {
            GateEvent::Single(s) => assert_eq!(s.payload, 100),
            other => panic!("unexpected event {other:?}"),
        }
        drop(tx0);
        late.join().unwrap();
        assert!(matches!(gate.next(), GateEvent::Eos));
    }

    #[test]
    fn probabilistic_slack_unblocks_quiet_channel() {
        let (tx0, rx0) = channel(DEFAULT_CHANNEL_CAPACITY);
        let (tx1, rx1) = channel::<Message<u32>>(DEFAULT_CHANNEL_CAPACITY);
        let mut gate =
            InputGate::new(vec![rx0, rx1], ExecutionMode::Probabilistic { slack_usec: 1000 });

        // Channel 1 has only advanced to wm=20, but slack 1000 covers the
        // candidate at ts=100.
        tx1.send(Message::Punct { watermark: 20 });
        tx0.send(single(1, 100, 100));

        // Drain the punct first (it is the smaller candidate), then the
        // tuple must come through without channel 1 reaching ts 100.
        let mut seen_tuple = false;
        for _ in 0..2 {
            match gate.next() {
                GateEvent::Single(s) => {
                    assert_eq!(s.payload, 1);
                    seen_tuple = true;
                }
                GateEvent::Watermark(_) => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(seen_tuple);
        drop(tx0);
        drop(tx1);
    }
}
