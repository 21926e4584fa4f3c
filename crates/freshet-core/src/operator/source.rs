//! Source operator: the entry point of a pipeline.
//!
//! The user logic runs once per replica and pushes tuples through a
//! [`SourceShipper`]. Under the ingress-time policy the runtime stamps
//! wall-clock microseconds; under event time the logic supplies timestamps
//! and advances the watermark explicitly with `set_next_watermark`.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::{current_time_usecs, ExecutionMode, TimePolicy};
use crate::emitter::Emitter;
use crate::message::Data;
use crate::operator::{
    validate_parallelism, ConfigError, OpCommon, OpDescriptor, ReplicaContext,
};
use crate::stats::ReplicaStats;

/// Handle through which source logic ships tuples.
///
/// Owns the replica's emitter for the duration of the generator run.
pub struct SourceShipper<O: Data> {
    emitter: Emitter<O>,
    ctx: ReplicaContext,
    stats: ReplicaStats,
    policy: TimePolicy,
    ordered: bool,
    next_identifier: u64,
    watermark: u64,
    last_timestamp: u64,
}

impl<O: Data> SourceShipper<O> {
    pub(crate) fn new(
        emitter: Emitter<O>,
        ctx: ReplicaContext,
        policy: TimePolicy,
        mode: ExecutionMode,
    ) -> Self {
        let stats = ReplicaStats::new(ctx.replica_index);
        Self {
            emitter,
            ctx,
            stats,
            policy,
            ordered: mode.is_ordered(),
            next_identifier: 0,
            watermark: 0,
            last_timestamp: 0,
        }
    }

    pub(crate) fn finish(self) -> (Emitter<O>, ReplicaStats) {
        (self.emitter, self.stats)
    }

    /// Ships a tuple stamped with the current wall-clock time.
    pub fn push(&mut self, payload: O) {
        let ts = current_time_usecs();
        self.ship(payload, ts);
    }

    /// Ships a tuple with an explicit event-time timestamp (µs).
    ///
    /// Under the ordered execution modes timestamps must be pushed in
    /// non-decreasing order per source replica.
    pub fn push_with_timestamp(&mut self, payload: O, timestamp: u64) {
        self.ship(payload, timestamp);
    }

    /// Raises the watermark attached to subsequently shipped tuples.
    /// Regressions are clamped; watermarks only move forward.
    pub fn set_next_watermark(&mut self, watermark: u64) {
        self.watermark = self.watermark.max(watermark);
    }

    /// Number of tuples shipped so far by this replica.
    #[must_use]
    pub fn num_shipped(&self) -> u64 {
        self.next_identifier
    }

    /// Index of this replica within the source operator.
    #[must_use]
    pub fn replica_index(&self) -> usize {
        self.ctx.replica_index
    }

    /// Total replicas of the source operator.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.ctx.parallelism
    }

    fn ship(&mut self, payload: O, timestamp: u64) {
        debug_assert!(
            !self.ordered || timestamp >= self.last_timestamp,
            "ordered execution modes require non-decreasing source timestamps"
        );
        self.last_timestamp = self.last_timestamp.max(timestamp);

        // Ingress time and the ordered modes carry the watermark on every
        // tuple; pure event time advances only via set_next_watermark.
        let candidate = match (self.policy, self.ordered) {
            (TimePolicy::IngressTime, _) | (TimePolicy::EventTime, true) => timestamp,
            (TimePolicy::EventTime, false) => self.watermark,
        };
        self.watermark = self.watermark.max(candidate);

        let identifier = self.next_identifier;
        self.next_identifier += 1;
        self.stats.outputs_sent += 1;
        self.stats.bytes_sent += std::mem::size_of::<O>() as u64;
        self.emitter.emit(payload, identifier, timestamp, self.watermark);
    }
}

/// A source operator.
///
/// The logic closure is cloned once per replica and invoked exactly once;
/// it generates the replica's whole substream and returns when done.
/// Replicas of a parallel source partition the generation work by
/// `shipper.replica_index()`.
pub struct Source<O, F> {
    pub(crate) logic: F,
    pub(crate) common: OpCommon,
    _marker: PhantomData<fn() -> O>,
}

impl<O, F> Source<O, F>
where
    O: Data,
    F: FnMut(&mut SourceShipper<O>) + Clone + Send + 'static,
{
    /// Creates a source from generator logic.
    pub fn new(logic: F) -> Self {
        Self {
            logic,
            common: OpCommon::new("source"),
            _marker: PhantomData,
        }
    }

    /// Sets the diagnostic name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.common.name = name.into();
        self
    }

    /// Sets the number of worker replicas.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.common.parallelism = parallelism;
        self
    }

    /// Enables batched emission with up to `size` tuples per batch
    /// (0 = per-tuple).
    #[must_use]
    pub fn with_output_batch_size(mut self, size: usize) -> Self {
        self.common.output_batch_size = size;
        self
    }

    /// Installs a per-replica teardown callback.
    #[must_use]
    pub fn with_closing(mut self, f: impl Fn(&ReplicaContext) + Send + Sync + 'static) -> Self {
        self.common.closing = Some(Arc::new(f));
        self
    }

    pub(crate) fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Source",
            parallelism: self.common.parallelism,
            output_batch_size: self.common.output_batch_size,
            windowed: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)
    }
}
