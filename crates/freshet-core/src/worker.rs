//! Replica worker loops.
//!
//! Each replica runs one of the loops in this module on its own OS thread:
//! pull from the input gate, invoke the operator logic, push through the
//! emitter. On end-of-stream a replica flushes its emitter, propagates the
//! final punctuation, drops its output ports (closing the downstream
//! channels), runs the closing callback, and returns its stats.

use std::time::Instant;

use crate::config::{ExecutionMode, TimePolicy};
use crate::emitter::Emitter;
use crate::gate::{GateEvent, InputGate};
use crate::message::Data;
use crate::operator::source::SourceShipper;
use crate::operator::{ClosingFn, Collector, ReplicaContext, SinkLogic, UnaryLogic};
use crate::stats::ReplicaStats;

/// A replica ready to be spawned: operator slot plus the thread body.
pub(crate) struct Worker {
    pub thread_name: String,
    pub op_index: usize,
    pub body: Box<dyn FnOnce() -> ReplicaStats + Send + 'static>,
}

/// Collector wired to the replica's emitter and stats.
struct EmitterCollector<'a, O: Data> {
    emitter: &'a mut Emitter<O>,
    stats: &'a mut ReplicaStats,
}

impl<O: Data> Collector<O> for EmitterCollector<'_, O> {
    fn emit(&mut self, payload: O, identifier: u64, timestamp: u64, watermark: u64) {
        self.stats.outputs_sent += 1;
        self.stats.bytes_sent += std::mem::size_of::<O>() as u64;
        self.emitter.emit(payload, identifier, timestamp, watermark);
    }
}

fn finish(ctx: &ReplicaContext, closing: Option<&ClosingFn>) {
    if let Some(closing) = closing {
        closing(ctx);
    }
    tracing::debug!(
        operator = %ctx.name,
        replica = ctx.replica_index,
        "replica terminated"
    );
}

/// Runs a source replica: invoke the generator once, then shut the stage
/// down.
pub(crate) fn run_source<O, F>(
    ctx: ReplicaContext,
    mut logic: F,
    emitter: Emitter<O>,
    policy: TimePolicy,
    mode: ExecutionMode,
    closing: Option<ClosingFn>,
) -> ReplicaStats
where
    O: Data,
    F: FnMut(&mut SourceShipper<O>),
{
    tracing::debug!(operator = %ctx.name, replica = ctx.replica_index, "source started");
    let mut shipper = SourceShipper::new(emitter, ctx.clone(), policy, mode);
    let start = Instant::now();
    logic(&mut shipper);
    let (mut emitter, mut stats) = shipper.finish();
    stats
        .service_time
        .record(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
    emitter.propagate_punctuation(u64::MAX);
    drop(emitter);
    finish(&ctx, closing.as_ref());
    stats
}

/// Runs a map/filter/flatmap/window replica.
pub(crate) fn run_unary<I, O>(
    ctx: ReplicaContext,
    mut gate: InputGate<I>,
    mut logic: Box<dyn UnaryLogic<I, O>>,
    mut emitter: Emitter<O>,
    closing: Option<ClosingFn>,
) -> ReplicaStats
where
    I: Data,
    O: Data,
{
    let mut stats = ReplicaStats::new(ctx.replica_index);
    let payload_size = std::mem::size_of::<I>() as u64;
    // Watermark the logic last reacted to; tuples carrying an advanced
    // watermark trigger a firing check without waiting for a punctuation.
    let mut reacted_wm = 0u64;

    loop {
        match gate.next() {
            GateEvent::Single(tuple) => {
                stats.inputs_received += 1;
                stats.bytes_received += payload_size;
                let wm = gate.current_watermark();
                let start = Instant::now();
                {
                    let mut out = EmitterCollector {
                        emitter: &mut emitter,
                        stats: &mut stats,
                    };
                    logic.on_tuple(tuple, wm, &mut out);
                    if wm > reacted_wm {
                        reacted_wm = wm;
                        logic.on_watermark(wm, &mut out);
                    }
                }
                stats
                    .service_time
                    .record(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
            }
            GateEvent::Batch { channel, mut batch } => {
                let wm = gate.current_watermark();
                stats.inputs_received += batch.len() as u64;
                stats.bytes_received += payload_size * batch.len() as u64;
                let start = Instant::now();
                {
                    let mut out = EmitterCollector {
                        emitter: &mut emitter,
                        stats: &mut stats,
                    };
                    for tuple in batch.drain() {
                        logic.on_tuple(tuple, wm, &mut out);
                    }
                    if wm > reacted_wm {
                        reacted_wm = wm;
                        logic.on_watermark(wm, &mut out);
                    }
                }
                stats
                    .service_time
                    .record(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
                gate.recycle(channel, batch);
            }
            GateEvent::Watermark(wm) => {
                let mut out = EmitterCollector {
                    emitter: &mut emitter,
                    stats: &mut stats,
                };
                reacted_wm = reacted_wm.max(wm);
                logic.on_watermark(wm, &mut out);
            }
            GateEvent::Eos => break,
        }
    }

    stats.ignored_tuples = logic.ignored();
    emitter.propagate_punctuation(u64::MAX);
    drop(emitter);
    drop(gate);
    finish(&ctx, closing.as_ref());
    stats
}

/// Runs a sink replica.
pub(crate) fn run_sink<I>(
    ctx: ReplicaContext,
    mut gate: InputGate<I>,
    mut logic: Box<dyn SinkLogic<I>>,
    closing: Option<ClosingFn>,
) -> ReplicaStats
where
    I: Data,
{
    let mut stats = ReplicaStats::new(ctx.replica_index);
    let payload_size = std::mem::size_of::<I>() as u64;

    loop {
        match gate.next() {
            GateEvent::Single(tuple) => {
                stats.inputs_received += 1;
                stats.bytes_received += payload_size;
                let start = Instant::now();
                logic.on_tuple(tuple.payload);
                stats
                    .service_time
                    .record(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
            }
            GateEvent::Batch { channel, mut batch } => {
                let start = Instant::now();
                for tuple in batch.drain() {
                    stats.inputs_received += 1;
                    stats.bytes_received += payload_size;
                    logic.on_tuple(tuple.payload);
                }
                stats
                    .service_time
                    .record(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
                gate.recycle(channel, batch);
            }
            GateEvent::Watermark(_) => {}
            GateEvent::Eos => break,
        }
    }

    logic.on_eos();
    drop(gate);
    finish(&ctx, closing.as_ref());
    stats
}
