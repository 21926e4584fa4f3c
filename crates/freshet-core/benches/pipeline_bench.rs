//! Pipeline throughput benchmarks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use freshet_core::operator::{KeyedWindows, Map, Sink, Source, SourceShipper};
use freshet_core::{ExecutionMode, PipeGraph, TimePolicy};

const TUPLES: u64 = 100_000;

fn run_forward_chain(batch: usize) {
    let sum = Arc::new(AtomicU64::new(0));
    let sink_sum = Arc::clone(&sum);

    let mut g = PipeGraph::new("bench-forward", ExecutionMode::Default, TimePolicy::EventTime);
    g.add_source(
        Source::new(|s: &mut SourceShipper<u64>| {
            for v in 0..TUPLES {
                s.set_next_watermark(v);
                s.push_with_timestamp(v, v);
            }
        })
        .with_output_batch_size(batch),
    )
    .unwrap()
    .chain(Map::new(|v: u64| v.wrapping_mul(31)).with_output_batch_size(batch))
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<u64>| {
        if let Some(v) = v {
            sink_sum.fetch_add(v, Ordering::Relaxed);
        }
    }))
    .unwrap();
    g.run().unwrap();
    assert!(sum.load(Ordering::Relaxed) > 0);
}

fn run_keyed_windows() {
    let count = Arc::new(AtomicU64::new(0));
    let sink_count = Arc::clone(&count);

    let mut g = PipeGraph::new("bench-windows", ExecutionMode::Default, TimePolicy::EventTime);
    g.add_source(Source::new(|s: &mut SourceShipper<(u64, u64)>| {
        for v in 0..TUPLES {
            s.set_next_watermark(v);
            s.push_with_timestamp((v % 16, v), v);
        }
    }))
    .unwrap()
    .chain(
        KeyedWindows::new(|t: &(u64, u64)| t.0, |t: &(u64, u64), acc: &mut u64| *acc += t.1)
            .with_cb_windows(100, 50)
            .with_parallelism(4),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if v.is_some() {
            sink_count.fetch_add(1, Ordering::Relaxed);
        }
    }))
    .unwrap();
    g.run().unwrap();
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_chain");
    group.throughput(Throughput::Elements(TUPLES));
    group.sample_size(10);
    for batch in [0usize, 32, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| run_forward_chain(batch));
        });
    }
    group.finish();
}

fn bench_windows(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed_windows");
    group.throughput(Throughput::Elements(TUPLES));
    group.sample_size(10);
    group.bench_function("cb_100_50", |b| b.iter(run_keyed_windows));
    group.finish();
}

criterion_group!(benches, bench_forward, bench_windows);
criterion_main!(benches);
