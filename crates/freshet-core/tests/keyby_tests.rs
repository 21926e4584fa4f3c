//! Key-by routing: stability, determinism of destination assignment, and
//! batched-emission equivalence.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use freshet_core::operator::{Map, Sink, Source, SourceShipper};
use freshet_core::{ExecutionMode, PipeGraph, TimePolicy};

/// The router's key hash: `FxHash(key) % num_dests`.
fn expected_dest(key: u64, num_dests: u64) -> u64 {
    let mut hasher = fxhash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish() % num_dests
}

fn run_keyed_pipeline(batch_size: usize) -> (u64, Vec<u64>, HashMap<u64, ThreadId>) {
    let sum = Arc::new(AtomicU64::new(0));
    let values = Arc::new(Mutex::new(Vec::new()));
    let key_threads: Arc<Mutex<HashMap<u64, Vec<ThreadId>>>> = Arc::new(Mutex::new(HashMap::new()));

    let sink_sum = Arc::clone(&sum);
    let sink_values = Arc::clone(&values);
    let map_threads = Arc::clone(&key_threads);

    let mut g = PipeGraph::new("keyby", ExecutionMode::Default, TimePolicy::EventTime);
    let source = Source::new(|s: &mut SourceShipper<(u64, u64)>| {
        for i in 0..10_000u64 {
            s.set_next_watermark(i);
            s.push_with_timestamp((i % 4, i), i);
        }
    })
    .with_output_batch_size(batch_size);

    g.add_source(source)
        .unwrap()
        .chain(
            Map::new(move |t: (u64, u64)| {
                map_threads
                    .lock()
                    .unwrap()
                    .entry(t.0)
                    .or_default()
                    .push(std::thread::current().id());
                t.1
            })
            .with_key_by(|t: &(u64, u64)| t.0)
            .with_parallelism(4)
            .with_output_batch_size(batch_size),
        )
        .unwrap()
        .chain_sink(Sink::new(move |v: Option<u64>| {
            if let Some(v) = v {
                sink_sum.fetch_add(v, Ordering::Relaxed);
                sink_values.lock().unwrap().push(v);
            }
        }))
        .unwrap();
    g.run().unwrap();

    // Collapse per-key thread observations, asserting stability.
    let mut stable = HashMap::new();
    for (key, threads) in key_threads.lock().unwrap().iter() {
        let first = threads[0];
        assert!(
            threads.iter().all(|t| *t == first),
            "key {key} was processed by more than one replica"
        );
        stable.insert(*key, first);
    }

    let mut collected = values.lock().unwrap().clone();
    collected.sort_unstable();
    (sum.load(Ordering::Relaxed), collected, stable)
}

#[test]
fn keyby_stability_and_totals() {
    let (sum, values, key_threads) = run_keyed_pipeline(0);
    assert_eq!(sum, 49_995_000, "sum of [0..10000)");
    assert_eq!(values.len(), 10_000);

    // Keys hashing to the same destination share a replica thread; keys
    // hashing to different destinations do not.
    for a in 0..4u64 {
        for b in 0..4u64 {
            let same_dest = expected_dest(a, 4) == expected_dest(b, 4);
            let same_thread = key_threads[&a] == key_threads[&b];
            assert_eq!(
                same_dest, same_thread,
                "keys {a} and {b}: destination assignment must dictate the replica"
            );
        }
    }
}

#[test]
fn batched_emission_is_equivalent_to_per_tuple() {
    let (sum_unbatched, values_unbatched, _) = run_keyed_pipeline(0);
    let (sum_batched, values_batched, _) = run_keyed_pipeline(100);
    assert_eq!(sum_unbatched, sum_batched);
    assert_eq!(
        values_unbatched, values_batched,
        "batching must not change the delivered multiset"
    );
}

#[test]
fn random_keys_all_arrive_exactly_once() {
    use rand::Rng;

    let expected: Arc<Vec<u64>> = Arc::new({
        let mut rng = rand::thread_rng();
        (0..5_000).map(|_| rng.gen_range(0..64u64)).collect()
    });
    let received = Arc::new(Mutex::new(Vec::new()));

    let source_data = Arc::clone(&expected);
    let sink_received = Arc::clone(&received);

    let mut g = PipeGraph::new("keyby-random", ExecutionMode::Default, TimePolicy::EventTime);
    g.add_source(Source::new(move |s: &mut SourceShipper<u64>| {
        for (i, v) in source_data.iter().enumerate() {
            let ts = i as u64;
            s.set_next_watermark(ts);
            s.push_with_timestamp(*v, ts);
        }
    }))
    .unwrap()
    .chain(
        Map::new(|v: u64| v)
            .with_key_by(|v: &u64| *v)
            .with_parallelism(8),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<u64>| {
        if let Some(v) = v {
            sink_received.lock().unwrap().push(v);
        }
    }))
    .unwrap();
    g.run().unwrap();

    let mut got = received.lock().unwrap().clone();
    let mut want = expected.as_ref().clone();
    got.sort_unstable();
    want.sort_unstable();
    assert_eq!(got, want);
}
