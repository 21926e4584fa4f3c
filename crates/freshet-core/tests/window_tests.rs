//! Windowed aggregation end-to-end: count-based and time-based keyed
//! windows, lateness and ignored tuples, parallel windows, paned windows,
//! and the FFAT aggregator.

use std::sync::{Arc, Mutex};

use freshet_core::operator::{FfatWindows, KeyedWindows, PanedWindows, ParallelWindows, Sink, Source, SourceShipper};
use freshet_core::{ExecutionMode, PipeGraph, TimePolicy};

fn graph(name: &str) -> PipeGraph {
    PipeGraph::new(name, ExecutionMode::Default, TimePolicy::EventTime)
}

#[test]
fn cb_keyed_windows_fire_expected_sums() {
    // key 0, values [1..12], len=4 slide=2: sums 10, 18, 26, 34, 42.
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("cb-windows");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for v in 1..=12u64 {
            s.set_next_watermark(v);
            s.push_with_timestamp(v, v);
        }
    }))
    .unwrap()
    .chain(
        KeyedWindows::new(|_: &u64| 0u64, |v: &u64, acc: &mut u64| *acc += v)
            .with_name("cb-sum")
            .with_cb_windows(4, 2),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_key, sum)) = v {
            sink_fired.lock().unwrap().push(sum);
        }
    }))
    .unwrap();
    g.run().unwrap();

    assert_eq!(*fired.lock().unwrap(), vec![10, 18, 26, 34, 42]);
}

#[test]
fn cb_window_count_law_end_to_end() {
    // N=100, W=10, S=3 for one key: floor((100-10)/3)+1 = 31 windows.
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("cb-count-law");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for v in 0..100u64 {
            s.set_next_watermark(v);
            s.push_with_timestamp(v, v);
        }
    }))
    .unwrap()
    .chain(
        KeyedWindows::new(|_: &u64| 0u64, |_: &u64, acc: &mut u64| *acc += 1)
            .with_cb_windows(10, 3),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_, count)) = v {
            sink_fired.lock().unwrap().push(count);
        }
    }))
    .unwrap();
    g.run().unwrap();

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 31);
    assert!(fired.iter().all(|&c| c == 10), "every fired window holds exactly W tuples");
}

#[test]
fn tb_windows_with_lateness_count_late_tuple_as_ignored() {
    // (ts = i*100µs, value 1) for i in [0..100), tumbling 1000µs windows
    // with 500µs lateness: 10 windows of count 10. A straggler at 350µs
    // injected once the watermark passed 1500µs + lateness is ignored.
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("tb-windows");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for i in 0..30u64 {
            let ts = i * 100;
            s.set_next_watermark(ts);
            s.push_with_timestamp(1, ts);
        }
        // The [0,1000) window has fired by now (watermark 2900 > 1500).
        s.push_with_timestamp(1, 350);
        for i in 30..100u64 {
            let ts = i * 100;
            s.set_next_watermark(ts);
            s.push_with_timestamp(1, ts);
        }
    }))
    .unwrap()
    .chain(
        KeyedWindows::new(|_: &u64| 0u64, |_: &u64, acc: &mut u64| *acc += 1)
            .with_name("tb-count")
            .with_tb_windows(1000, 1000)
            .with_lateness(500),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_, count)) = v {
            sink_fired.lock().unwrap().push(count);
        }
    }))
    .unwrap();
    g.run().unwrap();

    assert_eq!(*fired.lock().unwrap(), vec![10; 10], "ten windows, ten tuples each, in order");

    let stats = g.stats();
    let win_op = stats.iter().find(|op| op.name == "tb-count").unwrap();
    assert_eq!(win_op.ignored_tuples(), 1);
    assert!(win_op.is_windowed);
    assert_eq!(win_op.window_type.as_deref(), Some("time-based"));
    assert_eq!(win_op.lateness, Some(500));
}

#[test]
fn tb_windows_fire_at_most_once() {
    let ends = Arc::new(Mutex::new(Vec::new()));
    let sink_ends = Arc::clone(&ends);

    let mut g = graph("tb-single-firing");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for i in 0..50u64 {
            let ts = i * 100;
            s.set_next_watermark(ts);
            s.push_with_timestamp(ts, ts);
        }
    }))
    .unwrap()
    .chain(
        KeyedWindows::new(|_: &u64| 0u64, |v: &u64, acc: &mut u64| *acc = (*acc).max(*v))
            .with_tb_windows(1000, 1000),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_, max_ts)) = v {
            sink_ends.lock().unwrap().push(max_ts);
        }
    }))
    .unwrap();
    g.run().unwrap();

    let ends = ends.lock().unwrap();
    assert_eq!(ends.len(), 5, "five tumbling windows over [0µs, 5000µs)");
    let mut dedup = ends.clone();
    dedup.dedup();
    assert_eq!(dedup.len(), ends.len(), "no window fires twice");
}

#[test]
fn parallel_windows_cover_the_same_windows() {
    // Same stream as the keyed test, two replicas: window firings are
    // interleaved downstream but the multiset matches.
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("parallel-windows");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for v in 1..=12u64 {
            s.set_next_watermark(v);
            s.push_with_timestamp(v, v);
        }
    }))
    .unwrap()
    .chain(
        ParallelWindows::new(|_: &u64| 0u64, |v: &u64, acc: &mut u64| *acc += v)
            .with_cb_windows(4, 2)
            .with_parallelism(2),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_, sum)) = v {
            sink_fired.lock().unwrap().push(sum);
        }
    }))
    .unwrap();
    g.run().unwrap();

    let mut fired = fired.lock().unwrap().clone();
    fired.sort_unstable();
    assert_eq!(fired, vec![10, 18, 26, 34, 42]);
}

#[test]
fn paned_windows_match_flat_windows() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("paned-windows");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for v in 1..=12u64 {
            s.set_next_watermark(v);
            s.push_with_timestamp(v, v);
        }
    }))
    .unwrap()
    .chain_paned(
        PanedWindows::new(
            |_: &u64| 0u64,
            |v: &u64, acc: &mut u64| *acc += v,
            |part: &u64, acc: &mut u64| *acc += part,
        )
        .with_name("paned-sum")
        .with_cb_windows(4, 2)
        .with_parallelism(2)
        .with_wlq_parallelism(1),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_, sum)) = v {
            sink_fired.lock().unwrap().push(sum);
        }
    }))
    .unwrap();
    g.run().unwrap();

    let mut fired = fired.lock().unwrap().clone();
    fired.sort_unstable();
    assert_eq!(fired, vec![10, 18, 26, 34, 42]);
}

#[test]
fn paned_tb_windows_combine_all_panes() {
    // len 1000µs, slide 500µs (pane 500µs), tuples every 100µs over
    // [0µs, 4000µs): complete sliding windows count 10, the trailing
    // window only its last pane's 5.
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("paned-tb");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for i in 0..40u64 {
            let ts = i * 100;
            s.set_next_watermark(ts);
            s.push_with_timestamp(1, ts);
        }
    }))
    .unwrap()
    .chain_paned(
        PanedWindows::new(
            |_: &u64| 0u64,
            |_: &u64, acc: &mut u64| *acc += 1,
            |part: &u64, acc: &mut u64| *acc += part,
        )
        .with_tb_windows(1000, 500)
        .with_parallelism(2)
        .with_wlq_parallelism(1),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_, count)) = v {
            sink_fired.lock().unwrap().push(count);
        }
    }))
    .unwrap();
    g.run().unwrap();

    let mut fired = fired.lock().unwrap().clone();
    fired.sort_unstable();
    assert_eq!(fired, vec![5, 10, 10, 10, 10, 10, 10, 10]);
}

#[test]
fn ffat_windows_sum_sliding_tb() {
    // len 1000µs, slide 500µs, quantum 500µs; tuples carry value = 1.
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("ffat-windows");
    g.add_source(Source::new(|s: &mut SourceShipper<u64>| {
        for i in 0..40u64 {
            let ts = i * 100;
            s.set_next_watermark(ts);
            s.push_with_timestamp(1, ts);
        }
    }))
    .unwrap()
    .chain(
        FfatWindows::new(|_: &u64| 0u64, |v: &u64| *v, |a: &u64, b: &u64| a + b)
            .with_tb_windows(1000, 500)
            .with_quantum(500),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some((_, sum)) = v {
            sink_fired.lock().unwrap().push(sum);
        }
    }))
    .unwrap();
    g.run().unwrap();

    // Tuples at 100µs spacing over [0µs, 4000µs): full sliding windows
    // hold 10 tuples; the two trailing partial windows hold 5.
    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 8);
    assert!(fired[..7].iter().all(|&c| c == 10));
    assert_eq!(fired[7], 5);
}

#[test]
fn keyed_windows_separate_keys() {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink_fired = Arc::clone(&fired);

    let mut g = graph("keyed-separation");
    g.add_source(Source::new(|s: &mut SourceShipper<(u64, u64)>| {
        // Two keys, interleaved; each key sees [1..=4].
        for v in 1..=4u64 {
            let ts = v * 10;
            s.set_next_watermark(ts);
            s.push_with_timestamp((0, v), ts);
            s.push_with_timestamp((1, v * 100), ts);
        }
    }))
    .unwrap()
    .chain(
        KeyedWindows::new(|t: &(u64, u64)| t.0, |t: &(u64, u64), acc: &mut u64| *acc += t.1)
            .with_cb_windows(2, 2)
            .with_parallelism(2),
    )
    .unwrap()
    .chain_sink(Sink::new(move |v: Option<(u64, u64)>| {
        if let Some(kv) = v {
            sink_fired.lock().unwrap().push(kv);
        }
    }))
    .unwrap();
    g.run().unwrap();

    let mut fired = fired.lock().unwrap().clone();
    fired.sort_unstable();
    assert_eq!(fired, vec![(0, 3), (0, 7), (1, 300), (1, 700)]);
}
