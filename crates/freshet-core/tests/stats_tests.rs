//! Statistics snapshot and JSON dump.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use freshet_core::operator::{Map, Sink, Source, SourceShipper};
use freshet_core::{ExecutionMode, PipeGraph, TimePolicy};

fn run_small_graph() -> PipeGraph {
    let sum = Arc::new(AtomicU64::new(0));
    let sink_sum = Arc::clone(&sum);

    let mut g = PipeGraph::new("stats-graph", ExecutionMode::Default, TimePolicy::EventTime);
    g.add_source(
        Source::new(|s: &mut SourceShipper<u64>| {
            for v in 0..1000u64 {
                s.set_next_watermark(v);
                s.push_with_timestamp(v, v);
            }
        })
        .with_name("gen"),
    )
    .unwrap()
    .chain(Map::new(|v: u64| v * 2).with_name("double").with_parallelism(2))
    .unwrap()
    .chain_sink(
        Sink::new(move |v: Option<u64>| {
            if let Some(v) = v {
                sink_sum.fetch_add(v, Ordering::Relaxed);
            }
        })
        .with_name("collect"),
    )
    .unwrap();
    g.run().unwrap();
    g
}

#[test]
fn snapshot_reflects_the_run() {
    let g = run_small_graph();
    let stats = g.stats();
    assert_eq!(stats.len(), 3);

    let source = stats.iter().find(|o| o.name == "gen").unwrap();
    assert_eq!(source.op_type, "Source");
    assert_eq!(source.parallelism, 1);
    assert!(source.is_terminated);
    assert_eq!(source.outputs_sent(), 1000);

    let map = stats.iter().find(|o| o.name == "double").unwrap();
    assert_eq!(map.parallelism, 2);
    assert_eq!(map.replicas.len(), 2);
    assert_eq!(map.inputs_received(), 1000);
    assert_eq!(map.outputs_sent(), 1000);
    // Source parallelism 1 into map parallelism 2 without key-by:
    // round-robin distribution.
    assert_eq!(map.distribution, "RESHUFFLE");

    let sink = stats.iter().find(|o| o.name == "collect").unwrap();
    assert_eq!(sink.inputs_received(), 1000);
    assert!(sink.replicas[0].bytes_received > 0);
    assert!(sink.replicas[0].service_time.samples > 0);
}

#[test]
fn dump_writes_parsable_json_per_operator() {
    let g = run_small_graph();
    let dir = tempfile::tempdir().unwrap();
    let written = g.dump_stats_to(dir.path()).unwrap();
    assert_eq!(written.len(), 3);

    let pid = std::process::id().to_string();
    for path in &written {
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with(&pid), "files are named <pid>_<op>.json");
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(value["Operator_name"].is_string());
        assert!(value["Replicas"].is_array());
        assert_eq!(value["isTerminated"], serde_json::Value::Bool(true));
    }
}
