//! Per-replica statistics, aggregated per operator after `run()` returns.
//!
//! Counters are owned and written exclusively by their replica thread and
//! collected by the main thread at join time, so there is no shared mutable
//! state on the hot path. `dump_stats` serialises one newline-terminated
//! JSON object per operator into `${WF_LOG_DIR}/<pid>_<op_name>.json`
//! (falling back to `./log`).

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Counters owned by one replica.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicaStats {
    /// Index of the replica within its operator.
    #[serde(rename = "Replica_id")]
    pub replica_index: usize,
    /// Envelopes received (tuples and batch slots; punctuations excluded).
    #[serde(rename = "inputs_received")]
    pub inputs_received: u64,
    /// Tuples handed to the emitter.
    #[serde(rename = "outputs_sent")]
    pub outputs_sent: u64,
    /// Payload bytes received.
    #[serde(rename = "bytes_received")]
    pub bytes_received: u64,
    /// Payload bytes sent.
    #[serde(rename = "bytes_sent")]
    pub bytes_sent: u64,
    /// Tuples whose windows had all fired on arrival.
    #[serde(rename = "ignored_tuples")]
    pub ignored_tuples: u64,
    /// Service time over user-logic invocations, nanoseconds.
    #[serde(rename = "service_time_ns")]
    pub service_time: ServiceTime,
}

/// Min/max/average service time aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceTime {
    /// Fastest observed invocation.
    pub min: u64,
    /// Slowest observed invocation.
    pub max: u64,
    /// Mean over all invocations.
    pub avg: u64,
    /// Number of samples.
    pub samples: u64,
    #[serde(skip)]
    total: u128,
}

impl Default for ServiceTime {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            avg: 0,
            samples: 0,
            total: 0,
        }
    }
}

impl ServiceTime {
    /// Records one invocation duration in nanoseconds.
    pub(crate) fn record(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.samples += 1;
        self.total += u128::from(nanos);
        self.avg = u64::try_from(self.total / u128::from(self.samples)).unwrap_or(u64::MAX);
    }
}

impl ReplicaStats {
    pub(crate) fn new(replica_index: usize) -> Self {
        Self {
            replica_index,
            ..Self::default()
        }
    }
}

/// One operator's metadata plus the stats of all its replicas.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorStats {
    /// Diagnostic name.
    #[serde(rename = "Operator_name")]
    pub name: String,
    /// Operator kind label.
    #[serde(rename = "Operator_type")]
    pub op_type: String,
    /// Input routing mode of the operator.
    #[serde(rename = "Distribution")]
    pub distribution: String,
    /// Whether every replica has terminated.
    #[serde(rename = "isTerminated")]
    pub is_terminated: bool,
    /// Whether the operator manages windows.
    #[serde(rename = "isWindowed")]
    pub is_windowed: bool,
    /// `count-based` / `time-based` for windowed operators.
    #[serde(rename = "Window_type", skip_serializing_if = "Option::is_none")]
    pub window_type: Option<String>,
    /// Window length in the window's index unit.
    #[serde(rename = "Window_length", skip_serializing_if = "Option::is_none")]
    pub window_length: Option<u64>,
    /// Slide length in the window's index unit.
    #[serde(rename = "Window_slide", skip_serializing_if = "Option::is_none")]
    pub window_slide: Option<u64>,
    /// Firing delay in microseconds (time-based only).
    #[serde(rename = "Lateness", skip_serializing_if = "Option::is_none")]
    pub lateness: Option<u64>,
    /// Number of replicas.
    #[serde(rename = "Parallelism")]
    pub parallelism: usize,
    /// Output batch size (0 = per-tuple emission).
    #[serde(rename = "OutputBatchSize")]
    pub output_batch_size: usize,
    /// Per-replica counters.
    #[serde(rename = "Replicas")]
    pub replicas: Vec<ReplicaStats>,
}

impl OperatorStats {
    /// Total tuples ignored across replicas (windowed operators).
    #[must_use]
    pub fn ignored_tuples(&self) -> u64 {
        self.replicas.iter().map(|r| r.ignored_tuples).sum()
    }

    /// Total inputs received across replicas.
    #[must_use]
    pub fn inputs_received(&self) -> u64 {
        self.replicas.iter().map(|r| r.inputs_received).sum()
    }

    /// Total outputs sent across replicas.
    #[must_use]
    pub fn outputs_sent(&self) -> u64 {
        self.replicas.iter().map(|r| r.outputs_sent).sum()
    }
}

/// Writes one JSON file per operator under `dir`.
pub(crate) fn dump_to(dir: &Path, ops: &[OperatorStats]) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let pid = std::process::id();
    let mut written = Vec::with_capacity(ops.len());
    for op in ops {
        let path = dir.join(format!("{pid}_{}.json", op.name));
        let mut file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(&mut file, op)?;
        file.write_all(b"\n")?;
        written.push(path);
    }
    Ok(written)
}

/// Resolves the log directory: `$WF_LOG_DIR`, else `./log`.
pub(crate) fn log_dir() -> PathBuf {
    std::env::var_os("WF_LOG_DIR").map_or_else(|| PathBuf::from("log"), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_time_aggregates() {
        let mut st = ServiceTime::default();
        st.record(100);
        st.record(300);
        assert_eq!(st.min, 100);
        assert_eq!(st.max, 300);
        assert_eq!(st.avg, 200);
        assert_eq!(st.samples, 2);
    }

    #[test]
    fn json_uses_original_field_names() {
        let op = OperatorStats {
            name: "map".into(),
            op_type: "Map".into(),
            distribution: "FORWARD".into(),
            is_terminated: true,
            is_windowed: false,
            window_type: None,
            window_length: None,
            window_slide: None,
            lateness: None,
            parallelism: 2,
            output_batch_size: 0,
            replicas: vec![ReplicaStats::new(0), ReplicaStats::new(1)],
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"Operator_name\":\"map\""));
        assert!(json.contains("\"Distribution\":\"FORWARD\""));
        assert!(json.contains("\"Parallelism\":2"));
        assert!(json.contains("\"Replicas\""));
        assert!(!json.contains("Window_type"), "absent for non-windowed ops");
    }

    #[test]
    fn dump_writes_one_file_per_operator() {
        let dir = tempfile::tempdir().unwrap();
        let op = OperatorStats {
            name: "sink".into(),
            op_type: "Sink".into(),
            distribution: "FORWARD".into(),
            is_terminated: true,
            is_windowed: false,
            window_type: None,
            window_length: None,
            window_slide: None,
            lateness: None,
            parallelism: 1,
            output_batch_size: 0,
            replicas: vec![ReplicaStats::new(0)],
        };
        let written = dump_to(dir.path(), std::slice::from_ref(&op)).unwrap();
        assert_eq!(written.len(), 1);
        let body = std::fs::read_to_string(&written[0]).unwrap();
        assert!(body.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["Operator_name"], "sink");
    }
}
