//! Runtime configuration: execution modes, time policies, and the
//! punctuation-cadence knobs read from the environment.

use std::time::Duration;

/// Default capacity (in messages) of the SPSC ring installed on every edge.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 2048;

/// Default capacity of the per-emitter batch-shell recycling queue.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default number of inputs between punctuation-generation checks.
pub const DEFAULT_WM_AMOUNT: u64 = 1024;

/// Default minimum wall-clock distance between punctuation samples.
pub const DEFAULT_WM_INTERVAL_USEC: u64 = 100_000;

/// How input channels are merged and watermarks disciplined at every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Best-effort, throughput-oriented: inputs consumed FIFO per channel,
    /// round-robin across channels, no cross-channel ordering.
    Default,
    /// Each replica merges its inputs in non-decreasing
    /// `(timestamp, channel index)` order, blocking on channels whose
    /// watermark has not passed the smallest candidate. Reproducible
    /// across runs for the same input.
    Deterministic,
    /// Like [`Deterministic`](Self::Deterministic), but a channel counts as
    /// "past" once its watermark is within `slack_usec` of the candidate,
    /// trading occasional out-of-order deliveries for latency.
    Probabilistic {
        /// Allowed ordering slack in microseconds.
        slack_usec: u64,
    },
}

impl ExecutionMode {
    /// Returns true for the two ordered modes.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        !matches!(self, Self::Default)
    }

    /// Ordering slack in microseconds (zero outside probabilistic mode).
    #[must_use]
    pub fn slack_usec(&self) -> u64 {
        match self {
            Self::Probabilistic { slack_usec } => *slack_usec,
            _ => 0,
        }
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Default
    }
}

/// Where tuple timestamps come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimePolicy {
    /// The runtime stamps each tuple with the wall-clock time (µs) at which
    /// the source shipped it; watermarks track the stamps.
    #[default]
    IngressTime,
    /// Timestamps are supplied by the source logic; watermarks advance only
    /// through `set_next_watermark`.
    EventTime,
}

/// Punctuation-generation cadence used by multi-destination emitters.
///
/// Read once per emitter at construction; the environment overrides the
/// compiled defaults.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkCadence {
    /// Number of received inputs between generation checks.
    pub amount: u64,
    /// Minimum wall-clock distance between samples.
    pub interval: Duration,
}

impl WatermarkCadence {
    /// Reads `WF_DEFAULT_WM_AMOUNT` and `WF_DEFAULT_WM_INTERVAL_USEC`,
    /// falling back to the compiled defaults on absence or parse failure.
    #[must_use]
    pub fn from_env() -> Self {
        let amount = env_u64("WF_DEFAULT_WM_AMOUNT").unwrap_or(DEFAULT_WM_AMOUNT).max(1);
        let interval_usec =
            env_u64("WF_DEFAULT_WM_INTERVAL_USEC").unwrap_or(DEFAULT_WM_INTERVAL_USEC);
        Self {
            amount,
            interval: Duration::from_micros(interval_usec),
        }
    }
}

impl Default for WatermarkCadence {
    fn default() -> Self {
        Self {
            amount: DEFAULT_WM_AMOUNT,
            interval: Duration::from_micros(DEFAULT_WM_INTERVAL_USEC),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Wall-clock microseconds since the Unix epoch, used for ingress-time
/// stamping and punctuation cadence sampling.
#[must_use]
pub(crate) fn current_time_usecs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}
