//! # Freshet Core
//!
//! A library runtime for building and executing parallel streaming
//! dataflow graphs on shared-memory machines.
//!
//! A [`PipeGraph`] describes a DAG of operators — sources, maps, filters,
//! flat maps, windowed aggregations, sinks. The runtime materialises each
//! operator as a set of worker replicas (one OS thread each), routes
//! tuples between replicas over lock-free SPSC rings, and drives the
//! computation until every source ends and every stage drains.
//!
//! ## Building blocks
//!
//! - **Emitters**: per-stage output distribution under four routing modes
//!   (forward, broadcast, key-by, reshuffle), with optional batching and
//!   envelope recycling.
//! - **Windows**: event-time count-based and time-based sliding windows —
//!   keyed, parallel, paned, and FFAT-aggregator variants, fired by
//!   watermarks.
//! - **Watermarks**: per-replica minimum tracking across input channels,
//!   with punctuations keeping quiet channels live.
//! - **Execution modes**: best-effort ([`ExecutionMode::Default`]),
//!   reproducible ([`ExecutionMode::Deterministic`]), and bounded-skew
//!   ([`ExecutionMode::Probabilistic`]) input merging.
//!
//! ## Example
//!
//! ```rust
//! use freshet_core::operator::{Map, Sink, Source};
//! use freshet_core::{ExecutionMode, PipeGraph, TimePolicy};
//! use std::sync::{Arc, Mutex};
//!
//! let sum = Arc::new(Mutex::new(0u64));
//! let sink_sum = Arc::clone(&sum);
//!
//! let mut graph = PipeGraph::new("example", ExecutionMode::Default, TimePolicy::EventTime);
//! let source = Source::new(|shipper| {
//!     for v in 1..=100u64 {
//!         shipper.push_with_timestamp(v, v);
//!     }
//! });
//! graph
//!     .add_source(source)
//!     .and_then(|pipe| pipe.chain(Map::new(|v: u64| v * 2)))
//!     .and_then(|pipe| {
//!         pipe.chain_sink(Sink::new(move |v: Option<u64>| {
//!             if let Some(v) = v {
//!                 *sink_sum.lock().unwrap() += v;
//!             }
//!         }))
//!     })
//!     .unwrap();
//! graph.run().unwrap();
//! assert_eq!(*sum.lock().unwrap(), 10100);
//! ```
//!
//! ## Concurrency model
//!
//! One OS thread per replica; emitters run inline in the producing
//! replica's thread. Backpressure is implicit through the bounded rings: a
//! full downstream queue blocks the producer, cascading back to the
//! sources. Termination is cooperative — a finished source propagates an
//! end-of-stream punctuation and closes its channels, and every
//! downstream replica drains and exits.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the SPSC ring.
#![allow(unsafe_code)]

mod channel;
pub mod config;
mod emitter;
mod gate;
pub mod graph;
pub mod message;
pub mod operator;
mod pool;
pub mod stats;
mod watermark;
pub mod window;
mod worker;

pub use config::{ExecutionMode, TimePolicy};
pub use graph::{GraphError, MultiPipe, PipeGraph, SplitPipes};
pub use message::Data;
pub use operator::ConfigError;
pub use stats::{OperatorStats, ReplicaStats};
pub use window::WinType;

/// Result type for freshet-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator configuration errors.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Graph assembly and execution errors.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
}
