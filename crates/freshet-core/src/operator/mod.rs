//! Streaming operators and their builders.
//!
//! Every operator is a plain value configured with chained `with_*` calls
//! and handed to the graph (`add_source`, `chain`, `chain_sink`). The
//! graph materialises it into replicas at wiring time; configuration
//! errors surface there as [`ConfigError`]s.
//!
//! ```rust,ignore
//! use freshet_core::operator::{Map, Sink, Source};
//!
//! let src = Source::new(|shipper| {
//!     for v in 1..=1000u64 {
//!         shipper.push_with_timestamp(v, v);
//!     }
//! })
//! .with_name("numbers");
//!
//! let map = Map::new(|v: u64| v + 1).with_parallelism(4);
//! ```

pub mod filter;
pub mod flat_map;
pub mod map;
pub mod sink;
pub mod source;
pub mod windows;

pub use filter::{Filter, KeyedFilter};
pub use flat_map::{FlatMap, Shipper};
pub use map::{KeyedMap, Map};
pub use sink::Sink;
pub use source::{Source, SourceShipper};
pub use windows::{FfatWindows, KeyedWindows, PanedWindows, ParallelWindows};

use std::sync::Arc;

use crate::message::{Data, Single};

/// Errors detected while materialising an operator into the graph.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `with_parallelism(0)`.
    #[error("operator '{0}' has parallelism zero")]
    ZeroParallelism(String),

    /// `with_cb_windows`/`with_tb_windows` with a zero length.
    #[error("operator '{0}' has window length zero")]
    ZeroWindowLength(String),

    /// `with_cb_windows`/`with_tb_windows` with a zero slide.
    #[error("operator '{0}' has slide length zero")]
    ZeroSlideLength(String),

    /// `with_lateness` on a count-based window.
    #[error("operator '{0}' sets lateness on count-based windows")]
    LatenessOnCountBased(String),

    /// A window operator chained without window semantics.
    #[error("operator '{0}' is windowed but has no window configuration")]
    MissingWindowSpec(String),

    /// A time-based quantum that does not divide length and slide.
    #[error("operator '{op}': quantum {quantum} does not divide window length and slide")]
    QuantumNotDivisor {
        /// Operator name.
        op: String,
        /// Offending quantum.
        quantum: u64,
    },
}

/// Identity of one replica, passed to closing callbacks and visible to
/// source logic through the shipper.
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    /// Operator name.
    pub name: String,
    /// Index of this replica within the operator.
    pub replica_index: usize,
    /// Total replicas of the operator.
    pub parallelism: usize,
}

/// Per-replica teardown callback installed with `with_closing`.
pub(crate) type ClosingFn = Arc<dyn Fn(&ReplicaContext) + Send + Sync>;

/// Configuration shared by every operator kind.
#[derive(Clone)]
pub(crate) struct OpCommon {
    pub name: String,
    pub parallelism: usize,
    pub output_batch_size: usize,
    pub closing: Option<ClosingFn>,
}

impl OpCommon {
    pub(crate) fn new(default_name: &str) -> Self {
        Self {
            name: default_name.to_string(),
            parallelism: 1,
            output_batch_size: 0,
            closing: None,
        }
    }
}

/// Window metadata reported through the statistics snapshot.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct WindowDescriptor {
    pub win_type: &'static str,
    pub length: u64,
    pub slide: u64,
    pub lateness: Option<u64>,
}

/// Static description of an operator, consumed by the graph assembler.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct OpDescriptor {
    pub name: String,
    pub op_type: &'static str,
    pub parallelism: usize,
    pub output_batch_size: usize,
    pub windowed: Option<WindowDescriptor>,
}

/// How an operator wants its input routed.
#[doc(hidden)]
pub enum InputRouting<I> {
    /// Forward when shapes allow, reshuffle otherwise.
    Auto,
    /// Hash-partition by key.
    KeyBy(Arc<dyn Fn(&I) -> u64 + Send + Sync>),
    /// Every input replica's output to every replica.
    Broadcast,
}

/// Output collector handed to operator logic by the worker loop.
#[doc(hidden)]
pub trait Collector<T> {
    /// Emits one tuple downstream.
    fn emit(&mut self, payload: T, identifier: u64, timestamp: u64, watermark: u64);
}

/// Per-replica logic of a non-source, non-sink operator.
#[doc(hidden)]
pub trait UnaryLogic<I, O>: Send {
    /// Handles one tuple. `watermark` is the replica's current minimum
    /// input watermark, taken after this tuple's envelope was applied.
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<O>);

    /// Reacts to an advanced input watermark (window firing).
    fn on_watermark(&mut self, watermark: u64, out: &mut dyn Collector<O>) {
        let _ = (watermark, out);
    }

    /// Tuples dropped because all their windows had fired.
    fn ignored(&self) -> u64 {
        0
    }
}

/// Per-replica logic of a sink.
#[doc(hidden)]
pub trait SinkLogic<I>: Send {
    /// Handles one tuple.
    fn on_tuple(&mut self, payload: I);

    /// Called once at end-of-stream, so the logic can finalise.
    fn on_eos(&mut self);
}

/// A non-source, non-sink operator that the graph can materialise.
///
/// Implemented by [`Map`], [`Filter`], [`FlatMap`], their keyed-stateful
/// variants, and the window operators. The methods are wiring machinery
/// invoked by `MultiPipe::chain`.
pub trait StreamOperator<I: Data> {
    /// Output tuple type.
    type Out: Data;

    #[doc(hidden)]
    fn descriptor(&self) -> OpDescriptor;

    #[doc(hidden)]
    fn input_routing(&self) -> InputRouting<I>;

    #[doc(hidden)]
    fn validate(&self) -> Result<(), ConfigError>;

    #[doc(hidden)]
    fn build_replica(&self, ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, Self::Out>>;

    #[doc(hidden)]
    fn closing(&self) -> Option<ClosingFn>;
}

/// A terminal operator that the graph can materialise.
pub trait SinkOperator<I: Data> {
    #[doc(hidden)]
    fn descriptor(&self) -> OpDescriptor;

    #[doc(hidden)]
    fn input_routing(&self) -> InputRouting<I>;

    #[doc(hidden)]
    fn validate(&self) -> Result<(), ConfigError>;

    #[doc(hidden)]
    fn build_replica(&self, ctx: &ReplicaContext) -> Box<dyn SinkLogic<I>>;

    #[doc(hidden)]
    fn closing(&self) -> Option<ClosingFn>;
}

pub(crate) fn validate_parallelism(common: &OpCommon) -> Result<(), ConfigError> {
    if common.parallelism == 0 {
        return Err(ConfigError::ZeroParallelism(common.name.clone()));
    }
    Ok(())
}

/// Hashes with the router's key hasher; used by the `KeyBy` routing
/// closures so key-to-replica assignment is stable for a topology.
pub(crate) fn key_router<I, K, FK>(extractor: Arc<FK>) -> Arc<dyn Fn(&I) -> u64 + Send + Sync>
where
    FK: Fn(&I) -> K + Send + Sync + 'static,
    K: std::hash::Hash,
{
    Arc::new(move |payload: &I| crate::emitter::hash_key(&extractor(payload)))
}
