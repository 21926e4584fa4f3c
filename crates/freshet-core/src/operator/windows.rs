//! Windowed aggregation operators.
//!
//! All window operators emit `(key, result)` tuples. The incremental fold
//! `FnMut(&I, &mut O)` is invoked once per (tuple, window) pair, with `O`
//! starting from its `Default`. [`FfatWindows`] instead takes a
//! `lift`/`combine` pair and evaluates sliding windows through a flat
//! aggregator tree.
//!
//! - [`KeyedWindows`]: key-by routed, windows of one key on one replica.
//! - [`ParallelWindows`]: broadcast input, windows of a substream spread
//!   across replicas by window id.
//! - [`PanedWindows`]: two-level pipeline computing pane partials first,
//!   then combining panes into windows.
//!
//! Count-based membership under the default execution mode depends on
//! arrival order when an operator has several upstream replicas; use the
//! deterministic mode for reproducible count-based results.

use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::message::{Data, Single};
use crate::operator::{
    key_router, validate_parallelism, ClosingFn, Collector, ConfigError, InputRouting, OpCommon,
    OpDescriptor, ReplicaContext, StreamOperator, UnaryLogic, WindowDescriptor,
};
use crate::window::ffat::{gcd, FfatManager, PaneSpec};
use crate::window::{CbIndex, FiredWindow, WindowManager, WindowSpec, WinType};

/// Window configuration accumulated by the `with_*` builder calls.
#[derive(Debug, Clone, Default)]
pub(crate) struct WinBuilder {
    win_type: Option<WinType>,
    win_len: u64,
    slide_len: u64,
    lateness: u64,
    quantum: Option<u64>,
}

impl WinBuilder {
    fn cb(&mut self, len: u64, slide: u64) {
        self.win_type = Some(WinType::CountBased);
        self.win_len = len;
        self.slide_len = slide;
    }

    fn tb(&mut self, len_usec: u64, slide_usec: u64) {
        self.win_type = Some(WinType::TimeBased);
        self.win_len = len_usec;
        self.slide_len = slide_usec;
    }

    fn spec(&self, op_name: &str) -> Result<WindowSpec, ConfigError> {
        let Some(win_type) = self.win_type else {
            return Err(ConfigError::MissingWindowSpec(op_name.to_string()));
        };
        let spec = WindowSpec {
            win_type,
            win_len: self.win_len,
            slide_len: self.slide_len,
            lateness: self.lateness,
        };
        spec.validate(op_name)?;
        if let Some(q) = self.quantum {
            if q == 0 || self.win_len % q != 0 || self.slide_len % q != 0 {
                return Err(ConfigError::QuantumNotDivisor {
                    op: op_name.to_string(),
                    quantum: q,
                });
            }
        }
        Ok(spec)
    }

    fn descriptor(&self) -> Option<WindowDescriptor> {
        self.win_type.map(|t| WindowDescriptor {
            win_type: t.label(),
            length: self.win_len,
            slide: self.slide_len,
            lateness: (t == WinType::TimeBased).then_some(self.lateness),
        })
    }
}

/// Watermark attached to a fired result.
///
/// Ordinarily the replica's current input watermark. The end-of-stream
/// watermark (`u64::MAX`) is never attached to results — it travels only
/// on the final punctuation, which FIFO-follows every result, so a
/// downstream pane-combining stage cannot flush before all panes arrive.
fn result_watermark(last_sent: &mut u64, watermark: u64, result_ts: u64) -> u64 {
    let wm = if watermark == u64::MAX {
        (*last_sent).max(result_ts)
    } else {
        watermark
    };
    *last_sent = (*last_sent).max(wm);
    *last_sent
}

/// Replica logic shared by keyed and parallel windows.
struct WindowLogic<I, K, O, FK, F> {
    key: Arc<FK>,
    mgr: WindowManager<K, I, O, F>,
    fired_buf: Vec<FiredWindow<K, O>>,
    last_sent_wm: u64,
    _marker: PhantomData<fn(&I)>,
}

impl<I, K, O, FK, F> UnaryLogic<I, (K, O)> for WindowLogic<I, K, O, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    O: Default + Data,
    FK: Fn(&I) -> K + Send + Sync,
    F: FnMut(&I, &mut O) + Send,
{
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<(K, O)>) {
        let key = (self.key)(&tuple.payload);
        let mut fired: SmallVec<[FiredWindow<K, O>; 2]> = SmallVec::new();
        self.mgr
            .on_tuple(key, &tuple.payload, tuple.identifier, tuple.timestamp, &mut fired);
        for f in fired {
            let wm = result_watermark(&mut self.last_sent_wm, watermark, f.timestamp);
            out.emit((f.key, f.result), f.id, f.timestamp, wm);
        }
    }

    fn on_watermark(&mut self, watermark: u64, out: &mut dyn Collector<(K, O)>) {
        self.fired_buf.clear();
        self.mgr.on_watermark(watermark, &mut self.fired_buf);
        for f in self.fired_buf.drain(..) {
            let wm = result_watermark(&mut self.last_sent_wm, watermark, f.timestamp);
            out.emit((f.key, f.result), f.id, f.timestamp, wm);
        }
    }

    fn ignored(&self) -> u64 {
        self.mgr.ignored()
    }
}

macro_rules! window_builder_options {
    () => {
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

        /// Count-based windows: length and slide in number of tuples.
        #[must_use]
        pub fn with_cb_windows(mut self, win_len: u64, slide_len: u64) -> Self {
            self.win.cb(win_len, slide_len);
            self
        }

        /// Time-based windows: length and slide in microseconds.
        #[must_use]
        pub fn with_tb_windows(mut self, win_len_usec: u64, slide_len_usec: u64) -> Self {
            self.win.tb(win_len_usec, slide_len_usec);
            self
        }

        /// Firing delay in microseconds; rejected for count-based windows.
        #[must_use]
        pub fn with_lateness(mut self, lateness_usec: u64) -> Self {
            self.win.lateness = lateness_usec;
            self
        }

        /// Enables batched emission (0 = per-tuple).
        #[must_use]
        pub fn with_output_batch_size(mut self, size: usize) -> Self {
            self.common.output_batch_size = size;
            self
        }

        /// Installs a per-replica teardown callback.
        #[must_use]
        pub fn with_closing(
            mut self,
            f: impl Fn(&ReplicaContext) + Send + Sync + 'static,
        ) -> Self {
            self.common.closing = Some(Arc::new(f));
            self
        }
    };
}

/// Keyed windows: the input is hash-partitioned by key, so every window of
/// a key lives on one replica.
pub struct KeyedWindows<I, K, O, FK, F> {
    key: Arc<FK>,
    fold: F,
    common: OpCommon,
    win: WinBuilder,
    _marker: PhantomData<fn(&I, K) -> O>,
}

impl<I, K, O, FK, F> KeyedWindows<I, K, O, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    O: Default + Data,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(&I, &mut O) + Clone + Send + 'static,
{
    /// Creates keyed windows from a key extractor and an incremental fold.
    pub fn new(key: FK, fold: F) -> Self {
        Self {
            key: Arc::new(key),
            fold,
            common: OpCommon::new("keyed-windows"),
            win: WinBuilder::default(),
            _marker: PhantomData,
        }
    }

    window_builder_options!();
}

impl<I, K, O, FK, F> StreamOperator<I> for KeyedWindows<I, K, O, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    O: Default + Data,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(&I, &mut O) + Clone + Send + 'static,
{
    type Out = (K, O);

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Keyed_Windows",
            parallelism: self.common.parallelism,
            output_batch_size: self.common.output_batch_size,
            windowed: self.win.descriptor(),
        }
    }

    fn input_routing(&self) -> InputRouting<I> {
        InputRouting::KeyBy(key_router(Arc::clone(&self.key)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)?;
        self.win.spec(&self.common.name).map(|_| ())
    }

    fn build_replica(&self, _ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, (K, O)>> {
        let spec = self.win.spec(&self.common.name).expect("validated at chain time");
        Box::new(WindowLogic {
            key: Arc::clone(&self.key),
            mgr: WindowManager::new(spec, self.fold.clone(), CbIndex::ByCount, 0, 1),
            fired_buf: Vec::new(),
            last_sent_wm: 0,
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}

/// Parallel windows: inputs arrive by broadcast and replica `i` of `P`
/// owns the windows whose id is congruent to `i` modulo `P`, so distinct
/// windows of one keyed substream run in parallel.
pub struct ParallelWindows<I, K, O, FK, F> {
    key: Arc<FK>,
    fold: F,
    common: OpCommon,
    win: WinBuilder,
    /// Pane-combining levels index count-based windows by envelope
    /// identifier and flush open windows at end-of-stream.
    pub(crate) cb_index: CbIndex,
    pub(crate) eos_flush: bool,
    _marker: PhantomData<fn(&I, K) -> O>,
}

impl<I, K, O, FK, F> ParallelWindows<I, K, O, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    O: Default + Data,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(&I, &mut O) + Clone + Send + 'static,
{
    /// Creates parallel windows from a key extractor and an incremental
    /// fold.
    pub fn new(key: FK, fold: F) -> Self {
        Self {
            key: Arc::new(key),
            fold,
            common: OpCommon::new("parallel-windows"),
            win: WinBuilder::default(),
            cb_index: CbIndex::ByCount,
            eos_flush: false,
            _marker: PhantomData,
        }
    }

    window_builder_options!();
}

impl<I, K, O, FK, F> StreamOperator<I> for ParallelWindows<I, K, O, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    O: Default + Data,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(&I, &mut O) + Clone + Send + 'static,
{
    type Out = (K, O);

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Parallel_Windows",
            parallelism: self.common.parallelism,
            output_batch_size: self.common.output_batch_size,
            windowed: self.win.descriptor(),
        }
    }

    fn input_routing(&self) -> InputRouting<I> {
        InputRouting::Broadcast
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)?;
        self.win.spec(&self.common.name).map(|_| ())
    }

    fn build_replica(&self, ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, (K, O)>> {
        let spec = self.win.spec(&self.common.name).expect("validated at chain time");
        let mut mgr = WindowManager::new(
            spec,
            self.fold.clone(),
            self.cb_index,
            ctx.replica_index,
            ctx.parallelism,
        );
        if self.eos_flush {
            mgr = mgr.with_eos_flush();
        }
        Box::new(WindowLogic {
            key: Arc::clone(&self.key),
            mgr,
            fired_buf: Vec::new(),
            last_sent_wm: 0,
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}

/// Paned windows: a two-level pipeline. The pane level (PLQ) computes
/// partial results on tumbling panes of width `gcd(len, slide)`; the
/// window level (WLQ) combines panes into full windows. Both levels are
/// parallel windows internally.
pub struct PanedWindows<I, K, O, FK, F1, F2> {
    key: Arc<FK>,
    plq_fold: F1,
    wlq_combine: F2,
    common: OpCommon,
    wlq_parallelism: usize,
    win: WinBuilder,
    _marker: PhantomData<fn(&I, K) -> O>,
}

impl<I, K, O, FK, F1, F2> PanedWindows<I, K, O, FK, F1, F2>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    O: Default + Data,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F1: FnMut(&I, &mut O) + Clone + Send + 'static,
    F2: FnMut(&O, &mut O) + Clone + Send + 'static,
{
    /// Creates paned windows from a key extractor, the pane-level fold,
    /// and the window-level combiner.
    pub fn new(key: FK, plq_fold: F1, wlq_combine: F2) -> Self {
        Self {
            key: Arc::new(key),
            plq_fold,
            wlq_combine,
            common: OpCommon::new("paned-windows"),
            wlq_parallelism: 1,
            win: WinBuilder::default(),
            _marker: PhantomData,
        }
    }

    /// Sets the parallelism of the window-combining level (the pane level
    /// uses `with_parallelism`).
    #[must_use]
    pub fn with_wlq_parallelism(mut self, parallelism: usize) -> Self {
        self.wlq_parallelism = parallelism;
        self
    }

    window_builder_options!();

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)?;
        if self.wlq_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism(format!("{}-wlq", self.common.name)));
        }
        self.win.spec(&self.common.name).map(|_| ())
    }

    /// Splits into the two pipeline stages wired by `chain_paned`.
    #[allow(clippy::type_complexity)]
    pub(crate) fn into_stages(
        self,
    ) -> Result<
        (
            ParallelWindows<I, K, O, FK, F1>,
            ParallelWindows<(K, O), K, O, impl Fn(&(K, O)) -> K + Send + Sync + 'static, impl FnMut(&(K, O), &mut O) + Clone + Send + 'static>,
        ),
        ConfigError,
    > {
        self.validate()?;
        let spec = self.win.spec(&self.common.name)?;
        let pane = gcd(spec.win_len, spec.slide_len);
        let panes_per_window = spec.win_len / pane;
        let panes_per_slide = spec.slide_len / pane;

        let mut plq_win = WinBuilder::default();
        match spec.win_type {
            WinType::CountBased => plq_win.cb(pane, pane),
            WinType::TimeBased => {
                plq_win.tb(pane, pane);
                plq_win.lateness = spec.lateness;
            }
        }
        let plq = ParallelWindows {
            key: Arc::clone(&self.key),
            fold: self.plq_fold,
            common: OpCommon {
                name: format!("{}-plq", self.common.name),
                parallelism: self.common.parallelism,
                output_batch_size: 0,
                closing: self.common.closing.clone(),
            },
            win: plq_win,
            cb_index: CbIndex::ByCount,
            eos_flush: false,
            _marker: PhantomData,
        };

        let mut wlq_win = WinBuilder::default();
        wlq_win.cb(panes_per_window, panes_per_slide);
        let mut wlq_combine = self.wlq_combine;
        let wlq = ParallelWindows {
            key: Arc::new(move |t: &(K, O)| t.0.clone()),
            fold: move |pane: &(K, O), acc: &mut O| wlq_combine(&pane.1, acc),
            common: OpCommon {
                name: format!("{}-wlq", self.common.name),
                parallelism: self.wlq_parallelism,
                output_batch_size: self.common.output_batch_size,
                closing: self.common.closing,
            },
            win: wlq_win,
            cb_index: CbIndex::ById,
            eos_flush: spec.win_type == WinType::TimeBased,
            _marker: PhantomData,
        };
        Ok((plq, wlq))
    }
}

/// Replica logic of the FFAT aggregator.
struct FfatLogic<I, K, A, FK, L, C> {
    key: Arc<FK>,
    mgr: FfatManager<K, I, A, L, C>,
    fired_buf: Vec<FiredWindow<K, A>>,
    last_sent_wm: u64,
    _marker: PhantomData<fn(&I)>,
}

impl<I, K, A, FK, L, C> UnaryLogic<I, (K, A)> for FfatLogic<I, K, A, FK, L, C>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    A: Data,
    FK: Fn(&I) -> K + Send + Sync,
    L: FnMut(&I) -> A + Send,
    C: Fn(&A, &A) -> A + Clone + Send,
{
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<(K, A)>) {
        let key = (self.key)(&tuple.payload);
        let mut fired: SmallVec<[FiredWindow<K, A>; 2]> = SmallVec::new();
        self.mgr.on_tuple(key, &tuple.payload, tuple.timestamp, &mut fired);
        for f in fired {
            let wm = result_watermark(&mut self.last_sent_wm, watermark, f.timestamp);
            out.emit((f.key, f.result), f.id, f.timestamp, wm);
        }
    }

    fn on_watermark(&mut self, watermark: u64, out: &mut dyn Collector<(K, A)>) {
        self.fired_buf.clear();
        self.mgr.on_watermark(watermark, &mut self.fired_buf);
        for f in self.fired_buf.drain(..) {
            let wm = result_watermark(&mut self.last_sent_wm, watermark, f.timestamp);
            out.emit((f.key, f.result), f.id, f.timestamp, wm);
        }
    }

    fn ignored(&self) -> u64 {
        self.mgr.ignored()
    }
}

/// Keyed windows evaluated through a flat fixed-size aggregator tree.
///
/// Takes a `lift` mapping a tuple to a pane aggregate and an associative
/// `combine` merging two aggregates; sliding windows are range-combines
/// over pane aggregates. For time-based windows, `with_quantum` aligns
/// panes on a fixed width that must divide both length and slide.
pub struct FfatWindows<I, K, A, FK, L, C> {
    key: Arc<FK>,
    lift: L,
    combine: C,
    common: OpCommon,
    win: WinBuilder,
    _marker: PhantomData<fn(&I, K) -> A>,
}

impl<I, K, A, FK, L, C> FfatWindows<I, K, A, FK, L, C>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    A: Data,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    L: FnMut(&I) -> A + Clone + Send + 'static,
    C: Fn(&A, &A) -> A + Clone + Send + Sync + 'static,
{
    /// Creates an FFAT aggregator from a key extractor, `lift`, and
    /// `combine`.
    pub fn new(key: FK, lift: L, combine: C) -> Self {
        Self {
            key: Arc::new(key),
            lift,
            combine,
            common: OpCommon::new("ffat-windows"),
            win: WinBuilder::default(),
            _marker: PhantomData,
        }
    }

    /// Aligns time-based panes on `quantum` microseconds; must divide
    /// window length and slide.
    #[must_use]
    pub fn with_quantum(mut self, quantum_usec: u64) -> Self {
        self.win.quantum = Some(quantum_usec);
        self
    }

    window_builder_options!();
}

impl<I, K, A, FK, L, C> StreamOperator<I> for FfatWindows<I, K, A, FK, L, C>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    A: Data,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    L: FnMut(&I) -> A + Clone + Send + 'static,
    C: Fn(&A, &A) -> A + Clone + Send + Sync + 'static,
{
    type Out = (K, A);

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Ffat_Windows",
            parallelism: self.common.parallelism,
            output_batch_size: self.common.output_batch_size,
            windowed: self.win.descriptor(),
        }
    }

    fn input_routing(&self) -> InputRouting<I> {
        InputRouting::KeyBy(key_router(Arc::clone(&self.key)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)?;
        self.win.spec(&self.common.name).map(|_| ())
    }

    fn build_replica(&self, _ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, (K, A)>> {
        let spec = self.win.spec(&self.common.name).expect("validated at chain time");
        let panes = PaneSpec::derive(&spec, self.win.quantum);
        Box::new(FfatLogic {
            key: Arc::clone(&self.key),
            mgr: FfatManager::new(spec, panes, self.lift.clone(), self.combine.clone()),
            fired_buf: Vec::new(),
            last_sent_wm: 0,
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}
