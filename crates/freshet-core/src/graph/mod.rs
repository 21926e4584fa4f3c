//! Graph assembly: `PipeGraph` and the `MultiPipe` DSL.
//!
//! A [`PipeGraph`] owns a set of source-rooted [`MultiPipe`]s. Operators
//! are appended with `chain`, fanned out with `split`/`select`, folded
//! back with `merge`, and terminated with `chain_sink`. The assembler
//! picks the emitter kind per edge:
//!
//! - declared key-by → **KeyBy**
//! - window operators taking parallel input → **Broadcast**
//! - equal parallelism, no key-by, no prior split or merge → **Forward**
//!   (a plain SPSC pass-through, no distribution work)
//! - anything else → **Reshuffle** (round-robin)
//!
//! A stage's replicas are wired lazily: when an operator is chained, the
//! channels to it are created, the upstream emitters are built, and the
//! upstream replicas become runnable. `run()` refuses graphs with
//! dangling pipes, spawns one thread per replica, joins them all, and
//! retains per-operator statistics.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{channel, RecvPort, SendPort};
use crate::config::{ExecutionMode, TimePolicy, WatermarkCadence, DEFAULT_CHANNEL_CAPACITY};
use crate::emitter::{BasicEmitter, Emitter, Routing};
use crate::gate::InputGate;
use crate::message::{Data, Message};
use crate::operator::source::Source;
use crate::operator::windows::PanedWindows;
use crate::operator::{
    ConfigError, InputRouting, OpDescriptor, ReplicaContext, SinkOperator, SourceShipper,
    StreamOperator,
};
use crate::pool::BatchPool;
use crate::stats::{dump_to, log_dir, OperatorStats};
use crate::worker::{run_sink, run_source, run_unary, Worker};

/// Errors raised during graph assembly and execution.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// An operator failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `run()` was called while a pipe is still unterminated.
    #[error("dangling pipe: stage '{0}' has no downstream operator")]
    DanglingPipe(String),

    /// `select` with a branch index past the split arity.
    #[error("split branch {index} out of range (split has {branches} branches)")]
    BranchOutOfRange {
        /// Requested branch.
        index: usize,
        /// Number of branches.
        branches: usize,
    },

    /// `select` called twice for one branch.
    #[error("split branch {0} already selected")]
    BranchAlreadySelected(usize),

    /// `split` with zero branches.
    #[error("split needs at least one branch")]
    EmptySplit,

    /// Pipes from different graphs cannot be merged.
    #[error("merge across different graphs")]
    MergeAcrossGraphs,

    /// The graph already ran.
    #[error("graph has already run")]
    AlreadyRun,

    /// `run()` on a graph with no operators.
    #[error("empty graph: no operators")]
    EmptyGraph,

    /// A worker thread could not be spawned.
    #[error("failed to spawn replica thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Clone, Copy)]
struct GraphConfig {
    mode: ExecutionMode,
    policy: TimePolicy,
    cadence: WatermarkCadence,
}

struct Core {
    config: GraphConfig,
    workers: Vec<Worker>,
    ops: Vec<OperatorStats>,
    /// Stages awaiting a downstream operator, by label.
    open_stages: Vec<String>,
    ran: bool,
}

impl Core {
    fn open_stage(&mut self, label: &str) {
        self.open_stages.push(label.to_string());
    }

    fn close_stage(&mut self, label: &str) {
        if let Some(pos) = self.open_stages.iter().position(|l| l == label) {
            self.open_stages.swap_remove(pos);
        }
    }

    fn register_op(&mut self, desc: &OpDescriptor, distribution: &str) -> usize {
        let idx = self.ops.len();
        self.ops.push(OperatorStats {
            name: desc.name.clone(),
            op_type: desc.op_type.to_string(),
            distribution: distribution.to_string(),
            is_terminated: false,
            is_windowed: desc.windowed.is_some(),
            window_type: desc.windowed.as_ref().map(|w| w.win_type.to_string()),
            window_length: desc.windowed.as_ref().map(|w| w.length),
            window_slide: desc.windowed.as_ref().map(|w| w.slide),
            lateness: desc.windowed.as_ref().and_then(|w| w.lateness),
            parallelism: desc.parallelism,
            output_batch_size: desc.output_batch_size,
            replicas: Vec::new(),
        });
        idx
    }

    /// Output batching is a default-mode optimisation; the ordered merges
    /// operate on per-tuple timestamps.
    fn effective_batch(&self, requested: usize, op_name: &str) -> usize {
        if requested > 0 && self.config.mode.is_ordered() {
            tracing::warn!(
                operator = op_name,
                "output batching disabled under ordered execution mode"
            );
            return 0;
        }
        requested
    }
}

/// Finalises one upstream replica once its emitter exists.
type Finisher<T> = Box<dyn FnOnce(Emitter<T>, &mut Core)>;

/// An unfinished stage: one finisher per upstream replica.
struct PendingStage<T> {
    label: String,
    finishers: Vec<Finisher<T>>,
    batch_sizes: Vec<usize>,
    forwardable: bool,
}

/// A pipe whose most recent stage still awaits its downstream operator.
pub struct MultiPipe<T: Data> {
    core: Arc<Mutex<Core>>,
    stage: PendingStage<T>,
}

impl<T: Data> std::fmt::Debug for MultiPipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiPipe")
            .field("label", &self.stage.label)
            .finish()
    }
}

enum EdgeRouting<T> {
    Forward,
    Broadcast,
    KeyBy(Arc<dyn Fn(&T) -> u64 + Send + Sync>),
    Reshuffle,
}

impl<T> EdgeRouting<T> {
    fn label(&self) -> &'static str {
        match self {
            Self::Forward => "FORWARD",
            Self::Broadcast => "BROADCAST",
            Self::KeyBy(_) => "KEYBY",
            Self::Reshuffle => "RESHUFFLE",
        }
    }
}

/// Wires the edge between a pending stage and `n_down` replicas: creates
/// the channels, builds one emitter per upstream replica, finalises the
/// upstream workers, and returns one input gate per downstream replica.
fn wire_edge<T: Data>(
    core: &mut Core,
    stage: PendingStage<T>,
    routing: EdgeRouting<T>,
    n_down: usize,
) -> Vec<InputGate<T>> {
    let n_up = stage.finishers.len();
    let config = core.config;
    let forward = matches!(routing, EdgeRouting::Forward);
    debug_assert!(!forward || n_up == n_down);

    // Channel matrix: forward connects i -> i only, every other routing
    // connects every upstream replica to every downstream replica.
    let mut rx_columns: Vec<Vec<RecvPort<Message<T>>>> = (0..n_down).map(|_| Vec::new()).collect();
    let mut tx_rows: Vec<Vec<SendPort<Message<T>>>> = (0..n_up).map(|_| Vec::new()).collect();
    for (i, tx_row) in tx_rows.iter_mut().enumerate() {
        if forward {
            let (tx, rx) = channel(DEFAULT_CHANNEL_CAPACITY);
            tx_row.push(tx);
            rx_columns[i].push(rx);
        } else {
            for rx_col in rx_columns.iter_mut() {
                let (tx, rx) = channel(DEFAULT_CHANNEL_CAPACITY);
                tx_row.push(tx);
                rx_col.push(rx);
            }
        }
    }

    // One emitter per upstream replica; keep its pool handle for the gates.
    let punct_generation = config.mode == ExecutionMode::Default;
    let mut emitters = Vec::with_capacity(n_up);
    let mut pools: Vec<Option<BatchPool<T>>> = Vec::with_capacity(n_up);
    for (i, dests) in tx_rows.into_iter().enumerate() {
        let batch = stage.batch_sizes[i];
        let em_routing = match &routing {
            EdgeRouting::Forward => Routing::Forward,
            EdgeRouting::Broadcast => Routing::Broadcast,
            EdgeRouting::KeyBy(h) => Routing::KeyBy(Arc::clone(h)),
            EdgeRouting::Reshuffle => Routing::Reshuffle,
        };
        let emitter = BasicEmitter::new(em_routing, dests, batch, punct_generation, config.cadence);
        pools.push((batch > 0).then(|| emitter.pool_handle()));
        emitters.push(emitter);
    }

    // Downstream gates: forward sees one input channel, everything else
    // one per upstream replica.
    let gates: Vec<InputGate<T>> = rx_columns
        .into_iter()
        .enumerate()
        .map(|(j, inputs)| {
            let mut gate = InputGate::new(inputs, config.mode);
            if forward {
                gate.set_pools(vec![pools[j].clone()]);
            } else {
                gate.set_pools(pools.clone());
            }
            gate
        })
        .collect();

    // The upstream replicas are complete now.
    for (finisher, emitter) in stage.finishers.into_iter().zip(emitters) {
        finisher(Emitter::Basic(emitter), core);
    }
    core.close_stage(&stage.label);
    gates
}

impl<T: Data> MultiPipe<T> {
    fn decide_routing(&self, routing: InputRouting<T>, n_down: usize) -> EdgeRouting<T> {
        match routing {
            InputRouting::KeyBy(h) => EdgeRouting::KeyBy(h),
            InputRouting::Broadcast => EdgeRouting::Broadcast,
            InputRouting::Auto => {
                if self.stage.forwardable && self.stage.finishers.len() == n_down {
                    EdgeRouting::Forward
                } else {
                    EdgeRouting::Reshuffle
                }
            }
        }
    }

    /// Appends an operator, returning the extended pipe.
    ///
    /// # Errors
    ///
    /// Returns the operator's configuration errors.
    pub fn chain<Op>(self, op: Op) -> Result<MultiPipe<Op::Out>, GraphError>
    where
        Op: StreamOperator<T>,
    {
        op.validate()?;
        let desc = op.descriptor();
        let routing = self.decide_routing(op.input_routing(), desc.parallelism);
        let core_rc = Arc::clone(&self.core);
        let mut core = core_rc.lock();

        let op_index = core.register_op(&desc, routing.label());
        let batch = core.effective_batch(desc.output_batch_size, &desc.name);
        let gates = wire_edge(&mut core, self.stage, routing, desc.parallelism);

        let mut finishers: Vec<Finisher<Op::Out>> = Vec::with_capacity(desc.parallelism);
        for (j, gate) in gates.into_iter().enumerate() {
            let ctx = ReplicaContext {
                name: desc.name.clone(),
                replica_index: j,
                parallelism: desc.parallelism,
            };
            let logic = op.build_replica(&ctx);
            let closing = op.closing();
            let thread_name = format!("{}-{}", desc.name, j);
            finishers.push(Box::new(move |emitter, core: &mut Core| {
                core.workers.push(Worker {
                    thread_name,
                    op_index,
                    body: Box::new(move || run_unary(ctx, gate, logic, emitter, closing)),
                });
            }));
        }

        let label = format!("{}#{}", desc.name, op_index);
        core.open_stage(&label);
        drop(core);

        Ok(MultiPipe {
            core: core_rc,
            stage: PendingStage {
                label,
                finishers,
                batch_sizes: vec![batch; desc.parallelism],
                forwardable: true,
            },
        })
    }

    /// Appends a paned window operator: the pane level and the
    /// window-combining level become two chained stages.
    ///
    /// # Errors
    ///
    /// Returns the operator's configuration errors.
    pub fn chain_paned<K, O, FK, F1, F2>(
        self,
        op: PanedWindows<T, K, O, FK, F1, F2>,
    ) -> Result<MultiPipe<(K, O)>, GraphError>
    where
        K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
        O: Default + Data,
        FK: Fn(&T) -> K + Send + Sync + 'static,
        F1: FnMut(&T, &mut O) + Clone + Send + 'static,
        F2: FnMut(&O, &mut O) + Clone + Send + 'static,
    {
        let (plq, wlq) = op.into_stages()?;
        self.chain(plq)?.chain(wlq)
    }

    /// Terminates the pipe with a sink.
    ///
    /// # Errors
    ///
    /// Returns the sink's configuration errors.
    pub fn chain_sink<Op>(self, op: Op) -> Result<(), GraphError>
    where
        Op: SinkOperator<T>,
    {
        op.validate()?;
        let desc = op.descriptor();
        let routing = self.decide_routing(op.input_routing(), desc.parallelism);
        let core_rc = Arc::clone(&self.core);
        let mut core = core_rc.lock();

        let op_index = core.register_op(&desc, routing.label());
        let gates = wire_edge(&mut core, self.stage, routing, desc.parallelism);

        for (j, gate) in gates.into_iter().enumerate() {
            let ctx = ReplicaContext {
                name: desc.name.clone(),
                replica_index: j,
                parallelism: desc.parallelism,
            };
            let logic = op.build_replica(&ctx);
            let closing = op.closing();
            core.workers.push(Worker {
                thread_name: format!("{}-{}", desc.name, j),
                op_index,
                body: Box::new(move || run_sink(ctx, gate, logic, closing)),
            });
        }
        Ok(())
    }

    /// Splits the pipe into `branches` downstream pipes; each tuple goes to
    /// the branch whose index the selector returns. Obtain the branches
    /// with [`SplitPipes::select`].
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::EmptySplit`] for a zero-branch split.
    pub fn split(
        self,
        selector: impl Fn(&T) -> usize + Send + Sync + 'static,
        branches: usize,
    ) -> Result<SplitPipes<T>, GraphError> {
        if branches == 0 {
            return Err(GraphError::EmptySplit);
        }
        let n_up = self.stage.finishers.len();
        let core_rc = Arc::clone(&self.core);
        {
            let mut core = core_rc.lock();
            core.close_stage(&self.stage.label);
            for b in 0..branches {
                core.open_stage(&split_branch_label(&self.stage.label, b));
            }
        }
        Ok(SplitPipes {
            core: core_rc,
            shared: Arc::new(Mutex::new(SplitShared {
                label: self.stage.label,
                finishers: self.stage.finishers,
                selector: Arc::new(selector),
                store: (0..branches).map(|_| (0..n_up).map(|_| None).collect()).collect(),
                filled: 0,
                taken: vec![false; branches],
            })),
            batch_sizes: self.stage.batch_sizes,
        })
    }

    /// Folds `others` into this pipe: the next operator receives input
    /// channels from every replica of every merged pipe.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::MergeAcrossGraphs`] when the pipes belong to
    /// different graphs.
    pub fn merge(mut self, others: Vec<MultiPipe<T>>) -> Result<MultiPipe<T>, GraphError> {
        for other in &others {
            if !Arc::ptr_eq(&self.core, &other.core) {
                return Err(GraphError::MergeAcrossGraphs);
            }
        }
        let mut label = self.stage.label.clone();
        {
            let mut core = self.core.lock();
            core.close_stage(&self.stage.label);
            for other in &others {
                core.close_stage(&other.stage.label);
                label = format!("{label}+{}", other.stage.label);
            }
            core.open_stage(&label);
        }
        for other in others {
            self.stage.finishers.extend(other.stage.finishers);
            self.stage.batch_sizes.extend(other.stage.batch_sizes);
        }
        self.stage.label = label;
        self.stage.forwardable = false;
        Ok(self)
    }
}

fn split_branch_label(label: &str, branch: usize) -> String {
    format!("{label}[branch {branch}]")
}

struct SplitShared<T> {
    label: String,
    finishers: Vec<Finisher<T>>,
    selector: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    /// `store[branch][upstream replica]`: branch emitters as they arrive.
    store: Vec<Vec<Option<Emitter<T>>>>,
    filled: usize,
    taken: Vec<bool>,
}

/// Handle on a split stage; yields the branch pipes.
pub struct SplitPipes<T: Data> {
    core: Arc<Mutex<Core>>,
    shared: Arc<Mutex<SplitShared<T>>>,
    batch_sizes: Vec<usize>,
}

impl<T: Data> SplitPipes<T> {
    /// Number of branches.
    #[must_use]
    pub fn branches(&self) -> usize {
        self.shared.lock().store.len()
    }

    /// Obtains the `index`-th branch as a pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range or already selected.
    pub fn select(&self, index: usize) -> Result<MultiPipe<T>, GraphError> {
        let (n_up, label) = {
            let mut shared = self.shared.lock();
            let branches = shared.store.len();
            if index >= branches {
                return Err(GraphError::BranchOutOfRange { index, branches });
            }
            if shared.taken[index] {
                return Err(GraphError::BranchAlreadySelected(index));
            }
            shared.taken[index] = true;
            (shared.finishers.len(), shared.label.clone())
        };

        let mut finishers: Vec<Finisher<T>> = Vec::with_capacity(n_up);
        for r in 0..n_up {
            let shared = Arc::clone(&self.shared);
            finishers.push(Box::new(move |emitter, core: &mut Core| {
                let ready = {
                    let mut sh = shared.lock();
                    sh.store[index][r] = Some(emitter);
                    sh.filled += 1;
                    sh.filled == sh.store.len() * sh.finishers.len()
                };
                if ready {
                    // Last branch emitter arrived: assemble the per-replica
                    // split emitters and finalise the upstream stage.
                    let (finishers, selector, mut store) = {
                        let mut sh = shared.lock();
                        (
                            std::mem::take(&mut sh.finishers),
                            Arc::clone(&sh.selector),
                            std::mem::take(&mut sh.store),
                        )
                    };
                    for (up, finish) in finishers.into_iter().enumerate() {
                        let branches: Vec<Emitter<T>> = store
                            .iter_mut()
                            .map(|row| row[up].take().expect("all branch emitters present"))
                            .collect();
                        finish(
                            Emitter::Split {
                                selector: Arc::clone(&selector),
                                branches,
                            },
                            core,
                        );
                    }
                }
            }));
        }

        Ok(MultiPipe {
            core: Arc::clone(&self.core),
            stage: PendingStage {
                label: split_branch_label(&label, index),
                finishers,
                batch_sizes: self.batch_sizes.clone(),
                forwardable: false,
            },
        })
    }
}

/// A streaming dataflow graph.
pub struct PipeGraph {
    name: String,
    core: Arc<Mutex<Core>>,
}

impl PipeGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(name: impl Into<String>, mode: ExecutionMode, policy: TimePolicy) -> Self {
        Self {
            name: name.into(),
            core: Arc::new(Mutex::new(Core {
                config: GraphConfig {
                    mode,
                    policy,
                    cadence: WatermarkCadence::from_env(),
                },
                workers: Vec::new(),
                ops: Vec::new(),
                open_stages: Vec::new(),
                ran: false,
            })),
        }
    }

    /// The graph's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a source, rooting a new pipe.
    ///
    /// # Errors
    ///
    /// Returns the source's configuration errors.
    pub fn add_source<O, F>(&mut self, op: Source<O, F>) -> Result<MultiPipe<O>, GraphError>
    where
        O: Data,
        F: FnMut(&mut SourceShipper<O>) + Clone + Send + 'static,
    {
        op.validate()?;
        let desc = op.descriptor();
        let mut core = self.core.lock();
        let op_index = core.register_op(&desc, "NONE");
        let batch = core.effective_batch(desc.output_batch_size, &desc.name);
        let config = core.config;

        let mut finishers: Vec<Finisher<O>> = Vec::with_capacity(desc.parallelism);
        for r in 0..desc.parallelism {
            let ctx = ReplicaContext {
                name: desc.name.clone(),
                replica_index: r,
                parallelism: desc.parallelism,
            };
            let logic = op.logic.clone();
            let closing = op.common.closing.clone();
            let thread_name = format!("{}-{}", desc.name, r);
            finishers.push(Box::new(move |emitter, core: &mut Core| {
                core.workers.push(Worker {
                    thread_name,
                    op_index,
                    body: Box::new(move || {
                        run_source(ctx, logic, emitter, config.policy, config.mode, closing)
                    }),
                });
            }));
        }

        let label = format!("{}#{}", desc.name, op_index);
        core.open_stage(&label);
        drop(core);

        Ok(MultiPipe {
            core: Arc::clone(&self.core),
            stage: PendingStage {
                label,
                finishers,
                batch_sizes: vec![batch; desc.parallelism],
                forwardable: true,
            },
        })
    }

    /// Starts every replica thread, blocks until the whole graph drains,
    /// and retains per-operator statistics.
    ///
    /// # Errors
    ///
    /// Fails on dangling pipes, empty or already-run graphs, and thread
    /// spawn failures.
    ///
    /// # Panics
    ///
    /// A panic in user operator logic is resumed on the calling thread.
    pub fn run(&mut self) -> Result<(), GraphError> {
        let workers = {
            let mut core = self.core.lock();
            if core.ran {
                return Err(GraphError::AlreadyRun);
            }
            if let Some(open) = core.open_stages.first() {
                return Err(GraphError::DanglingPipe(open.clone()));
            }
            if core.workers.is_empty() {
                return Err(GraphError::EmptyGraph);
            }
            core.ran = true;
            std::mem::take(&mut core.workers)
        };

        tracing::debug!(graph = %self.name, replicas = workers.len(), "starting graph");
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let body = worker.body;
            let handle = std::thread::Builder::new()
                .name(worker.thread_name)
                .spawn(move || body())?;
            handles.push((worker.op_index, handle));
        }

        for (op_index, handle) in handles {
            match handle.join() {
                Ok(stats) => {
                    let mut core = self.core.lock();
                    core.ops[op_index].replicas.push(stats);
                }
                // User-code failures are fatal; surface the panic.
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }

        let mut core = self.core.lock();
        for op in &mut core.ops {
            op.is_terminated = true;
        }
        tracing::debug!(graph = %self.name, "graph drained");
        Ok(())
    }

    /// Per-operator statistics; replica counters are populated once
    /// `run()` has returned.
    #[must_use]
    pub fn stats(&self) -> Vec<OperatorStats> {
        self.core.lock().ops.clone()
    }

    /// Writes one JSON statistics file per operator into `dir`.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn dump_stats_to(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        dump_to(dir, &self.core.lock().ops)
    }

    /// Writes statistics into `$WF_LOG_DIR`, or `./log` when unset.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn dump_stats(&self) -> std::io::Result<Vec<PathBuf>> {
        self.dump_stats_to(&log_dir())
    }
}

impl std::fmt::Debug for PipeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("PipeGraph")
            .field("name", &self.name)
            .field("operators", &core.ops.len())
            .field("open_stages", &core.open_stages)
            .field("ran", &core.ran)
            .finish()
    }
}
