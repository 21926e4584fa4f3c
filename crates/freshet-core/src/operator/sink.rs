//! Sink operator: the terminal stage of a pipeline.
//!
//! The logic receives `Some(payload)` per tuple and a final `None` at
//! end-of-stream so it can emit a closing record.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::message::Data;
use crate::operator::{
    validate_parallelism, ClosingFn, ConfigError, InputRouting, OpCommon, OpDescriptor,
    ReplicaContext, SinkLogic, SinkOperator,
};

/// A sink.
pub struct Sink<I, F> {
    logic: F,
    common: OpCommon,
    _marker: PhantomData<fn(I)>,
}

impl<I, F> Sink<I, F>
where
    I: Data,
    F: FnMut(Option<I>) + Clone + Send + 'static,
{
    /// Creates a sink from `f`.
    pub fn new(logic: F) -> Self {
        Self {
            logic,
            common: OpCommon::new("sink"),
            _marker: PhantomData,
        }
    }

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

    /// Installs a per-replica teardown callback.
    #[must_use]
    pub fn with_closing(mut self, f: impl Fn(&ReplicaContext) + Send + Sync + 'static) -> Self {
        self.common.closing = Some(Arc::new(f));
        self
    }
}

struct SinkFnLogic<I, F> {
    f: F,
    _marker: PhantomData<fn(I)>,
}

impl<I, F> SinkLogic<I> for SinkFnLogic<I, F>
where
    I: Data,
    F: FnMut(Option<I>) + Send,
{
    fn on_tuple(&mut self, payload: I) {
        (self.f)(Some(payload));
    }

    fn on_eos(&mut self) {
        (self.f)(None);
    }
}

impl<I, F> SinkOperator<I> for Sink<I, F>
where
    I: Data,
    F: FnMut(Option<I>) + Clone + Send + 'static,
{
    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Sink",
            parallelism: self.common.parallelism,
            output_batch_size: 0,
            windowed: None,
        }
    }

    fn input_routing(&self) -> InputRouting<I> {
        InputRouting::Auto
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)
    }

    fn build_replica(&self, _ctx: &ReplicaContext) -> Box<dyn SinkLogic<I>> {
        Box::new(SinkFnLogic {
            f: self.logic.clone(),
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}
