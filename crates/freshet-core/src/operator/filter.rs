//! Filter operators: one payload in, zero or one out.

use std::marker::PhantomData;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::message::{Data, Single};
use crate::operator::{
    key_router, validate_parallelism, ClosingFn, Collector, ConfigError, InputRouting, OpCommon,
    OpDescriptor, ReplicaContext, StreamOperator, UnaryLogic,
};

/// A stateless filter: tuples for which the predicate returns false are
/// dropped.
pub struct Filter<I, F> {
    predicate: F,
    key_route: Option<Arc<dyn Fn(&I) -> u64 + Send + Sync>>,
    common: OpCommon,
    _marker: PhantomData<fn(&I)>,
}

impl<I, F> Filter<I, F>
where
    I: Data,
    F: FnMut(&I) -> bool + Clone + Send + 'static,
{
    /// Creates a filter from `predicate`.
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            key_route: None,
            common: OpCommon::new("filter"),
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

    /// Routes inputs by key.
    #[must_use]
    pub fn with_key_by<K, FK>(mut self, key: FK) -> Self
    where
        K: std::hash::Hash,
        FK: Fn(&I) -> K + Send + Sync + 'static,
    {
        self.key_route = Some(key_router(Arc::new(key)));
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
    pub fn with_closing(mut self, f: impl Fn(&ReplicaContext) + Send + Sync + 'static) -> Self {
        self.common.closing = Some(Arc::new(f));
        self
    }
}

struct FilterLogic<I, F> {
    predicate: F,
    _marker: PhantomData<fn(&I)>,
}

impl<I, F> UnaryLogic<I, I> for FilterLogic<I, F>
where
    I: Data,
    F: FnMut(&I) -> bool + Send,
{
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<I>) {
        if (self.predicate)(&tuple.payload) {
            out.emit(tuple.payload, tuple.identifier, tuple.timestamp, watermark);
        }
    }
}

impl<I, F> StreamOperator<I> for Filter<I, F>
where
    I: Data,
    F: FnMut(&I) -> bool + Clone + Send + 'static,
{
    type Out = I;

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Filter",
            parallelism: self.common.parallelism,
            output_batch_size: self.common.output_batch_size,
            windowed: None,
        }
    }

    fn input_routing(&self) -> InputRouting<I> {
        match &self.key_route {
            Some(r) => InputRouting::KeyBy(Arc::clone(r)),
            None => InputRouting::Auto,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)
    }

    fn build_replica(&self, _ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, I>> {
        Box::new(FilterLogic {
            predicate: self.predicate.clone(),
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}

/// A keyed-stateful filter: the predicate sees the state slot of the
/// tuple's key.
pub struct KeyedFilter<I, K, S, FK, F> {
    key: Arc<FK>,
    predicate: F,
    common: OpCommon,
    _marker: PhantomData<fn(&I, K, S)>,
}

impl<I, K, S, FK, F> KeyedFilter<I, K, S, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    S: Default + Send + 'static,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(&I, &mut S) -> bool + Clone + Send + 'static,
{
    /// Creates a keyed-stateful filter; input routing is key-by.
    pub fn new(key: FK, predicate: F) -> Self {
        Self {
            key: Arc::new(key),
            predicate,
            common: OpCommon::new("keyed-filter"),
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

    /// Enables batched emission (0 = per-tuple).
    #[must_use]
    pub fn with_output_batch_size(mut self, size: usize) -> Self {
        self.common.output_batch_size = size;
        self
    }

    /// Installs a per-replica teardown callback.
    #[must_use]
    pub fn with_closing(mut self, f: impl Fn(&ReplicaContext) + Send + Sync + 'static) -> Self {
        self.common.closing = Some(Arc::new(f));
        self
    }
}

struct KeyedFilterLogic<I, K, S, FK, F> {
    key: Arc<FK>,
    predicate: F,
    states: FxHashMap<K, S>,
    _marker: PhantomData<fn(&I)>,
}

impl<I, K, S, FK, F> UnaryLogic<I, I> for KeyedFilterLogic<I, K, S, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send,
    S: Default + Send,
    FK: Fn(&I) -> K + Send + Sync,
    F: FnMut(&I, &mut S) -> bool + Send,
{
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<I>) {
        let key = (self.key)(&tuple.payload);
        let state = self.states.entry(key).or_default();
        if (self.predicate)(&tuple.payload, state) {
            out.emit(tuple.payload, tuple.identifier, tuple.timestamp, watermark);
        }
    }
}

impl<I, K, S, FK, F> StreamOperator<I> for KeyedFilter<I, K, S, FK, F>
where
    I: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    S: Default + Send + 'static,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(&I, &mut S) -> bool + Clone + Send + 'static,
{
    type Out = I;

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Keyed_Filter",
            parallelism: self.common.parallelism,
            output_batch_size: self.common.output_batch_size,
            windowed: None,
        }
    }

    fn input_routing(&self) -> InputRouting<I> {
        InputRouting::KeyBy(key_router(Arc::clone(&self.key)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_parallelism(&self.common)
    }

    fn build_replica(&self, _ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, I>> {
        Box::new(KeyedFilterLogic {
            key: Arc::clone(&self.key),
            predicate: self.predicate.clone(),
            states: FxHashMap::default(),
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}
