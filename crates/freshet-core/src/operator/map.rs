//! Map operators: one payload in, one payload out.

use std::marker::PhantomData;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::message::{Data, Single};
use crate::operator::{
    key_router, validate_parallelism, ClosingFn, Collector, ConfigError, InputRouting, OpCommon,
    OpDescriptor, ReplicaContext, StreamOperator, UnaryLogic,
};

/// A stateless map. With `with_key_by` the input is hash-partitioned but
/// the logic stays stateless.
pub struct Map<I, O, F> {
    logic: F,
    key_route: Option<Arc<dyn Fn(&I) -> u64 + Send + Sync>>,
    common: OpCommon,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> Map<I, O, F>
where
    I: Data,
    O: Data,
    F: FnMut(I) -> O + Clone + Send + 'static,
{
    /// Creates a map from `f`.
    pub fn new(logic: F) -> Self {
        Self {
            logic,
            key_route: None,
            common: OpCommon::new("map"),
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

    /// Routes inputs by key: all tuples with equal `key(payload)` reach the
    /// same replica in producer FIFO order.
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

struct MapLogic<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> UnaryLogic<I, O> for MapLogic<I, O, F>
where
    I: Data,
    O: Data,
    F: FnMut(I) -> O + Send,
{
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<O>) {
        let mapped = (self.f)(tuple.payload);
        out.emit(mapped, tuple.identifier, tuple.timestamp, watermark);
    }
}

impl<I, O, F> StreamOperator<I> for Map<I, O, F>
where
    I: Data,
    O: Data,
    F: FnMut(I) -> O + Clone + Send + 'static,
{
    type Out = O;

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Map",
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

    fn build_replica(&self, _ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, O>> {
        Box::new(MapLogic {
            f: self.logic.clone(),
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}

/// A keyed-stateful map: the logic receives the state slot of the tuple's
/// key. State starts from `S::default()` and lives for the replica's
/// lifetime.
pub struct KeyedMap<I, O, K, S, FK, F> {
    key: Arc<FK>,
    logic: F,
    common: OpCommon,
    _marker: PhantomData<fn(I, K, S) -> O>,
}

impl<I, O, K, S, FK, F> KeyedMap<I, O, K, S, FK, F>
where
    I: Data,
    O: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    S: Default + Send + 'static,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(I, &mut S) -> O + Clone + Send + 'static,
{
    /// Creates a keyed-stateful map; input routing is key-by.
    pub fn new(key: FK, logic: F) -> Self {
        Self {
            key: Arc::new(key),
            logic,
            common: OpCommon::new("keyed-map"),
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

struct KeyedMapLogic<I, O, K, S, FK, F> {
    key: Arc<FK>,
    f: F,
    states: FxHashMap<K, S>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, K, S, FK, F> UnaryLogic<I, O> for KeyedMapLogic<I, O, K, S, FK, F>
where
    I: Data,
    O: Data,
    K: std::hash::Hash + Eq + Clone + Send,
    S: Default + Send,
    FK: Fn(&I) -> K + Send + Sync,
    F: FnMut(I, &mut S) -> O + Send,
{
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<O>) {
        let key = (self.key)(&tuple.payload);
        let state = self.states.entry(key).or_default();
        let mapped = (self.f)(tuple.payload, state);
        out.emit(mapped, tuple.identifier, tuple.timestamp, watermark);
    }
}

impl<I, O, K, S, FK, F> StreamOperator<I> for KeyedMap<I, O, K, S, FK, F>
where
    I: Data,
    O: Data,
    K: std::hash::Hash + Eq + Clone + Send + 'static,
    S: Default + Send + 'static,
    FK: Fn(&I) -> K + Send + Sync + 'static,
    F: FnMut(I, &mut S) -> O + Clone + Send + 'static,
{
    type Out = O;

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "Keyed_Map",
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

    fn build_replica(&self, _ctx: &ReplicaContext) -> Box<dyn UnaryLogic<I, O>> {
        Box::new(KeyedMapLogic {
            key: Arc::clone(&self.key),
            f: self.logic.clone(),
            states: FxHashMap::default(),
            _marker: PhantomData,
        })
    }

    fn closing(&self) -> Option<ClosingFn> {
        self.common.closing.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecCollector(Vec<(u64, u64, u64)>);

    impl Collector<u64> for VecCollector {
        fn emit(&mut self, payload: u64, _identifier: u64, timestamp: u64, watermark: u64) {
            self.0.push((payload, timestamp, watermark));
        }
    }

    #[test]
    fn map_logic_transforms_and_keeps_envelope() {
        let op = Map::new(|v: u64| v + 1);
        let mut logic = op.build_replica(&ReplicaContext {
            name: "map".into(),
            replica_index: 0,
            parallelism: 1,
        });
        let mut out = VecCollector(Vec::new());
        logic.on_tuple(Single::new(41, 0, 10, 5), 5, &mut out);
        assert_eq!(out.0, vec![(42, 10, 5)]);
    }

    #[test]
    fn keyed_map_accumulates_per_key() {
        let op = KeyedMap::new(|v: &u64| v % 2, |v: u64, sum: &mut u64| {
            *sum += v;
            *sum
        });
        let mut logic = op.build_replica(&ReplicaContext {
            name: "keyed-map".into(),
            replica_index: 0,
            parallelism: 1,
        });
        let mut out = VecCollector(Vec::new());
        for v in [1u64, 2, 3, 4] {
            logic.on_tuple(Single::new(v, 0, 0, 0), 0, &mut out);
        }
        let sums: Vec<u64> = out.0.iter().map(|(p, _, _)| *p).collect();
        // odd: 1, 1+3; even: 2, 2+4.
        assert_eq!(sums, vec![1, 2, 4, 6]);
    }

    #[test]
    fn keyed_routing_is_reported() {
        let op = Map::new(|v: u64| v).with_key_by(|v: &u64| *v);
        assert!(matches!(op.input_routing(), InputRouting::KeyBy(_)));
        let op = Map::new(|v: u64| v);
        assert!(matches!(op.input_routing(), InputRouting::Auto));
    }
}
