//! FlatMap operator: one payload in, any number out via a [`Shipper`].

use std::marker::PhantomData;
use std::sync::Arc;

use crate::message::{Data, Single};
use crate::operator::{
    key_router, validate_parallelism, ClosingFn, Collector, ConfigError, InputRouting, OpCommon,
    OpDescriptor, ReplicaContext, StreamOperator, UnaryLogic,
};

/// Handle through which flat-map logic ships its outputs.
///
/// Everything pushed while handling one input tuple inherits that tuple's
/// timestamp and the replica's current input watermark. Pushes are staged
/// in a small inline buffer and forwarded when the logic returns.
pub struct Shipper<O> {
    staged: smallvec::SmallVec<[O; 4]>,
    delivered: u64,
}

impl<O> Shipper<O> {
    pub(crate) fn new() -> Self {
        Self {
            staged: smallvec::SmallVec::new(),
            delivered: 0,
        }
    }

    /// Ships one result.
    pub fn push(&mut self, payload: O) {
        self.delivered += 1;
        self.staged.push(payload);
    }

    /// Total results shipped by this replica so far.
    #[must_use]
    pub fn num_delivered(&self) -> u64 {
        self.delivered
    }
}

/// A flat map.
pub struct FlatMap<I, O, F> {
    logic: F,
    key_route: Option<Arc<dyn Fn(&I) -> u64 + Send + Sync>>,
    common: OpCommon,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FlatMap<I, O, F>
where
    I: Data,
    O: Data,
    F: FnMut(I, &mut Shipper<O>) + Clone + Send + 'static,
{
    /// Creates a flat map from `f`.
    pub fn new(logic: F) -> Self {
        Self {
            logic,
            key_route: None,
            common: OpCommon::new("flatmap"),
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

struct FlatMapLogic<I, O, F> {
    f: F,
    shipper: Shipper<O>,
    next_identifier: u64,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> UnaryLogic<I, O> for FlatMapLogic<I, O, F>
where
    I: Data,
    O: Data,
    F: FnMut(I, &mut Shipper<O>) + Send,
{
    fn on_tuple(&mut self, tuple: Single<I>, watermark: u64, out: &mut dyn Collector<O>) {
        (self.f)(tuple.payload, &mut self.shipper);
        for payload in self.shipper.staged.drain(..) {
            let identifier = self.next_identifier;
            self.next_identifier += 1;
            out.emit(payload, identifier, tuple.timestamp, watermark);
        }
    }
}

impl<I, O, F> StreamOperator<I> for FlatMap<I, O, F>
where
    I: Data,
    O: Data,
    F: FnMut(I, &mut Shipper<O>) + Clone + Send + 'static,
{
    type Out = O;

    fn descriptor(&self) -> OpDescriptor {
        OpDescriptor {
            name: self.common.name.clone(),
            op_type: "FlatMap",
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
        Box::new(FlatMapLogic {
            f: self.logic.clone(),
            shipper: Shipper::new(),
            next_identifier: 0,
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
        fn emit(&mut self, payload: u64, _id: u64, ts: u64, wm: u64) {
            self.0.push((payload, ts, wm));
        }
    }

    #[test]
    fn one_to_many_inherits_envelope() {
        let op = FlatMap::new(|v: u64, shipper: &mut Shipper<u64>| {
            for i in 0..v {
                shipper.push(i);
            }
        });
        let mut logic = op.build_replica(&ReplicaContext {
            name: "flatmap".into(),
            replica_index: 0,
            parallelism: 1,
        });
        let mut out = VecCollector(Vec::new());
        logic.on_tuple(Single::new(3, 0, 42, 40), 40, &mut out);
        assert_eq!(out.0, vec![(0, 42, 40), (1, 42, 40), (2, 42, 40)]);
    }

    #[test]
    fn zero_outputs_is_fine() {
        let op = FlatMap::new(|_: u64, _: &mut Shipper<u64>| {});
        let mut logic = op.build_replica(&ReplicaContext {
            name: "flatmap".into(),
            replica_index: 0,
            parallelism: 1,
        });
        let mut out = VecCollector(Vec::new());
        logic.on_tuple(Single::new(3, 0, 42, 40), 40, &mut out);
        assert!(out.0.is_empty());
    }
}
