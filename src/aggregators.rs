//! Aggregators: commutative-associative reductions over values contributed
//! during a superstep, finalized at the barrier and visible to every vertex
//! in the next superstep.
//!
//! Two disjoint name-spaces exist: *regular* aggregators reset at every
//! superstep, *persistent* aggregators accumulate across supersteps.
//! Partials are kept thread-local during compute (each partition task owns a
//! private map), merged into a single worker partial, shipped to the
//! aggregator-owning worker at barrier time, and reduced there.
//!
//! The reserved name [`REQUEST_COUNT_AGGREGATOR`] carries the per-worker
//! request count used for flow-control verification between workers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Reserved aggregator name carrying a 64-bit request count.
pub const REQUEST_COUNT_AGGREGATOR: &str = "<COUNT>";

/// A dynamically typed aggregator value, as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AggValue {
    /// Signed integer.
    I64(i64),
    /// Unsigned integer (request counts).
    U64(u64),
    /// Floating point.
    F64(f64),
    /// Boolean.
    Bool(bool),
}

/// A commutative, associative reduction with an initial value.
pub trait AggregatorFn: Send + Sync + 'static {
    /// Stable identifier written next to the name in wire frames.
    fn kind(&self) -> &'static str;

    /// The reduction's initial value.
    fn initial(&self) -> AggValue;

    /// Fold `other` into `acc`. Mismatched variants are ignored with a
    /// warning; the reduction itself never fails.
    fn reduce(&self, acc: &mut AggValue, other: AggValue);
}

macro_rules! numeric_aggregator {
    ($name:ident, $kind:literal, $variant:ident, $ty:ty, $init:expr, $fold:expr) => {
        /// Built-in reduction. See the module docs for how partials travel.
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl AggregatorFn for $name {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn initial(&self) -> AggValue {
                AggValue::$variant($init)
            }

            fn reduce(&self, acc: &mut AggValue, other: AggValue) {
                match (acc, other) {
                    (AggValue::$variant(a), AggValue::$variant(b)) => {
                        let f: fn($ty, $ty) -> $ty = $fold;
                        *a = f(*a, b);
                    }
                    (acc, other) => {
                        warn!(kind = $kind, ?acc, ?other, "aggregator value variant mismatch");
                    }
                }
            }
        }
    };
}

numeric_aggregator!(I64Sum, "i64-sum", I64, i64, 0, |a, b| a + b);
numeric_aggregator!(I64Min, "i64-min", I64, i64, i64::MAX, |a, b| a.min(b));
numeric_aggregator!(I64Max, "i64-max", I64, i64, i64::MIN, |a, b| a.max(b));
numeric_aggregator!(U64Sum, "u64-sum", U64, u64, 0, |a, b| a + b);
numeric_aggregator!(F64Sum, "f64-sum", F64, f64, 0.0, |a, b| a + b);
numeric_aggregator!(F64Max, "f64-max", F64, f64, f64::NEG_INFINITY, |a, b| a.max(b));
numeric_aggregator!(BoolAnd, "bool-and", Bool, bool, true, |a, b| a && b);
numeric_aggregator!(BoolOr, "bool-or", Bool, bool, false, |a, b| a || b);

/// One aggregator registration: a name bound to a reduction, either regular
/// or persistent.
#[derive(Clone)]
pub struct AggregatorRegistration {
    /// The aggregator name vertex programs use.
    pub name: String,
    /// The reduction.
    pub function: Arc<dyn AggregatorFn>,
    /// Persistent aggregators accumulate across supersteps instead of
    /// resetting.
    pub persistent: bool,
}

impl AggregatorRegistration {
    /// Register a regular (per-superstep) aggregator.
    pub fn regular(name: impl Into<String>, function: Arc<dyn AggregatorFn>) -> Self {
        Self { name: name.into(), function, persistent: false }
    }

    /// Register a persistent aggregator.
    pub fn persistent(name: impl Into<String>, function: Arc<dyn AggregatorFn>) -> Self {
        Self { name: name.into(), function, persistent: true }
    }
}

/// Worker-local aggregator state for one job.
pub struct AggregatorService {
    registry: RwLock<HashMap<String, AggregatorRegistration>>,
    /// Finalized values from the previous superstep, readable during compute.
    finalized: RwLock<HashMap<String, AggValue>>,
    /// This worker's partial for the running superstep.
    partials: Mutex<HashMap<String, AggValue>>,
    /// Partials received from peers, for names this worker owns.
    incoming: Mutex<Vec<HashMap<String, AggValue>>>,
}

impl AggregatorService {
    /// Build the service and register the reserved request-count aggregator.
    pub fn new(registrations: Vec<AggregatorRegistration>) -> Self {
        let mut registry: HashMap<String, AggregatorRegistration> = HashMap::new();
        registry.insert(
            REQUEST_COUNT_AGGREGATOR.to_string(),
            AggregatorRegistration::regular(REQUEST_COUNT_AGGREGATOR, Arc::new(U64Sum)),
        );
        for reg in registrations {
            registry.insert(reg.name.clone(), reg);
        }
        Self {
            registry: RwLock::new(registry),
            finalized: RwLock::new(HashMap::new()),
            partials: Mutex::new(HashMap::new()),
            incoming: Mutex::new(Vec::new()),
        }
    }

    /// The registration for `name`, if any.
    pub fn registration(&self, name: &str) -> Option<AggregatorRegistration> {
        self.registry.read().get(name).cloned()
    }

    /// All registered names, ascending.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Fold `value` into a thread-local partial map. Called from compute
    /// contexts; never touches shared state.
    pub fn aggregate_local(
        &self,
        local: &mut HashMap<String, AggValue>,
        name: &str,
        value: AggValue,
    ) {
        let Some(reg) = self.registration(name) else {
            warn!(name, "aggregate() on an unregistered aggregator; dropped");
            return;
        };
        let acc = local.entry(name.to_string()).or_insert_with(|| reg.function.initial());
        reg.function.reduce(acc, value);
    }

    /// Merge a finished compute task's thread-local partials into the worker
    /// partial.
    pub fn merge_local(&self, local: HashMap<String, AggValue>) {
        let mut partials = self.partials.lock();
        for (name, value) in local {
            let Some(reg) = self.registration(&name) else { continue };
            let acc = partials.entry(name).or_insert_with(|| reg.function.initial());
            reg.function.reduce(acc, value);
        }
    }

    /// Detach this worker's partial map for shipping to the owners.
    pub fn take_partials(&self) -> HashMap<String, AggValue> {
        std::mem::take(&mut *self.partials.lock())
    }

    /// Accept one peer worker's partials for names this worker owns.
    pub fn receive_partials(&self, partials: HashMap<String, AggValue>) {
        self.incoming.lock().push(partials);
    }

    /// Owner-side merge: reduce all received partials for `name`, seeded
    /// from the previous finalized value when the aggregator is persistent.
    /// Serialized per aggregator name by the caller walking names in order.
    pub fn finalize_owned(&self, name: &str) -> Option<AggValue> {
        let reg = self.registration(name)?;
        let mut acc = if reg.persistent {
            self.finalized.read().get(name).cloned().unwrap_or_else(|| reg.function.initial())
        } else {
            reg.function.initial()
        };
        let incoming = self.incoming.lock();
        let mut contributed = reg.persistent;
        for partial in incoming.iter() {
            if let Some(value) = partial.get(name) {
                reg.function.reduce(&mut acc, value.clone());
                contributed = true;
            }
        }
        contributed.then_some(acc)
    }

    /// Drop the received partials after finalization.
    pub fn clear_incoming(&self) {
        self.incoming.lock().clear();
    }

    /// Install the broadcast finalized values for the next superstep.
    pub fn set_finalized(&self, values: HashMap<String, AggValue>) {
        *self.finalized.write() = values;
    }

    /// The finalized value of `name` from the previous superstep.
    pub fn finalized(&self, name: &str) -> Option<AggValue> {
        self.finalized.read().get(name).cloned()
    }

    /// Snapshot of all finalized values (checkpointing, job results).
    pub fn finalized_snapshot(&self) -> HashMap<String, AggValue> {
        self.finalized.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_local_partials_merge_to_one_total() {
        let service = AggregatorService::new(vec![AggregatorRegistration::regular(
            "sum",
            Arc::new(I64Sum),
        )]);

        // Two compute tasks, each with a private partial map.
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        service.aggregate_local(&mut a, "sum", AggValue::I64(3));
        service.aggregate_local(&mut a, "sum", AggValue::I64(4));
        service.aggregate_local(&mut b, "sum", AggValue::I64(5));
        service.merge_local(a);
        service.merge_local(b);

        let partials = service.take_partials();
        assert_eq!(partials.get("sum"), Some(&AggValue::I64(12)));
    }

    #[test]
    fn persistent_aggregators_accumulate() {
        let service = AggregatorService::new(vec![AggregatorRegistration::persistent(
            "total",
            Arc::new(I64Sum),
        )]);
        service.set_finalized(HashMap::from([("total".to_string(), AggValue::I64(10))]));
        service.receive_partials(HashMap::from([("total".to_string(), AggValue::I64(5))]));
        assert_eq!(service.finalize_owned("total"), Some(AggValue::I64(15)));
    }

    #[test]
    fn regular_aggregators_reset_each_superstep() {
        let service =
            AggregatorService::new(vec![AggregatorRegistration::regular("s", Arc::new(I64Sum))]);
        service.set_finalized(HashMap::from([("s".to_string(), AggValue::I64(99))]));
        service.receive_partials(HashMap::from([("s".to_string(), AggValue::I64(1))]));
        assert_eq!(service.finalize_owned("s"), Some(AggValue::I64(1)));
    }

    #[test]
    fn reserved_count_name_is_always_registered() {
        let service = AggregatorService::new(Vec::new());
        assert!(service.registration(REQUEST_COUNT_AGGREGATOR).is_some());
    }
}
