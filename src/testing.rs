//! Test utilities: ready-made graph type bundles, graph builders, and
//! small assertions used across the unit and integration tests.

use std::collections::HashMap;

use crate::aggregators::AggValue;
use crate::graph::{Edge, GraphTypes, Vertex};

/// Integer graph: `u64` ids, `i64` values, edge values, and messages.
pub struct SumGraph;

impl GraphTypes for SumGraph {
    type Id = u64;
    type Value = i64;
    type Edge = i64;
    type Message = i64;
}

/// Floating-point graph for rank-style programs.
pub struct RankGraph;

impl GraphTypes for RankGraph {
    type Id = u64;
    type Value = f64;
    type Edge = f64;
    type Message = f64;
}

/// A directed ring `0 -> 1 -> ... -> n-1 -> 0`, vertex `i` valued `i`.
pub fn ring(n: u64) -> Vec<Vertex<SumGraph>> {
    (0..n)
        .map(|i| {
            Vertex::with_edges(i, i as i64, vec![Edge::new((i + 1) % n, 1)])
        })
        .collect()
}

/// Isolated vertices `0..n` with no edges, vertex `i` valued `i`.
pub fn isolated(n: u64) -> Vec<Vertex<SumGraph>> {
    (0..n).map(|i| Vertex::new(i, i as i64)).collect()
}

/// Map vertices to `(id, value)` pairs sorted by id.
pub fn id_value_pairs<G: GraphTypes>(vertices: &[Vertex<G>]) -> Vec<(G::Id, G::Value)> {
    let mut pairs: Vec<(G::Id, G::Value)> =
        vertices.iter().map(|v| (v.id().clone(), v.value().clone())).collect();
    pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
    pairs
}

/// Unwrap an `I64` aggregator value.
pub fn agg_i64(values: &HashMap<String, AggValue>, name: &str) -> i64 {
    match values.get(name) {
        Some(AggValue::I64(v)) => *v,
        other => panic!("aggregator {name} missing or not I64: {other:?}"),
    }
}
