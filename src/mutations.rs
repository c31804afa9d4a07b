//! Graph mutation requests and their resolution.
//!
//! During a superstep, add/remove vertex/edge requests accumulate in a
//! [`MutationBuffer`] keyed by vertex id. Between supersteps -- when no
//! compute threads are active -- the [`VertexResolver`] drains the buffer
//! exactly once, unions it with the vertex ids that have pending messages,
//! and applies each changeset in sorted id order so every worker resolves
//! deterministically.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::graph::{Edge, GraphTypes, Vertex};
use crate::partition::Partition;

/// The buffered changes targeting one vertex id.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Changes<G: GraphTypes> {
    /// Vertices requested via add-vertex. Only the first can be adopted.
    pub added_vertices: Vec<Vertex<G>>,
    /// Number of remove-vertex requests observed.
    pub removed_vertex_count: u32,
    /// Edges to append to the vertex.
    pub added_edges: Vec<Edge<G>>,
    /// Targets whose first matching edge should be removed.
    pub removed_edges: Vec<G::Id>,
}

impl<G: GraphTypes> Default for Changes<G> {
    fn default() -> Self {
        Self {
            added_vertices: Vec::new(),
            removed_vertex_count: 0,
            added_edges: Vec::new(),
            removed_edges: Vec::new(),
        }
    }
}

impl<G: GraphTypes> Changes<G> {
    /// Fold another changeset for the same vertex into this one.
    pub fn merge(&mut self, other: Changes<G>) {
        self.added_vertices.extend(other.added_vertices);
        self.removed_vertex_count += other.removed_vertex_count;
        self.added_edges.extend(other.added_edges);
        self.removed_edges.extend(other.removed_edges);
    }
}

/// Concurrent changeset map, drained exactly once between supersteps.
pub struct MutationBuffer<G: GraphTypes> {
    by_vertex: Mutex<BTreeMap<G::Id, Changes<G>>>,
}

impl<G: GraphTypes> MutationBuffer<G> {
    /// Build an empty buffer.
    pub fn new() -> Self {
        Self { by_vertex: Mutex::new(BTreeMap::new()) }
    }

    fn update(&self, id: &G::Id, f: impl FnOnce(&mut Changes<G>)) {
        let mut map = self.by_vertex.lock();
        f(map.entry(id.clone()).or_default());
    }

    /// Request creation of `vertex`.
    pub fn add_vertex_request(&self, vertex: Vertex<G>) {
        self.update(&vertex.id().clone(), |c| c.added_vertices.push(vertex));
    }

    /// Request removal of the vertex with `id`.
    pub fn remove_vertex_request(&self, id: &G::Id) {
        self.update(id, |c| c.removed_vertex_count += 1);
    }

    /// Request appending `edge` to the vertex `source`.
    pub fn add_edge_request(&self, source: &G::Id, edge: Edge<G>) {
        self.update(source, |c| c.added_edges.push(edge));
    }

    /// Request removing the first edge `source -> target`.
    pub fn remove_edge_request(&self, source: &G::Id, target: G::Id) {
        self.update(source, |c| c.removed_edges.push(target));
    }

    /// Fold a whole changeset (arriving from a peer) into the buffer.
    pub fn merge_changes(&self, id: &G::Id, changes: Changes<G>) {
        self.update(id, |c| c.merge(changes));
    }

    /// Whether any mutation is pending.
    pub fn is_empty(&self) -> bool {
        self.by_vertex.lock().is_empty()
    }

    /// Detach every buffered changeset, leaving the buffer empty.
    pub fn drain(&self) -> BTreeMap<G::Id, Changes<G>> {
        std::mem::take(&mut *self.by_vertex.lock())
    }
}

impl<G: GraphTypes> Default for MutationBuffer<G> {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies drained changesets to a partition with a fixed, documented order.
pub struct VertexResolver<G: GraphTypes> {
    create_on_messages: bool,
    default_value: Arc<dyn Fn() -> G::Value + Send + Sync>,
}

impl<G: GraphTypes> VertexResolver<G> {
    /// Build a resolver. `create_on_messages` controls whether a pending
    /// message is enough to materialize a missing vertex.
    pub fn new(
        create_on_messages: bool,
        default_value: Arc<dyn Fn() -> G::Value + Send + Sync>,
    ) -> Self {
        Self { create_on_messages, default_value }
    }

    /// Resolve one partition: apply `changes` plus implicit creation for
    /// `message_destinations`, in ascending vertex id order.
    pub fn resolve_partition(
        &self,
        partition: &mut dyn Partition<G>,
        changes: BTreeMap<G::Id, Changes<G>>,
        message_destinations: &[G::Id],
    ) {
        // Union the two id sets; BTreeMap keeps the walk sorted.
        let mut work: BTreeMap<G::Id, Option<Changes<G>>> =
            changes.into_iter().map(|(id, c)| (id, Some(c))).collect();
        for id in message_destinations {
            work.entry(id.clone()).or_insert(None);
        }
        for (id, changeset) in work {
            let has_messages = message_destinations.binary_search(&id).is_ok();
            self.resolve_one(partition, id, changeset, has_messages);
        }
    }

    fn resolve_one(
        &self,
        partition: &mut dyn Partition<G>,
        id: G::Id,
        changes: Option<Changes<G>>,
        has_messages: bool,
    ) {
        let mut vertex = partition.take_vertex(&id);
        let mut changes = changes.unwrap_or_default();

        // 1. Prune edges.
        for target in changes.removed_edges.drain(..) {
            let removed = vertex.as_mut().is_some_and(|v| v.remove_first_edge(&target));
            if !removed {
                warn!(vertex = ?id, target = ?target, "remove-edge request found no matching edge");
            }
        }

        // 2. Any remove-vertex request schedules deletion.
        if changes.removed_vertex_count > 0 {
            vertex = None;
        }

        // 3. Adopt the first added vertex, or synthesize one when messages
        //    or edges demand it.
        if vertex.is_none() {
            if !changes.added_vertices.is_empty() {
                let mut added = changes.added_vertices.drain(..);
                vertex = added.next();
                let dropped = added.count();
                if dropped > 0 {
                    warn!(vertex = ?id, dropped, "multiple add-vertex requests; keeping the first");
                }
            } else if (has_messages && self.create_on_messages) || !changes.added_edges.is_empty() {
                vertex = Some(Vertex::new(id.clone(), (self.default_value)()));
            }
        } else if !changes.added_vertices.is_empty() {
            // 4. Add-vertex onto an existing vertex is ignored.
            warn!(vertex = ?id, "add-vertex request for an existing vertex ignored");
        }

        // 5. Apply added edges.
        if let Some(v) = vertex.as_mut() {
            for edge in changes.added_edges.drain(..) {
                v.add_edge(edge);
            }
            // Message delivery reactivates a halted vertex.
            if has_messages {
                v.activate();
            }
        }

        if let Some(v) = vertex {
            partition.put_vertex(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::MapPartition;
    use crate::testing::SumGraph;

    fn resolver(create_on_messages: bool) -> VertexResolver<SumGraph> {
        VertexResolver::new(create_on_messages, Arc::new(|| 0))
    }

    #[test]
    fn remove_wins_then_add_recreates() {
        let mut p = MapPartition::<SumGraph>::new(0);
        p.put_vertex(Vertex::new(1, 50));

        let buffer = MutationBuffer::<SumGraph>::new();
        buffer.remove_vertex_request(&1);
        buffer.add_vertex_request(Vertex::new(1, 7));
        resolver(false).resolve_partition(&mut p, buffer.drain(), &[]);

        // The old vertex is gone and the added one was adopted.
        assert_eq!(*p.get_vertex(&1).unwrap().value(), 7);
    }

    #[test]
    fn add_vertex_on_existing_is_ignored() {
        let mut p = MapPartition::<SumGraph>::new(0);
        p.put_vertex(Vertex::new(1, 50));

        let buffer = MutationBuffer::<SumGraph>::new();
        buffer.add_vertex_request(Vertex::new(1, 7));
        resolver(false).resolve_partition(&mut p, buffer.drain(), &[]);

        assert_eq!(*p.get_vertex(&1).unwrap().value(), 50);
    }

    #[test]
    fn edges_synthesize_a_missing_vertex() {
        let mut p = MapPartition::<SumGraph>::new(0);
        let buffer = MutationBuffer::<SumGraph>::new();
        buffer.add_edge_request(&3, Edge::new(9, 1));
        buffer.add_edge_request(&3, Edge::new(9, 2));
        resolver(false).resolve_partition(&mut p, buffer.drain(), &[]);

        let v = p.get_vertex(&3).unwrap();
        assert_eq!(*v.value(), 0);
        assert_eq!(v.num_edges(), 2);
    }

    #[test]
    fn messages_create_vertices_only_when_configured() {
        let mut p = MapPartition::<SumGraph>::new(0);
        resolver(false).resolve_partition(&mut p, BTreeMap::new(), &[5]);
        assert!(!p.contains(&5));

        resolver(true).resolve_partition(&mut p, BTreeMap::new(), &[5]);
        assert!(p.contains(&5));
    }

    #[test]
    fn prune_removes_first_match_only() {
        let mut p = MapPartition::<SumGraph>::new(0);
        let mut v = Vertex::new(1, 0);
        v.add_edge(Edge::new(2, 10));
        v.add_edge(Edge::new(2, 20));
        p.put_vertex(v);

        let buffer = MutationBuffer::<SumGraph>::new();
        buffer.remove_edge_request(&1, 2);
        resolver(false).resolve_partition(&mut p, buffer.drain(), &[]);

        let v = p.get_vertex(&1).unwrap();
        assert_eq!(v.num_edges(), 1);
        assert_eq!(v.edges()[0].value, 20);
    }
}
