//! Partition layouts.
//!
//! A partition is an ordered mapping from vertex id to vertex, with cached
//! vertex and edge counts. Two physical layouts exist behind the one
//! [`Partition`] capability trait:
//!
//! - [`MapPartition`] -- a direct object map; cheapest to mutate.
//! - [`ByteArrayPartition`] -- vertices kept serialized; memory-efficient and
//!   fast to spill or ship, at the cost of a decode/encode per access.
//!
//! User code never sees the concrete layout; the configuration picks one and
//! the engine works through the trait. Both layouts serialize to the same
//! byte stream (the send-vertices wire layout plus the halted flag), so a
//! partition written by one layout can be read back by the other.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use crate::codec;
use crate::error::{Result, WorkerError};
use crate::graph::{Edge, GraphTypes, Vertex};

/// Dense non-negative partition id. Never changes once assigned.
pub type PartitionId = u32;

/// Which physical partition representation the worker builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionLayout {
    /// Direct object map ([`MapPartition`]).
    Map,
    /// Serialized byte-array form ([`ByteArrayPartition`]).
    ByteArray,
}

/// Build an empty partition of the configured layout.
pub fn create_partition<G: GraphTypes>(
    layout: PartitionLayout,
    id: PartitionId,
) -> Box<dyn Partition<G>> {
    match layout {
        PartitionLayout::Map => Box::new(MapPartition::new(id)),
        PartitionLayout::ByteArray => Box::new(ByteArrayPartition::new(id)),
    }
}

/// The capability set every partition layout exposes: iterate vertices, put
/// vertex, lookup, serialize.
pub trait Partition<G: GraphTypes>: Send {
    /// The partition id.
    fn id(&self) -> PartitionId;

    /// Insert or replace a vertex. Last write wins on vertex id.
    fn put_vertex(&mut self, vertex: Vertex<G>);

    /// Look up a vertex by id, returning an owned copy.
    fn get_vertex(&self, id: &G::Id) -> Option<Vertex<G>>;

    /// Detach a vertex, returning it to the caller.
    fn take_vertex(&mut self, id: &G::Id) -> Option<Vertex<G>>;

    /// Whether a vertex with `id` is present.
    fn contains(&self, id: &G::Id) -> bool;

    /// Cached vertex count. Equals the map's derived count after any
    /// mutation is applied.
    fn vertex_count(&self) -> usize;

    /// Cached total edge count across all vertices.
    fn edge_count(&self) -> usize;

    /// All vertex ids in ascending order.
    fn vertex_ids(&self) -> Vec<G::Id>;

    /// Run `f` over every vertex in ascending id order, writing each vertex
    /// back after the call.
    fn for_each_vertex(
        &mut self,
        f: &mut dyn FnMut(&mut Vertex<G>) -> Result<()>,
    ) -> Result<()>;

    /// Remove and return all vertices in ascending id order.
    fn drain(&mut self) -> Vec<Vertex<G>>;

    /// Serialize the partition (id, vertex count, then each vertex).
    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()>;
}

/// Write one vertex in the wire layout: length-prefixed id bytes,
/// length-prefixed value bytes, 4-byte edge count, then per edge a
/// length-prefixed target and a length-prefixed edge value.
pub(crate) fn write_vertex<G: GraphTypes, B: BufMut>(
    buf: &mut B,
    vertex: &Vertex<G>,
) -> Result<()> {
    codec::put_value(buf, vertex.id())?;
    codec::put_value(buf, vertex.value())?;
    buf.put_u32(vertex.num_edges() as u32);
    for edge in vertex.edges() {
        codec::put_value(buf, &edge.target)?;
        codec::put_value(buf, &edge.value)?;
    }
    Ok(())
}

/// Read one vertex written by [`write_vertex`].
pub(crate) fn read_vertex<G: GraphTypes, B: Buf>(buf: &mut B) -> Result<Vertex<G>> {
    let id: G::Id = codec::get_value(buf)?;
    let value: G::Value = codec::get_value(buf)?;
    let edge_count = codec::get_count(buf)?;
    let mut edges = Vec::with_capacity(edge_count);
    for _ in 0..edge_count {
        let target: G::Id = codec::get_value(buf)?;
        let edge_value: G::Edge = codec::get_value(buf)?;
        edges.push(Edge::new(target, edge_value));
    }
    Ok(Vertex::with_edges(id, value, edges))
}

/// The partition-stream vertex encoding: the wire layout plus the halted
/// flag, which spills and checkpoints must preserve.
fn write_vertex_full<G: GraphTypes, B: BufMut>(buf: &mut B, vertex: &Vertex<G>) -> Result<()> {
    write_vertex::<G, _>(buf, vertex)?;
    buf.put_u8(vertex.is_halted() as u8);
    Ok(())
}

fn read_vertex_full<G: GraphTypes, B: Buf>(buf: &mut B) -> Result<Vertex<G>> {
    let mut vertex = read_vertex::<G, _>(buf)?;
    if !buf.has_remaining() {
        return Err(WorkerError::Deserialization("missing halted flag".into()));
    }
    if buf.get_u8() != 0 {
        vertex.vote_to_halt();
    }
    Ok(vertex)
}

/// Deserialize a partition stream produced by [`Partition::write_to`] into a
/// fresh partition of the requested layout.
pub fn read_partition<G: GraphTypes>(
    layout: PartitionLayout,
    bytes: &[u8],
) -> Result<Box<dyn Partition<G>>> {
    let mut buf = bytes;
    if buf.remaining() < 8 {
        return Err(WorkerError::Deserialization(
            "partition stream shorter than its header".into(),
        ));
    }
    let id = buf.get_u32();
    let count = buf.get_u32() as usize;
    let mut partition = create_partition::<G>(layout, id);
    for _ in 0..count {
        partition.put_vertex(read_vertex_full::<G, _>(&mut buf)?);
    }
    if buf.has_remaining() {
        return Err(WorkerError::Deserialization(format!(
            "partition {id}: {} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(partition)
}

/* ===================== MapPartition ===================== */

/// Direct object-map partition layout.
pub struct MapPartition<G: GraphTypes> {
    id: PartitionId,
    vertices: BTreeMap<G::Id, Vertex<G>>,
    edge_count: usize,
}

impl<G: GraphTypes> MapPartition<G> {
    /// Build an empty map partition.
    pub fn new(id: PartitionId) -> Self {
        Self { id, vertices: BTreeMap::new(), edge_count: 0 }
    }
}

impl<G: GraphTypes> Partition<G> for MapPartition<G> {
    fn id(&self) -> PartitionId {
        self.id
    }

    fn put_vertex(&mut self, vertex: Vertex<G>) {
        let added = vertex.num_edges();
        if let Some(old) = self.vertices.insert(vertex.id().clone(), vertex) {
            self.edge_count -= old.num_edges();
        }
        self.edge_count += added;
    }

    fn get_vertex(&self, id: &G::Id) -> Option<Vertex<G>> {
        self.vertices.get(id).cloned()
    }

    fn take_vertex(&mut self, id: &G::Id) -> Option<Vertex<G>> {
        let vertex = self.vertices.remove(id)?;
        self.edge_count -= vertex.num_edges();
        Some(vertex)
    }

    fn contains(&self, id: &G::Id) -> bool {
        self.vertices.contains_key(id)
    }

    fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    fn edge_count(&self) -> usize {
        self.edge_count
    }

    fn vertex_ids(&self) -> Vec<G::Id> {
        self.vertices.keys().cloned().collect()
    }

    fn for_each_vertex(
        &mut self,
        f: &mut dyn FnMut(&mut Vertex<G>) -> Result<()>,
    ) -> Result<()> {
        let mut edge_count = 0;
        for vertex in self.vertices.values_mut() {
            f(vertex)?;
            edge_count += vertex.num_edges();
        }
        self.edge_count = edge_count;
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vertex<G>> {
        self.edge_count = 0;
        std::mem::take(&mut self.vertices).into_values().collect()
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32(self.id);
        buf.put_u32(self.vertices.len() as u32);
        for vertex in self.vertices.values() {
            write_vertex_full::<G, _>(buf, vertex)?;
        }
        Ok(())
    }
}

/* ===================== ByteArrayPartition ===================== */

/// Serialized partition layout: each vertex is held as its wire encoding.
///
/// Lookups decode on demand; `for_each_vertex` decodes, runs the closure, and
/// re-encodes. Worth it for large graphs whose vertices are touched once per
/// superstep.
pub struct ByteArrayPartition<G: GraphTypes> {
    id: PartitionId,
    vertices: BTreeMap<G::Id, EncodedVertex>,
    edge_count: usize,
}

struct EncodedVertex {
    edges: usize,
    bytes: Vec<u8>,
}

impl<G: GraphTypes> ByteArrayPartition<G> {
    /// Build an empty byte-array partition.
    pub fn new(id: PartitionId) -> Self {
        Self { id, vertices: BTreeMap::new(), edge_count: 0 }
    }

    fn encode(vertex: &Vertex<G>) -> EncodedVertex {
        let mut bytes = Vec::new();
        // Encoding a value we just held in memory cannot fail.
        write_vertex_full::<G, _>(&mut bytes, vertex).expect("vertex encoding");
        EncodedVertex { edges: vertex.num_edges(), bytes }
    }

    fn decode(entry: &EncodedVertex) -> Vertex<G> {
        let mut buf = &entry.bytes[..];
        read_vertex_full::<G, _>(&mut buf).expect("vertex decoding")
    }
}

impl<G: GraphTypes> Partition<G> for ByteArrayPartition<G> {
    fn id(&self) -> PartitionId {
        self.id
    }

    fn put_vertex(&mut self, vertex: Vertex<G>) {
        let entry = Self::encode(&vertex);
        self.edge_count += entry.edges;
        if let Some(old) = self.vertices.insert(vertex.id().clone(), entry) {
            self.edge_count -= old.edges;
        }
    }

    fn get_vertex(&self, id: &G::Id) -> Option<Vertex<G>> {
        self.vertices.get(id).map(Self::decode)
    }

    fn take_vertex(&mut self, id: &G::Id) -> Option<Vertex<G>> {
        let entry = self.vertices.remove(id)?;
        self.edge_count -= entry.edges;
        Some(Self::decode(&entry))
    }

    fn contains(&self, id: &G::Id) -> bool {
        self.vertices.contains_key(id)
    }

    fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    fn edge_count(&self) -> usize {
        self.edge_count
    }

    fn vertex_ids(&self) -> Vec<G::Id> {
        self.vertices.keys().cloned().collect()
    }

    fn for_each_vertex(
        &mut self,
        f: &mut dyn FnMut(&mut Vertex<G>) -> Result<()>,
    ) -> Result<()> {
        let ids: Vec<G::Id> = self.vertices.keys().cloned().collect();
        for id in ids {
            let entry = self.vertices.get(&id).expect("id listed above");
            let mut vertex = Self::decode(entry);
            f(&mut vertex)?;
            let fresh = Self::encode(&vertex);
            self.edge_count += fresh.edges;
            if let Some(old) = self.vertices.insert(id, fresh) {
                self.edge_count -= old.edges;
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vertex<G>> {
        self.edge_count = 0;
        std::mem::take(&mut self.vertices)
            .values()
            .map(Self::decode)
            .collect()
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32(self.id);
        buf.put_u32(self.vertices.len() as u32);
        for entry in self.vertices.values() {
            buf.extend_from_slice(&entry.bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SumGraph;

    fn sample(id: PartitionId) -> MapPartition<SumGraph> {
        let mut p = MapPartition::new(id);
        let mut v = Vertex::new(1, 100);
        v.add_edge(Edge::new(2, 5));
        v.add_edge(Edge::new(3, 7));
        p.put_vertex(v);
        p.put_vertex(Vertex::new(2, 200));
        p
    }

    #[test]
    fn counts_track_replacement() {
        let mut p = sample(0);
        assert_eq!(p.vertex_count(), 2);
        assert_eq!(p.edge_count(), 2);
        // Replacing vertex 1 with an edgeless one drops its edges.
        p.put_vertex(Vertex::new(1, 101));
        assert_eq!(p.vertex_count(), 2);
        assert_eq!(p.edge_count(), 0);
        assert_eq!(*p.get_vertex(&1).unwrap().value(), 101);
    }

    #[test]
    fn map_round_trips_through_byte_array() {
        let p = sample(3);
        let mut bytes = Vec::new();
        p.write_to(&mut bytes).unwrap();

        let back = read_partition::<SumGraph>(PartitionLayout::ByteArray, &bytes).unwrap();
        assert_eq!(back.id(), 3);
        assert_eq!(back.vertex_count(), 2);
        assert_eq!(back.edge_count(), 2);
        let v1 = back.get_vertex(&1).unwrap();
        assert_eq!(*v1.value(), 100);
        assert_eq!(v1.edges()[1].target, 3);
    }

    #[test]
    fn byte_array_for_each_writes_back() {
        let mut p = ByteArrayPartition::<SumGraph>::new(0);
        p.put_vertex(Vertex::new(1, 10));
        p.put_vertex(Vertex::new(2, 20));
        p.for_each_vertex(&mut |v| {
            v.set_value(v.value() + 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(*p.get_vertex(&1).unwrap().value(), 11);
        assert_eq!(*p.get_vertex(&2).unwrap().value(), 21);
    }
}
