//! The request processor: routes outgoing work items to the owner of the
//! destination partition and coalesces them into batched requests.
//!
//! Messages, vertices, and mutation requests produced during compute are
//! appended to per-destination-worker batches; when a batch passes the soft
//! byte threshold it is flushed as one request. Items whose destination
//! partition this worker owns take the local shortcut straight into server
//! data, never touching the network.

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};
use crate::graph::{Edge, GraphTypes, Vertex};
use crate::mutations::Changes;
use crate::partition::PartitionId;
use crate::rpc::wire::{
    RequestKind, encode_partition_mutations, encode_send_vertices, encode_worker_messages,
};
use crate::rpc::{RpcClient, WorkerId};
use crate::worker::ServerData;

/// A (partition, worker, address) binding published by the master at the
/// start of each superstep. Immutable within a superstep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionOwner {
    /// The partition.
    pub partition: PartitionId,
    /// The worker owning it this superstep.
    pub worker: WorkerId,
    /// Where that worker's RPC server listens.
    pub addr: SocketAddr,
}

/// Deterministic id-to-partition routing, identical on every worker.
pub fn partition_for_id<I: Hash>(id: &I, partition_count: u32) -> PartitionId {
    // DefaultHasher::new() uses fixed keys, so the mapping is stable across
    // processes.
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % u64::from(partition_count.max(1))) as PartitionId
}

struct OutgoingBatch<G: GraphTypes> {
    vertices: HashMap<PartitionId, Vec<Vertex<G>>>,
    messages: HashMap<PartitionId, BTreeMap<G::Id, Vec<G::Message>>>,
    mutations: HashMap<PartitionId, BTreeMap<G::Id, Changes<G>>>,
    approx_bytes: usize,
}

impl<G: GraphTypes> OutgoingBatch<G> {
    fn new() -> Self {
        Self {
            vertices: HashMap::new(),
            messages: HashMap::new(),
            mutations: HashMap::new(),
            approx_bytes: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.messages.is_empty() && self.mutations.is_empty()
    }
}

/// Routes and batches outgoing work items.
pub struct RequestProcessor<G: GraphTypes> {
    worker_id: WorkerId,
    partition_count: u32,
    batch_bytes: usize,
    client: Arc<RpcClient>,
    local: Arc<ServerData<G>>,
    owners: RwLock<HashMap<PartitionId, PartitionOwner>>,
    outgoing: RwLock<HashMap<WorkerId, Arc<Mutex<OutgoingBatch<G>>>>>,
    messages_sent: AtomicU64,
    requests_sent: AtomicU64,
}

impl<G: GraphTypes> RequestProcessor<G> {
    /// Build a processor for `worker_id` flushing through `client`, with
    /// the local shortcut applying directly to `local`.
    pub fn new(
        worker_id: WorkerId,
        partition_count: u32,
        batch_bytes: usize,
        client: Arc<RpcClient>,
        local: Arc<ServerData<G>>,
    ) -> Self {
        Self {
            worker_id,
            partition_count,
            batch_bytes: batch_bytes.max(1),
            client,
            local,
            owners: RwLock::new(HashMap::new()),
            outgoing: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
        }
    }

    /// Install this superstep's ownership map.
    pub fn set_owners(&self, owners: Vec<PartitionOwner>) {
        let mut outgoing = self.outgoing.write();
        for owner in &owners {
            if owner.worker != self.worker_id {
                outgoing
                    .entry(owner.worker)
                    .or_insert_with(|| Arc::new(Mutex::new(OutgoingBatch::new())));
            }
        }
        *self.owners.write() = owners.into_iter().map(|o| (o.partition, o)).collect();
    }

    /// The partition an id routes to.
    pub fn partition_for(&self, id: &G::Id) -> PartitionId {
        partition_for_id(id, self.partition_count)
    }

    /// The owner of `partition` this superstep.
    pub fn owner_of(&self, partition: PartitionId) -> Result<PartitionOwner> {
        self.owners.read().get(&partition).cloned().ok_or_else(|| {
            WorkerError::ProtocolViolation(format!("partition {partition} has no owner"))
        })
    }

    /// Partition ids this worker owns, ascending.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self
            .owners
            .read()
            .values()
            .filter(|o| o.worker == self.worker_id)
            .map(|o| o.partition)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn batch_for(&self, worker: WorkerId) -> Arc<Mutex<OutgoingBatch<G>>> {
        if let Some(batch) = self.outgoing.read().get(&worker) {
            return Arc::clone(batch);
        }
        let mut outgoing = self.outgoing.write();
        Arc::clone(outgoing.entry(worker).or_insert_with(|| Arc::new(Mutex::new(OutgoingBatch::new()))))
    }

    /// Append to a batch; flush it when the soft threshold is passed.
    fn append<F: FnOnce(&mut OutgoingBatch<G>)>(
        &self,
        worker: WorkerId,
        cost: usize,
        f: F,
    ) -> Result<()> {
        let batch = self.batch_for(worker);
        let full = {
            let mut batch = batch.lock();
            f(&mut batch);
            batch.approx_bytes += cost;
            batch.approx_bytes >= self.batch_bytes
        };
        if full {
            self.flush_worker(worker)?;
        }
        Ok(())
    }

    /// Deliver `message` to the vertex `target` for the next superstep.
    pub fn send_message(&self, target: &G::Id, message: G::Message) -> Result<()> {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let partition = self.partition_for(target);
        let owner = self.owner_of(partition)?;
        if owner.worker == self.worker_id {
            self.local.messages().add_message(partition, target, message);
            return Ok(());
        }
        let cost = std::mem::size_of::<G::Message>() + std::mem::size_of::<G::Id>() + 16;
        self.append(owner.worker, cost, |batch| {
            batch
                .messages
                .entry(partition)
                .or_default()
                .entry(target.clone())
                .or_default()
                .push(message);
        })
    }

    /// Route a loaded vertex to its owner (input loading, rebalancing).
    pub fn send_vertex(&self, vertex: Vertex<G>) -> Result<()> {
        let partition = self.partition_for(vertex.id());
        let owner = self.owner_of(partition)?;
        if owner.worker == self.worker_id {
            self.local.add_vertices(partition, vec![vertex])?;
            return Ok(());
        }
        let cost = std::mem::size_of::<Vertex<G>>()
            + vertex.num_edges() * std::mem::size_of::<Edge<G>>()
            + 16;
        self.append(owner.worker, cost, |batch| {
            batch.vertices.entry(partition).or_default().push(vertex);
        })
    }

    fn send_changes(&self, id: &G::Id, changes: Changes<G>) -> Result<()> {
        let partition = self.partition_for(id);
        let owner = self.owner_of(partition)?;
        if owner.worker == self.worker_id {
            self.local.mutations().merge_changes(id, changes);
            return Ok(());
        }
        let cost = std::mem::size_of::<Changes<G>>() + 32;
        self.append(owner.worker, cost, |batch| {
            batch
                .mutations
                .entry(partition)
                .or_default()
                .entry(id.clone())
                .or_default()
                .merge(changes);
        })
    }

    /// Request creation of `vertex` at the next superstep boundary.
    pub fn add_vertex_request(&self, vertex: Vertex<G>) -> Result<()> {
        let id = vertex.id().clone();
        self.send_changes(&id, Changes { added_vertices: vec![vertex], ..Default::default() })
    }

    /// Request removal of the vertex `id`.
    pub fn remove_vertex_request(&self, id: &G::Id) -> Result<()> {
        self.send_changes(id, Changes { removed_vertex_count: 1, ..Default::default() })
    }

    /// Request appending `edge` to the vertex `source`.
    pub fn add_edge_request(&self, source: &G::Id, edge: Edge<G>) -> Result<()> {
        self.send_changes(source, Changes { added_edges: vec![edge], ..Default::default() })
    }

    /// Request removing the first edge `source -> target`.
    pub fn remove_edge_request(&self, source: &G::Id, target: G::Id) -> Result<()> {
        self.send_changes(source, Changes { removed_edges: vec![target], ..Default::default() })
    }

    fn flush_worker(&self, worker: WorkerId) -> Result<()> {
        let batch = self.batch_for(worker);
        let drained = {
            let mut batch = batch.lock();
            if batch.is_empty() {
                return Ok(());
            }
            std::mem::replace(&mut *batch, OutgoingBatch::new())
        };
        for (partition, vertices) in drained.vertices {
            let payload = encode_send_vertices::<G>(partition, &vertices)?;
            self.client.send_request(worker, RequestKind::SendVertices, payload)?;
            self.requests_sent.fetch_add(1, Ordering::Relaxed);
        }
        if !drained.messages.is_empty() {
            let batches: Vec<(PartitionId, Vec<(G::Id, Vec<G::Message>)>)> = drained
                .messages
                .into_iter()
                .map(|(pid, by_vertex)| (pid, by_vertex.into_iter().collect()))
                .collect();
            let payload = encode_worker_messages::<G>(&batches)?;
            self.client.send_request(worker, RequestKind::SendWorkerMessages, payload)?;
            self.requests_sent.fetch_add(1, Ordering::Relaxed);
        }
        for (partition, by_vertex) in drained.mutations {
            let entries: Vec<(G::Id, Changes<G>)> = by_vertex.into_iter().collect();
            let payload = encode_partition_mutations::<G>(partition, &entries)?;
            self.client.send_request(worker, RequestKind::SendPartitionMutations, payload)?;
            self.requests_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Flush every pending batch. Does not wait for acknowledgements; pair
    /// with [`RpcClient::wait_all`].
    pub fn flush_all(&self) -> Result<()> {
        let workers: Vec<WorkerId> = self.outgoing.read().keys().copied().collect();
        for worker in workers {
            self.flush_worker(worker)?;
        }
        Ok(())
    }

    /// Messages produced since the last call.
    pub fn take_messages_sent(&self) -> u64 {
        self.messages_sent.swap(0, Ordering::Relaxed)
    }

    /// Data-plane requests sent since the last call.
    pub fn take_requests_sent(&self) -> u64 {
        self.requests_sent.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_deterministic_and_in_range() {
        for id in 0u64..200 {
            let a = partition_for_id(&id, 8);
            let b = partition_for_id(&id, 8);
            assert_eq!(a, b);
            assert!(a < 8);
        }
    }

    #[test]
    fn different_ids_spread_over_partitions() {
        let mut hit = vec![false; 4];
        for id in 0u64..64 {
            hit[partition_for_id(&id, 4) as usize] = true;
        }
        assert!(hit.iter().all(|h| *h), "every partition should receive some id");
    }
}
