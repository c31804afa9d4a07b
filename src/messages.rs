//! The message store.
//!
//! Two inboxes live side by side: the frozen *current* inbox the running
//! superstep reads, and the *next* inbox every add targets. [`MessageStore::swap`]
//! rolls them atomically at the superstep boundary.
//!
//! With a configured [`Combiner`] the store keeps at most one message per
//! vertex and folds every add into it; otherwise each vertex holds an
//! append-only list. Adds are safe from any number of partition workers.
//!
//! A message addressed to a vertex that does not exist is never dropped: the
//! mutation resolver either creates the vertex (when configured to) or the
//! message is carried forward at swap time until a mutation creates it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::combiners::Combiner;
use crate::graph::GraphTypes;
use crate::partition::PartitionId;

/// Serializable image of one inbox, used by checkpoints.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct InboxSnapshot<G: GraphTypes> {
    /// Per partition, per vertex, the pending messages.
    pub partitions: Vec<(PartitionId, Vec<(G::Id, Vec<G::Message>)>)>,
}

/// One vertex's pending messages, shared with callers. Iteration over the
/// sequence requires holding its lock.
pub type VertexQueue<G> = Arc<Mutex<Vec<<G as GraphTypes>::Message>>>;

struct Inbox<G: GraphTypes> {
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionInbox<G>>>>,
}

struct PartitionInbox<G: GraphTypes> {
    vertices: RwLock<BTreeMap<G::Id, VertexQueue<G>>>,
}

impl<G: GraphTypes> Inbox<G> {
    fn new() -> Self {
        Self { partitions: RwLock::new(HashMap::new()) }
    }

    fn partition(&self, id: PartitionId) -> Arc<PartitionInbox<G>> {
        if let Some(p) = self.partitions.read().get(&id) {
            return Arc::clone(p);
        }
        let mut partitions = self.partitions.write();
        Arc::clone(
            partitions
                .entry(id)
                .or_insert_with(|| Arc::new(PartitionInbox { vertices: RwLock::new(BTreeMap::new()) })),
        )
    }
}

impl<G: GraphTypes> PartitionInbox<G> {
    fn queue(&self, vertex: &G::Id) -> VertexQueue<G> {
        if let Some(q) = self.vertices.read().get(vertex) {
            return Arc::clone(q);
        }
        let mut vertices = self.vertices.write();
        Arc::clone(
            vertices
                .entry(vertex.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new()))),
        )
    }
}

/// Accumulates per-vertex incoming messages for the next superstep.
pub struct MessageStore<G: GraphTypes> {
    combiner: Option<Arc<dyn Combiner<G>>>,
    current: Inbox<G>,
    next: Inbox<G>,
}

impl<G: GraphTypes> MessageStore<G> {
    /// Build a store, optionally compressing through `combiner`.
    pub fn new(combiner: Option<Arc<dyn Combiner<G>>>) -> Self {
        Self { combiner, current: Inbox::new(), next: Inbox::new() }
    }

    /// Deliver a message into the *next* superstep's inbox.
    pub fn add_message(&self, partition: PartitionId, vertex: &G::Id, message: G::Message) {
        let queue = self.next.partition(partition).queue(vertex);
        let mut q = queue.lock();
        match (&self.combiner, q.is_empty()) {
            (Some(combiner), false) => {
                let acc = q.first_mut().expect("non-empty queue");
                combiner.combine(acc, message);
            }
            _ => q.push(message),
        }
    }

    /// The pending messages for `vertex` in the current superstep, as a
    /// shared sequence. Iteration must hold the sequence's lock.
    pub fn messages_for(&self, partition: PartitionId, vertex: &G::Id) -> Option<VertexQueue<G>> {
        let inbox = {
            let partitions = self.current.partitions.read();
            Arc::clone(partitions.get(&partition)?)
        };
        let vertices = inbox.vertices.read();
        vertices.get(vertex).filter(|q| !q.lock().is_empty()).map(Arc::clone)
    }

    /// Drain and return the current-superstep messages for `vertex`.
    pub fn take_messages(&self, partition: PartitionId, vertex: &G::Id) -> Vec<G::Message> {
        match self.messages_for(partition, vertex) {
            Some(queue) => std::mem::take(&mut *queue.lock()),
            None => Vec::new(),
        }
    }

    /// Vertex ids with pending messages in the current superstep for one
    /// partition, ascending.
    pub fn destination_vertices(&self, partition: PartitionId) -> Vec<G::Id> {
        let Some(inbox) = self.current.partitions.read().get(&partition).map(Arc::clone) else {
            return Vec::new();
        };
        let vertices = inbox.vertices.read();
        vertices
            .iter()
            .filter(|(_, q)| !q.lock().is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Vertex ids with messages waiting in the *next* inbox for one
    /// partition, ascending. The mutation resolver unions these with the
    /// mutation buffer between supersteps.
    pub fn next_destination_vertices(&self, partition: PartitionId) -> Vec<G::Id> {
        let Some(inbox) = self.next.partitions.read().get(&partition).map(Arc::clone) else {
            return Vec::new();
        };
        let vertices = inbox.vertices.read();
        vertices
            .iter()
            .filter(|(_, q)| !q.lock().is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop all current-superstep messages for one partition.
    pub fn clear_partition(&self, partition: PartitionId) {
        self.current.partitions.write().remove(&partition);
    }

    /// Total messages waiting in the next inbox.
    pub fn next_message_count(&self) -> u64 {
        let partitions = self.next.partitions.read();
        partitions
            .values()
            .map(|p| p.vertices.read().values().map(|q| q.lock().len() as u64).sum::<u64>())
            .sum()
    }

    /// Atomic roll: the next-superstep inbox becomes current. Messages still
    /// sitting in the outgoing current inbox (destinations that never
    /// materialized) are folded into the incoming one rather than dropped.
    pub fn swap(&self) {
        let mut current = self.current.partitions.write();
        let mut next = self.next.partitions.write();
        let leftover = std::mem::replace(&mut *current, std::mem::take(&mut *next));
        drop(next);
        for (partition_id, inbox) in leftover {
            let vertices = inbox.vertices.read();
            for (vertex, queue) in vertices.iter() {
                let pending = std::mem::take(&mut *queue.lock());
                if pending.is_empty() {
                    continue;
                }
                let target = Arc::clone(current.entry(partition_id).or_insert_with(|| {
                    Arc::new(PartitionInbox { vertices: RwLock::new(BTreeMap::new()) })
                }));
                let target_queue = target.queue(vertex);
                let mut q = target_queue.lock();
                for message in pending {
                    match (&self.combiner, q.is_empty()) {
                        (Some(combiner), false) => {
                            let acc = q.first_mut().expect("non-empty queue");
                            combiner.combine(acc, message);
                        }
                        _ => q.push(message),
                    }
                }
            }
        }
    }

    /// Serialize the current inbox (the one the next compute pass will
    /// read), for checkpointing.
    pub fn snapshot_current(&self) -> InboxSnapshot<G> {
        let partitions = self.current.partitions.read();
        let mut out = Vec::new();
        for (pid, inbox) in partitions.iter() {
            let vertices = inbox.vertices.read();
            let entries: Vec<(G::Id, Vec<G::Message>)> = vertices
                .iter()
                .map(|(id, q)| (id.clone(), q.lock().clone()))
                .filter(|(_, msgs)| !msgs.is_empty())
                .collect();
            if !entries.is_empty() {
                out.push((*pid, entries));
            }
        }
        out.sort_by_key(|(pid, _)| *pid);
        InboxSnapshot { partitions: out }
    }

    /// Replace the current inbox with a checkpointed image.
    pub fn restore_current(&self, snapshot: InboxSnapshot<G>) {
        let mut partitions = self.current.partitions.write();
        partitions.clear();
        for (pid, entries) in snapshot.partitions {
            let inbox = Arc::new(PartitionInbox { vertices: RwLock::new(BTreeMap::new()) });
            {
                let mut vertices = inbox.vertices.write();
                for (id, msgs) in entries {
                    vertices.insert(id, Arc::new(Mutex::new(msgs)));
                }
            }
            partitions.insert(pid, inbox);
        }
    }
}
