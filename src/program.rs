//! The user-facing vertex program and its per-call context.
//!
//! A [`VertexProgram`] is invoked once per vertex per superstep -- for every
//! non-halted vertex, plus any halted vertex that received messages (which
//! reactivates it). Through the [`ComputeContext`] the program reads global
//! state from the previous superstep, sends messages, requests graph
//! mutations, and contributes aggregator deltas; through the vertex itself
//! it mutates the value and votes to halt.

use std::collections::HashMap;

use crate::aggregators::{AggValue, AggregatorService};
use crate::dispatch::RequestProcessor;
use crate::error::Result;
use crate::graph::{Edge, GraphTypes, Vertex};
use crate::superstep::{GlobalStats, SuperstepNumber};

/// User code run for each vertex each superstep.
pub trait VertexProgram<G: GraphTypes>: Send + Sync + 'static {
    /// Compute one vertex. `messages` holds everything sent to this vertex
    /// in the previous superstep. An error aborts the whole job with this
    /// vertex reported.
    fn compute(
        &self,
        ctx: &mut ComputeContext<'_, G>,
        vertex: &mut Vertex<G>,
        messages: Vec<G::Message>,
    ) -> anyhow::Result<()>;
}

/// Everything a vertex program may touch besides its own vertex.
///
/// One context exists per partition compute task; aggregator partials are
/// accumulated thread-locally in it and merged when the task finishes.
pub struct ComputeContext<'a, G: GraphTypes> {
    superstep: SuperstepNumber,
    global: &'a GlobalStats,
    processor: &'a RequestProcessor<G>,
    aggregators: &'a AggregatorService,
    local_partials: HashMap<String, AggValue>,
}

impl<'a, G: GraphTypes> ComputeContext<'a, G> {
    pub(crate) fn new(
        superstep: SuperstepNumber,
        global: &'a GlobalStats,
        processor: &'a RequestProcessor<G>,
        aggregators: &'a AggregatorService,
    ) -> Self {
        Self { superstep, global, processor, aggregators, local_partials: HashMap::new() }
    }

    pub(crate) fn into_partials(self) -> HashMap<String, AggValue> {
        self.local_partials
    }

    /// The running superstep.
    pub fn superstep(&self) -> SuperstepNumber {
        self.superstep
    }

    /// Total vertices across the job, as of the previous barrier.
    pub fn num_vertices(&self) -> u64 {
        self.global.total_vertices
    }

    /// Total edges across the job, as of the previous barrier.
    pub fn num_edges(&self) -> u64 {
        self.global.total_edges
    }

    /// Send `message` to the vertex `target`, visible next superstep.
    pub fn send_message(&mut self, target: &G::Id, message: G::Message) -> Result<()> {
        self.processor.send_message(target, message)
    }

    /// Send `message` along every outgoing edge of `vertex`.
    pub fn send_message_to_all_edges(
        &mut self,
        vertex: &Vertex<G>,
        message: G::Message,
    ) -> Result<()> {
        for edge in vertex.edges() {
            self.processor.send_message(&edge.target, message.clone())?;
        }
        Ok(())
    }

    /// Request creation of `vertex` at the superstep boundary.
    pub fn add_vertex_request(&mut self, vertex: Vertex<G>) -> Result<()> {
        self.processor.add_vertex_request(vertex)
    }

    /// Request removal of the vertex `id` at the superstep boundary.
    pub fn remove_vertex_request(&mut self, id: &G::Id) -> Result<()> {
        self.processor.remove_vertex_request(id)
    }

    /// Request appending `edge` to the vertex `source`.
    pub fn add_edge_request(&mut self, source: &G::Id, edge: Edge<G>) -> Result<()> {
        self.processor.add_edge_request(source, edge)
    }

    /// Request removing the first edge `source -> target`.
    pub fn remove_edge_request(&mut self, source: &G::Id, target: G::Id) -> Result<()> {
        self.processor.remove_edge_request(source, target)
    }

    /// Contribute `value` to the named aggregator. Folded thread-locally;
    /// visible in finalized form next superstep.
    pub fn aggregate(&mut self, name: &str, value: AggValue) {
        self.aggregators.aggregate_local(&mut self.local_partials, name, value);
    }

    /// The named aggregator's finalized value from the previous superstep.
    pub fn aggregated_value(&self, name: &str) -> Option<AggValue> {
        self.aggregators.finalized(name)
    }
}
