//! # Irongraph
//!
//! A **bulk-synchronous-parallel graph processing engine** for Rust in the
//! tradition of Pregel and Apache Giraph. Irongraph runs vertex-centric
//! programs over graphs partitioned across workers, advancing a global
//! superstep counter and exchanging messages between supersteps until every
//! vertex votes to halt.
//!
//! This crate is the *worker runtime*: the in-process engine that owns a
//! worker's share of the graph, executes the user program in parallel across
//! partitions, exchanges messages and mutations with peer workers over a
//! framed RPC protocol, applies graph mutations at superstep boundaries,
//! spills partitions to disk when memory is tight, and synchronizes with
//! peers through a barrier.
//!
//! ## Key Features
//!
//! - **Vertex-centric programs** - implement [`VertexProgram`], read
//!   messages, mutate the vertex, send messages, vote to halt
//! - **Two partition layouts** - a direct object map and a serialized
//!   byte-array form, chosen by configuration
//! - **Out-of-core execution** - LRU partition spilling under a configurable
//!   resident cap
//! - **Message combiners** - keep one combined message per vertex instead of
//!   a list
//! - **Aggregators** - transient and persistent commutative-associative
//!   reductions, finalized at the barrier
//! - **Graph mutations** - add/remove vertex/edge requests resolved
//!   deterministically between supersteps
//! - **Batched RPC** - per-destination request coalescing with a bounded
//!   outstanding-request window and at-most-once application
//! - **Checkpoint/restart** - periodic snapshots of partitions, inbox, and
//!   aggregators (feature: `checkpointing`)
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use irongraph::*;
//!
//! // The type bundle: u64 ids, i64 values, i64 edges and messages.
//! struct Sums;
//! impl GraphTypes for Sums {
//!     type Id = u64;
//!     type Value = i64;
//!     type Edge = i64;
//!     type Message = i64;
//! }
//!
//! // Propagate the maximum value through the graph.
//! struct MaxValue;
//! impl VertexProgram<Sums> for MaxValue {
//!     fn compute(
//!         &self,
//!         ctx: &mut ComputeContext<'_, Sums>,
//!         vertex: &mut Vertex<Sums>,
//!         messages: Vec<i64>,
//!     ) -> anyhow::Result<()> {
//!         let best = messages.into_iter().max().unwrap_or(*vertex.value());
//!         if ctx.superstep() == 0 || best > *vertex.value() {
//!             vertex.set_value(best);
//!             ctx.send_message_to_all_edges(vertex, best)?;
//!         }
//!         vertex.vote_to_halt();
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let vertices = vec![
//!     Vertex::with_edges(1, 10, vec![Edge::new(2, 0)]),
//!     Vertex::with_edges(2, 99, vec![Edge::new(1, 0)]),
//! ];
//! let job = GraphJob::<Sums> {
//!     config: EngineConfig::new(2, 4),
//!     program: Arc::new(MaxValue),
//!     vertex_input: Some(Arc::new(VecVertexInput::new(vertices, 1))),
//!     edge_input: None,
//!     output: None,
//! };
//! let result = job.run(LocalCoordination::new())?;
//! println!("done after {} supersteps", result.supersteps);
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution Model
//!
//! Each worker drives a superstep state machine:
//!
//! ```text
//! SETUP -> INPUT_SPLITS -> VERTEX_EXCHANGE -> COMPUTE -> FLUSH_REQUESTS
//!   -> BARRIER -> (APPLY_MUTATIONS || ROLL_MESSAGES || FINALIZE_AGGREGATORS)
//!   -> NEXT_SUPERSTEP | TERMINATE
//! ```
//!
//! Compute dispatches partition-sized work items to a fixed thread pool;
//! each thread stays pinned to one partition for the duration of a compute
//! call. A message sent in superstep *s* is visible to its destination in
//! superstep *s + 1* and never before. The job terminates at a barrier where
//! every vertex has voted to halt and no message is in flight.
//!
//! ## Module Overview
//!
//! - [`graph`] - ids, values, vertices, edges, the [`GraphTypes`] bundle
//! - [`program`] - the vertex program trait and compute context
//! - [`partition`] - the two partition layouts behind one trait
//! - [`store`] - resident and out-of-core partition stores
//! - [`messages`] - the double-buffered message store
//! - [`mutations`] - mutation buffer and deterministic vertex resolver
//! - [`aggregators`] - aggregator reductions and the worker-local service
//! - [`combiners`] - message combiners
//! - [`rpc`] - framed client/server with batching and dedup
//! - [`dispatch`] - routing and request batching
//! - [`superstep`] - superstep states and barrier stats
//! - [`worker`] - the worker runtime and request handlers
//! - [`job`] - the in-process job driver
//! - [`coordination`] - the coordination-service boundary and local impl
//! - [`formats`] - input/output driver interfaces
//! - [`config`] - typed job configuration
//! - [`checkpoint`] - snapshot/restart (feature: `checkpointing`)
//! - [`metrics`] - metric trait and collector (feature: `metrics`)
//! - [`testing`] - graph builders and assertions for tests
//!
//! ## Feature Flags
//!
//! - `metrics` - metrics collection (enabled by default)
//! - `checkpointing` - checkpoint/restart support (enabled by default)

pub mod aggregators;
#[cfg(feature = "checkpointing")]
pub mod checkpoint;
pub mod codec;
pub mod combiners;
pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod error;
pub mod formats;
pub mod graph;
pub mod job;
pub mod messages;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod mutations;
pub mod observers;
pub mod partition;
pub mod program;
pub mod rpc;
pub mod store;
pub mod superstep;
pub mod testing;
pub mod worker;

// General re-exports
pub use aggregators::{
    AggValue, AggregatorFn, AggregatorRegistration, BoolAnd, BoolOr, F64Max, F64Sum, I64Max,
    I64Min, I64Sum, REQUEST_COUNT_AGGREGATOR, U64Sum,
};
pub use combiners::{Combiner, MinCombiner, SumCombiner};
pub use config::EngineConfig;
pub use coordination::{BspBarrier, CoordinationService, LocalCoordination};
pub use dispatch::{PartitionOwner, RequestProcessor, partition_for_id};
pub use error::{Result, WorkerError};
pub use formats::{
    EdgeInputFormat, InputSplit, TextVertexOutput, VecEdgeInput, VecVertexInput, VecVertexOutput,
    VertexInputFormat, VertexOutputFormat, VertexWriter,
};
pub use graph::{Edge, GraphTypes, Vertex};
pub use job::{GraphJob, JobResult};
pub use messages::MessageStore;
pub use mutations::{Changes, MutationBuffer, VertexResolver};
pub use observers::MasterObserver;
pub use partition::{
    ByteArrayPartition, MapPartition, Partition, PartitionId, PartitionLayout, create_partition,
    read_partition,
};
pub use program::{ComputeContext, VertexProgram};
pub use rpc::{RequestKind, RpcClient, RpcClientConfig, RpcServer, WorkerId};
pub use store::{InMemoryPartitionStore, OutOfCorePartitionStore, PartitionRef, PartitionStore};
pub use superstep::{GlobalStats, INPUT_SUPERSTEP, SuperstepNumber, SuperstepState, WorkerStats};
pub use worker::{ServerData, Worker, WorkerOutcome};

// Gated re-exports
#[cfg(feature = "checkpointing")]
pub use checkpoint::{CheckpointData, CheckpointManager, CheckpointOptions};

#[cfg(feature = "metrics")]
pub use metrics::{CounterMetric, Metric, MetricsCollector};
