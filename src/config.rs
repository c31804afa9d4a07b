//! Job configuration.
//!
//! Everything the classic engines wire through reflected class names and
//! string properties is a typed field here, captured once at configuration
//! time: the graph type bundle comes from the `G` parameter, value
//! construction is a factory closure, and the partition layout is an enum.
//! The same [`EngineConfig`] value is handed to every worker of a job.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregators::AggregatorRegistration;
#[cfg(feature = "checkpointing")]
use crate::checkpoint::CheckpointOptions;
use crate::combiners::Combiner;
use crate::graph::GraphTypes;
use crate::observers::MasterObserver;
use crate::partition::PartitionLayout;
use crate::rpc::RpcClientConfig;
#[cfg(feature = "checkpointing")]
use crate::superstep::SuperstepNumber;

/// Configuration shared by every worker of one job.
pub struct EngineConfig<G: GraphTypes> {
    /// Workers participating in the job.
    pub num_workers: usize,
    /// Total partitions the graph is split into.
    pub partition_count: u32,
    /// Compute thread pool size per worker.
    pub compute_threads: usize,
    /// Where each worker's RPC server listens (port 0 picks a free port).
    pub listen_addr: SocketAddr,
    /// Physical partition representation.
    pub partition_layout: PartitionLayout,
    /// Hold partitions out of core, spilling least-recently-used ones.
    pub use_out_of_core: bool,
    /// Resident partition cap for the out-of-core store.
    pub max_partitions_in_memory: usize,
    /// Root for per-worker spill directories.
    pub spill_root: PathBuf,
    /// Checkpoint directory, frequency, and cleanup policy.
    #[cfg(feature = "checkpointing")]
    pub checkpoint: CheckpointOptions,
    /// Resume from this superstep's checkpoint instead of reading input.
    #[cfg(feature = "checkpointing")]
    pub restart_superstep: Option<SuperstepNumber>,
    /// RPC client tuning (outstanding-request window, retries, timeouts).
    pub rpc: RpcClientConfig,
    /// Soft byte threshold that flushes a per-destination request batch.
    pub request_batch_bytes: usize,
    /// How long a worker waits at a barrier before giving up on peers.
    pub barrier_timeout: Duration,
    /// Whether a pending message alone materializes a missing vertex.
    pub resolver_create_on_messages: bool,
    /// Factory for default vertex values (synthesized vertices).
    pub default_value: Arc<dyn Fn() -> G::Value + Send + Sync>,
    /// Optional message combiner.
    pub combiner: Option<Arc<dyn Combiner<G>>>,
    /// Aggregators registered for the job.
    pub aggregators: Vec<AggregatorRegistration>,
    /// Lifecycle observers, invoked by the coordinating worker.
    pub observers: Vec<Arc<dyn MasterObserver>>,
}

impl<G: GraphTypes> EngineConfig<G>
where
    G::Value: Default,
{
    /// A configuration with sensible defaults for `num_workers` workers and
    /// `partition_count` partitions, using `Default` vertex values.
    pub fn new(num_workers: usize, partition_count: u32) -> Self {
        Self {
            num_workers: num_workers.max(1),
            partition_count: partition_count.max(1),
            compute_threads: num_cpus::get().max(2),
            listen_addr: "127.0.0.1:0".parse().expect("literal address"),
            partition_layout: PartitionLayout::Map,
            use_out_of_core: false,
            max_partitions_in_memory: 16,
            spill_root: std::env::temp_dir().join("irongraph-spill"),
            #[cfg(feature = "checkpointing")]
            checkpoint: CheckpointOptions::default(),
            #[cfg(feature = "checkpointing")]
            restart_superstep: None,
            rpc: RpcClientConfig::default(),
            request_batch_bytes: 512 * 1024,
            barrier_timeout: Duration::from_secs(60),
            resolver_create_on_messages: true,
            default_value: Arc::new(G::Value::default),
            combiner: None,
            aggregators: Vec::new(),
            observers: Vec::new(),
        }
    }
}

impl<G: GraphTypes> Clone for EngineConfig<G> {
    fn clone(&self) -> Self {
        Self {
            num_workers: self.num_workers,
            partition_count: self.partition_count,
            compute_threads: self.compute_threads,
            listen_addr: self.listen_addr,
            partition_layout: self.partition_layout,
            use_out_of_core: self.use_out_of_core,
            max_partitions_in_memory: self.max_partitions_in_memory,
            spill_root: self.spill_root.clone(),
            #[cfg(feature = "checkpointing")]
            checkpoint: self.checkpoint.clone(),
            #[cfg(feature = "checkpointing")]
            restart_superstep: self.restart_superstep,
            rpc: self.rpc,
            request_batch_bytes: self.request_batch_bytes,
            barrier_timeout: self.barrier_timeout,
            resolver_create_on_messages: self.resolver_create_on_messages,
            default_value: Arc::clone(&self.default_value),
            combiner: self.combiner.clone(),
            aggregators: self.aggregators.clone(),
            observers: self.observers.clone(),
        }
    }
}
