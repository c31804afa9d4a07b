//! The worker runtime: server data, request handlers, and the superstep
//! controller.
//!
//! A [`Worker`] owns one process's share of the graph and drives it through
//! the superstep state machine: reserve and load input splits, run the user
//! program over owned partitions on a fixed compute pool, flush batched
//! requests, enter the barrier, then apply mutations, roll the message
//! inboxes, and finalize aggregators before the next superstep. The job
//! terminates once every vertex has voted to halt and no message is in
//! flight anywhere.

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::aggregators::{AggValue, AggregatorService, REQUEST_COUNT_AGGREGATOR};
#[cfg(feature = "checkpointing")]
use crate::checkpoint::{CheckpointData, CheckpointManager};
use crate::codec;
use crate::config::EngineConfig;
use crate::coordination::{BspBarrier, CoordinationService};
use crate::dispatch::{PartitionOwner, RequestProcessor};
use crate::error::{Result, WorkerError};
use crate::formats::{EdgeInputFormat, VertexInputFormat, VertexOutputFormat};
use crate::graph::{GraphTypes, Vertex};
use crate::messages::MessageStore;
#[cfg(feature = "metrics")]
use crate::metrics::{CounterMetric, MetricsCollector};
use crate::mutations::{Changes, MutationBuffer, VertexResolver};
use crate::partition::{PartitionId, PartitionLayout, create_partition, read_partition};
use crate::program::{ComputeContext, VertexProgram};
use crate::rpc::wire::{
    decode_add_edge, decode_add_vertex, decode_aggregators, decode_partition_mutations,
    decode_remove_edge, decode_remove_vertex, decode_send_vertices, decode_worker_messages,
};
use crate::rpc::{HandlerRegistry, RequestHandler, RequestKind, RpcClient, RpcServer, WorkerId};
use crate::store::{InMemoryPartitionStore, OutOfCorePartitionStore, PartitionStore};
use crate::superstep::{GlobalStats, INPUT_SUPERSTEP, SuperstepNumber, SuperstepState, WorkerStats};

/* ===================== server data ===================== */

/// The state RPC handlers execute against: this worker's stores.
pub struct ServerData<G: GraphTypes> {
    partitions: Arc<dyn PartitionStore<G>>,
    messages: Arc<MessageStore<G>>,
    mutations: Arc<MutationBuffer<G>>,
    aggregators: Arc<AggregatorService>,
    layout: PartitionLayout,
    data_requests: AtomicU64,
}

impl<G: GraphTypes> ServerData<G> {
    /// Bundle the worker's stores for handler dispatch.
    pub fn new(
        partitions: Arc<dyn PartitionStore<G>>,
        messages: Arc<MessageStore<G>>,
        mutations: Arc<MutationBuffer<G>>,
        aggregators: Arc<AggregatorService>,
        layout: PartitionLayout,
    ) -> Self {
        Self { partitions, messages, mutations, aggregators, layout, data_requests: AtomicU64::new(0) }
    }

    /// The partition store.
    pub fn partitions(&self) -> &Arc<dyn PartitionStore<G>> {
        &self.partitions
    }

    /// The message store.
    pub fn messages(&self) -> &MessageStore<G> {
        &self.messages
    }

    /// The mutation buffer.
    pub fn mutations(&self) -> &MutationBuffer<G> {
        &self.mutations
    }

    /// The aggregator service.
    pub fn aggregators(&self) -> &AggregatorService {
        &self.aggregators
    }

    /// Fold a batch of vertices into `partition`, creating it when absent.
    pub fn add_vertices(&self, partition: PartitionId, vertices: Vec<Vertex<G>>) -> Result<()> {
        let mut fresh = create_partition::<G>(self.layout, partition);
        for vertex in vertices {
            fresh.put_vertex(vertex);
        }
        self.partitions.add(fresh)
    }

    fn note_data_request(&self) {
        self.data_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Distinct data-plane requests applied since the last call.
    pub fn take_data_requests_received(&self) -> u64 {
        self.data_requests.swap(0, Ordering::Relaxed)
    }
}

/* ===================== request handlers ===================== */

struct SendVerticesHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for SendVerticesHandler<G> {
    fn handle(&self, _source: WorkerId, payload: &[u8]) -> Result<()> {
        self.0.note_data_request();
        let (partition, vertices) = decode_send_vertices::<G>(payload)?;
        self.0.add_vertices(partition, vertices)
    }
}

struct SendWorkerMessagesHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for SendWorkerMessagesHandler<G> {
    fn handle(&self, _source: WorkerId, payload: &[u8]) -> Result<()> {
        self.0.note_data_request();
        for (partition, entries) in decode_worker_messages::<G>(payload)? {
            for (vertex, messages) in entries {
                for message in messages {
                    self.0.messages().add_message(partition, &vertex, message);
                }
            }
        }
        Ok(())
    }
}

struct SendPartitionMutationsHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for SendPartitionMutationsHandler<G> {
    fn handle(&self, _source: WorkerId, payload: &[u8]) -> Result<()> {
        self.0.note_data_request();
        let (_partition, entries) = decode_partition_mutations::<G>(payload)?;
        for (vertex, changes) in entries {
            self.0.mutations().merge_changes(&vertex, changes);
        }
        Ok(())
    }
}

struct AddEdgeHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for AddEdgeHandler<G> {
    fn handle(&self, _source: WorkerId, payload: &[u8]) -> Result<()> {
        self.0.note_data_request();
        let (_partition, source, edge) = decode_add_edge::<G>(payload)?;
        self.0.mutations().add_edge_request(&source, edge);
        Ok(())
    }
}

struct RemoveEdgeHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for RemoveEdgeHandler<G> {
    fn handle(&self, _source: WorkerId, payload: &[u8]) -> Result<()> {
        self.0.note_data_request();
        let (_partition, source, target) = decode_remove_edge::<G>(payload)?;
        self.0.mutations().remove_edge_request(&source, target);
        Ok(())
    }
}

struct AddVertexHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for AddVertexHandler<G> {
    fn handle(&self, _source: WorkerId, payload: &[u8]) -> Result<()> {
        self.0.note_data_request();
        let (_partition, vertex) = decode_add_vertex::<G>(payload)?;
        self.0.mutations().add_vertex_request(vertex);
        Ok(())
    }
}

struct RemoveVertexHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for RemoveVertexHandler<G> {
    fn handle(&self, _source: WorkerId, payload: &[u8]) -> Result<()> {
        self.0.note_data_request();
        let (_partition, id) = decode_remove_vertex::<G>(payload)?;
        self.0.mutations().remove_vertex_request(&id);
        Ok(())
    }
}

struct SendAggregatorsHandler<G: GraphTypes>(Arc<ServerData<G>>);

impl<G: GraphTypes> RequestHandler for SendAggregatorsHandler<G> {
    fn handle(&self, source: WorkerId, payload: &[u8]) -> Result<()> {
        let (entries, request_count) = decode_aggregators(payload)?;
        let mut partial: HashMap<String, AggValue> = HashMap::new();
        for (name, kind, value) in entries {
            match self.0.aggregators().registration(&name) {
                Some(reg) if reg.function.kind() == kind => {
                    partial.insert(name, value);
                }
                Some(reg) => warn!(
                    name = %name,
                    expected = reg.function.kind(),
                    got = %kind,
                    "aggregator kind mismatch; dropping partial"
                ),
                None => warn!(name = %name, source, "partial for unregistered aggregator dropped"),
            }
        }
        partial.insert(REQUEST_COUNT_AGGREGATOR.to_string(), AggValue::U64(request_count));
        self.0.aggregators().receive_partials(partial);
        Ok(())
    }
}

struct FlushHandler;

impl RequestHandler for FlushHandler {
    fn handle(&self, _source: WorkerId, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Bind every request type to its handler over `data`.
pub fn build_handlers<G: GraphTypes>(data: Arc<ServerData<G>>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(RequestKind::SendVertices, Arc::new(SendVerticesHandler(Arc::clone(&data))));
    registry.register(
        RequestKind::SendWorkerMessages,
        Arc::new(SendWorkerMessagesHandler(Arc::clone(&data))),
    );
    registry.register(
        RequestKind::SendPartitionMutations,
        Arc::new(SendPartitionMutationsHandler(Arc::clone(&data))),
    );
    registry.register(
        RequestKind::SendAggregators,
        Arc::new(SendAggregatorsHandler(Arc::clone(&data))),
    );
    registry.register(RequestKind::AddEdge, Arc::new(AddEdgeHandler(Arc::clone(&data))));
    registry.register(RequestKind::RemoveEdge, Arc::new(RemoveEdgeHandler(Arc::clone(&data))));
    registry.register(RequestKind::AddVertex, Arc::new(AddVertexHandler(Arc::clone(&data))));
    registry.register(RequestKind::RemoveVertex, Arc::new(RemoveVertexHandler(data)));
    registry.register(RequestKind::Flush, Arc::new(FlushHandler));
    registry
}

/* ===================== worker ===================== */

/// What a finished worker hands back to the job driver.
#[derive(Clone, Debug)]
pub struct WorkerOutcome {
    /// Compute supersteps executed (the input superstep not included).
    pub supersteps: SuperstepNumber,
    /// Finalized aggregator values after the last superstep.
    pub aggregators: HashMap<String, AggValue>,
    /// Global stats from the final barrier.
    pub stats: GlobalStats,
}

#[derive(Default)]
struct PartitionComputeStats {
    vertices: u64,
    active: u64,
    edges: u64,
}

#[cfg(feature = "metrics")]
struct WorkerMetrics {
    collector: MetricsCollector,
    supersteps: Arc<CounterMetric>,
    messages_sent: Arc<CounterMetric>,
    requests_sent: Arc<CounterMetric>,
}

#[cfg(feature = "metrics")]
impl WorkerMetrics {
    fn new() -> Self {
        let collector = MetricsCollector::new();
        Self {
            supersteps: collector.counter("supersteps"),
            messages_sent: collector.counter("messages_sent"),
            requests_sent: collector.counter("requests_sent"),
            collector,
        }
    }
}

/// One worker's runtime for one job.
pub struct Worker<G: GraphTypes> {
    id: WorkerId,
    config: EngineConfig<G>,
    program: Arc<dyn VertexProgram<G>>,
    vertex_input: Option<Arc<dyn VertexInputFormat<G>>>,
    edge_input: Option<Arc<dyn EdgeInputFormat<G>>>,
    output: Option<Arc<dyn VertexOutputFormat<G>>>,
    coordination: Arc<dyn CoordinationService>,
    barrier: BspBarrier,
    data: Arc<ServerData<G>>,
    processor: Arc<RequestProcessor<G>>,
    client: Arc<RpcClient>,
    server: RpcServer,
    resolver: VertexResolver<G>,
    pool: rayon::ThreadPool,
    // Owns the RPC tasks; dropped (and with it every task) when the worker
    // is dropped.
    _runtime: tokio::runtime::Runtime,
    #[cfg(feature = "checkpointing")]
    checkpoints: CheckpointManager,
    #[cfg(feature = "metrics")]
    metrics: WorkerMetrics,
    abort: AtomicBool,
}

impl<G: GraphTypes> Worker<G> {
    /// Build worker `id`, binding its RPC server and compute pool.
    pub fn new(
        id: WorkerId,
        config: EngineConfig<G>,
        program: Arc<dyn VertexProgram<G>>,
        vertex_input: Option<Arc<dyn VertexInputFormat<G>>>,
        edge_input: Option<Arc<dyn EdgeInputFormat<G>>>,
        output: Option<Arc<dyn VertexOutputFormat<G>>>,
        coordination: Arc<dyn CoordinationService>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("rpc-{id}"))
            .enable_all()
            .build()?;

        let partitions: Arc<dyn PartitionStore<G>> = if config.use_out_of_core {
            Arc::new(OutOfCorePartitionStore::new(
                config.partition_layout,
                config.spill_root.join(format!("worker-{id}")),
                config.max_partitions_in_memory,
            )?)
        } else {
            Arc::new(InMemoryPartitionStore::new())
        };
        let messages = Arc::new(MessageStore::new(config.combiner.clone()));
        let mutations = Arc::new(MutationBuffer::new());
        let aggregators = Arc::new(AggregatorService::new(config.aggregators.clone()));
        let data = Arc::new(ServerData::new(
            partitions,
            messages,
            mutations,
            aggregators,
            config.partition_layout,
        ));

        let server = RpcServer::spawn(
            runtime.handle(),
            config.listen_addr,
            id,
            Arc::new(build_handlers(Arc::clone(&data))),
        )?;
        let client = Arc::new(RpcClient::new(id, runtime.handle().clone(), config.rpc));
        let processor = Arc::new(RequestProcessor::new(
            id,
            config.partition_count,
            config.request_batch_bytes,
            Arc::clone(&client),
            Arc::clone(&data),
        ));
        let resolver = VertexResolver::new(
            config.resolver_create_on_messages,
            Arc::clone(&config.default_value),
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.compute_threads)
            .thread_name(move |t| format!("compute-{id}-{t}"))
            .build()
            .map_err(|e| WorkerError::Aborted(format!("compute pool: {e}")))?;
        let barrier = BspBarrier::new(
            Arc::clone(&coordination),
            config.num_workers,
            config.barrier_timeout,
        );

        Ok(Self {
            id,
            program,
            vertex_input,
            edge_input,
            output,
            coordination,
            barrier,
            data,
            processor,
            client,
            server,
            resolver,
            pool,
            _runtime: runtime,
            #[cfg(feature = "checkpointing")]
            checkpoints: CheckpointManager::new(config.checkpoint.clone()),
            #[cfg(feature = "metrics")]
            metrics: WorkerMetrics::new(),
            config,
            abort: AtomicBool::new(false),
        })
    }

    /// The address this worker's RPC server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    fn is_coordinator(&self) -> bool {
        self.id == 0
    }

    /// Run the job to completion (or failure) from this worker's side.
    pub fn run(&self) -> Result<WorkerOutcome> {
        self.setup()?;
        if self.is_coordinator() {
            for observer in &self.config.observers {
                observer.pre_application();
            }
        }

        let (mut global, mut superstep) = self.bootstrap()?;
        loop {
            if let Some(reason) = global.failed.clone() {
                return Err(WorkerError::Aborted(reason));
            }
            if self.is_coordinator() {
                for observer in &self.config.observers {
                    observer.pre_superstep(superstep);
                }
            }
            info!(worker = self.id, superstep, active = global.active_vertices, "superstep starting");
            let stats = self.compute(superstep, &global);
            global = self.superstep_boundary(superstep, stats)?;
            if self.is_coordinator() {
                for observer in &self.config.observers {
                    observer.post_superstep(superstep);
                }
            }
            #[cfg(feature = "metrics")]
            {
                self.metrics.supersteps.increment();
                self.metrics.messages_sent.add(global.messages_sent);
                self.metrics.requests_sent.add(global.requests_sent);
            }
            #[cfg(feature = "checkpointing")]
            if global.failed.is_none() && self.checkpoints.due(superstep + 1) {
                self.write_checkpoint(superstep + 1, &global);
            }
            if let Some(reason) = global.failed.clone() {
                return Err(WorkerError::Aborted(reason));
            }
            if global.all_done() {
                break;
            }
            superstep += 1;
        }

        self.write_output()?;
        if self.is_coordinator() {
            #[cfg(feature = "checkpointing")]
            if let Err(e) = self.checkpoints.cleanup() {
                warn!(error = %e, "checkpoint cleanup failed");
            }
            for observer in &self.config.observers {
                observer.post_application();
            }
        }
        #[cfg(feature = "metrics")]
        debug!(worker = self.id, metrics = ?self.metrics.collector.snapshot(), "final metrics");
        self.client.close();
        self.server.stop();
        Ok(WorkerOutcome {
            supersteps: superstep + 1,
            aggregators: self.data.aggregators().finalized_snapshot(),
            stats: global,
        })
    }

    /// Either load input through the input superstep or restore a
    /// checkpoint, yielding the stats feeding the first compute superstep.
    fn bootstrap(&self) -> Result<(GlobalStats, SuperstepNumber)> {
        #[cfg(feature = "checkpointing")]
        if let Some(restart) = self.config.restart_superstep {
            let global = self.restore_checkpoint(restart)?;
            info!(worker = self.id, superstep = restart, "restarted from checkpoint");
            return Ok((global, restart));
        }

        if self.is_coordinator() {
            for observer in &self.config.observers {
                observer.pre_superstep(INPUT_SUPERSTEP);
            }
        }
        let stats = match self.load_input() {
            Ok(stats) => stats,
            Err(e) => {
                warn!(worker = self.id, error = %e, "input loading failed");
                WorkerStats { worker: self.id, failed: Some(e.to_string()), ..Default::default() }
            }
        };
        let global = self.superstep_boundary(INPUT_SUPERSTEP, stats)?;
        if self.is_coordinator() {
            for observer in &self.config.observers {
                observer.post_superstep(INPUT_SUPERSTEP);
            }
        }
        Ok((global, 0))
    }

    /* ------------------- SETUP ------------------- */

    /// Publish this worker's address, learn every peer's, and install the
    /// partition-ownership map.
    fn setup(&self) -> Result<()> {
        self.coordination.create_persistent(
            &format!("/workers/{}", self.id),
            self.server.local_addr().to_string().as_bytes(),
        )?;
        let addresses = self.await_worker_addresses()?;
        for (worker, addr) in &addresses {
            if *worker != self.id {
                self.client.register_peer(*worker, *addr);
            }
        }

        let owners: Vec<PartitionOwner> = if self.is_coordinator() {
            let owners = assign_partitions(self.config.partition_count, &addresses);
            self.coordination.create_persistent("/assignment", &codec::encode(&owners)?)?;
            owners
        } else {
            let blob = self.await_node("/assignment")?;
            codec::decode(&blob)?
        };
        self.processor.set_owners(owners);
        Ok(())
    }

    fn await_worker_addresses(&self) -> Result<Vec<(WorkerId, SocketAddr)>> {
        loop {
            let children = self.coordination.list_children("/workers/")?;
            if children.len() >= self.config.num_workers {
                let mut addresses = Vec::with_capacity(children.len());
                for child in children {
                    let worker: WorkerId = child
                        .rsplit('/')
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            WorkerError::CoordinationLost(format!("malformed worker node {child}"))
                        })?;
                    let payload = self.coordination.read(&child)?.unwrap_or_default();
                    let addr: SocketAddr = String::from_utf8_lossy(&payload)
                        .parse()
                        .map_err(|e| WorkerError::CoordinationLost(format!("bad address: {e}")))?;
                    addresses.push((worker, addr));
                }
                addresses.sort_by_key(|(w, _)| *w);
                return Ok(addresses);
            }
            self.coordination.watch(self.config.barrier_timeout)?;
        }
    }

    fn await_node(&self, path: &str) -> Result<Vec<u8>> {
        loop {
            if let Some(blob) = self.coordination.read(path)? {
                return Ok(blob);
            }
            self.coordination.watch(self.config.barrier_timeout)?;
        }
    }

    /* ------------------- INPUT_SPLITS / VERTEX_EXCHANGE ------------------- */

    /// The input superstep: reserve splits through the coordination
    /// service, read them, and route vertices and edges to their owners.
    fn load_input(&self) -> Result<WorkerStats> {
        let mut stats = WorkerStats { worker: self.id, ..Default::default() };
        if let Some(input) = &self.vertex_input {
            for split in input.splits(self.config.num_workers)? {
                let reserved = format!("/input/vertex-split-{}/reserved", split.index);
                if !self.coordination.create_ephemeral(&reserved, &self.id.to_be_bytes())? {
                    continue;
                }
                debug!(worker = self.id, split = split.index, "reserved vertex split");
                for vertex in input.open(&split)? {
                    let vertex = vertex?;
                    stats.total_vertices += 1;
                    stats.total_edges += vertex.num_edges() as u64;
                    self.processor.send_vertex(vertex)?;
                }
                self.coordination
                    .create_persistent(&format!("/input/vertex-split-{}/finished", split.index), &[])?;
            }
        }
        if let Some(input) = &self.edge_input {
            for split in input.splits(self.config.num_workers)? {
                let reserved = format!("/input/edge-split-{}/reserved", split.index);
                if !self.coordination.create_ephemeral(&reserved, &self.id.to_be_bytes())? {
                    continue;
                }
                debug!(worker = self.id, split = split.index, "reserved edge split");
                for entry in input.open(&split)? {
                    let (source, edge) = entry?;
                    stats.total_edges += 1;
                    self.processor.add_edge_request(&source, edge)?;
                }
                self.coordination
                    .create_persistent(&format!("/input/edge-split-{}/finished", split.index), &[])?;
            }
        }
        stats.active_vertices = stats.total_vertices;
        Ok(stats)
    }

    /* ------------------- COMPUTE ------------------- */

    /// Dispatch owned partitions to the compute pool and fold the results.
    fn compute(&self, superstep: SuperstepNumber, global: &GlobalStats) -> WorkerStats {
        let mut stats = WorkerStats { worker: self.id, ..Default::default() };
        let partition_ids = self.data.partitions().partition_ids();
        let outcome: Result<Vec<PartitionComputeStats>> = self.pool.install(|| {
            use rayon::prelude::*;
            partition_ids
                .par_iter()
                .map(|pid| self.compute_partition(*pid, superstep, global))
                .collect()
        });
        match outcome {
            Ok(parts) => {
                for part in parts {
                    stats.total_vertices += part.vertices;
                    stats.active_vertices += part.active;
                    stats.total_edges += part.edges;
                }
            }
            Err(e) => {
                warn!(worker = self.id, superstep, error = %e, "compute failed");
                self.abort.store(true, Ordering::Relaxed);
                stats.failed = Some(e.to_string());
            }
        }
        stats
    }

    /// Run the user program over one partition. Called on a compute thread,
    /// which stays pinned to the partition for the whole pass.
    fn compute_partition(
        &self,
        pid: PartitionId,
        superstep: SuperstepNumber,
        global: &GlobalStats,
    ) -> Result<PartitionComputeStats> {
        let mut part = PartitionComputeStats::default();
        // A supervisor abort stops dispatching new partitions; in-flight
        // passes are left to finish.
        if self.abort.load(Ordering::Relaxed) {
            return Ok(part);
        }
        let Some(mut partition) = self.data.partitions().get(pid)? else {
            return Ok(part);
        };
        let mut ctx =
            ComputeContext::new(superstep, global, &self.processor, self.data.aggregators());
        partition.for_each_vertex(&mut |vertex| {
            let messages = self.data.messages().take_messages(pid, vertex.id());
            part.vertices += 1;
            if vertex.is_halted() && messages.is_empty() {
                part.edges += vertex.num_edges() as u64;
                return Ok(());
            }
            vertex.activate();
            self.program.compute(&mut ctx, vertex, messages).map_err(|source| {
                WorkerError::UserCompute { vertex: format!("{:?}", vertex.id()), source }
            })?;
            part.edges += vertex.num_edges() as u64;
            if !vertex.is_halted() {
                part.active += 1;
            }
            Ok(())
        })?;
        self.data.aggregators().merge_local(ctx.into_partials());
        Ok(part)
    }

    /* ------------------- FLUSH / BARRIER / boundary states ------------------- */

    /// Drive one superstep from FLUSH_REQUESTS through NEXT_SUPERSTEP,
    /// returning the reduced global stats.
    fn superstep_boundary(
        &self,
        superstep: SuperstepNumber,
        mut stats: WorkerStats,
    ) -> Result<GlobalStats> {
        debug!(worker = self.id, superstep, state = ?SuperstepState::FlushRequests, "entering boundary");
        if stats.failed.is_none() {
            if let Err(e) = self.flush_requests() {
                warn!(worker = self.id, superstep, error = %e, "flush failed");
                stats.failed = Some(e.to_string());
            }
        }
        stats.messages_sent = self.processor.take_messages_sent();
        stats.requests_sent = self.processor.take_requests_sent();
        if let Some(fatal) = self.server.take_fatal() {
            stats.failed.get_or_insert(fatal);
        }

        // Ship aggregator partials to their owners before entering the
        // barrier so owners hold every partial once the barrier releases.
        if stats.failed.is_none() {
            if let Err(e) = self.send_aggregator_partials(stats.requests_sent) {
                warn!(worker = self.id, superstep, error = %e, "aggregator exchange failed");
                stats.failed = Some(e.to_string());
            }
        }

        // BARRIER
        debug!(worker = self.id, superstep, state = ?SuperstepState::Barrier, "entering barrier");
        let blob = codec::encode(&stats)?;
        let entries =
            self.barrier.enter(&format!("/barrier/superstep-{superstep}"), self.id, &blob)?;
        let mut all = Vec::with_capacity(entries.len());
        for (_, data) in entries {
            all.push(codec::decode::<WorkerStats>(&data)?);
        }
        let global = GlobalStats::reduce(superstep, &all);
        // Every peer has passed wait_all, so nothing from this superstep can
        // be retransmitted anymore.
        self.server.reset_dedup();
        if global.failed.is_some() {
            // Short-circuit into TERMINATE; skip mutation and roll work.
            return Ok(global);
        }

        // FINALIZE_AGGREGATORS
        let received = self.data.take_data_requests_received();
        let finalized = self.finalize_aggregators(superstep, received)?;
        self.data.aggregators().set_finalized(finalized);
        self.data.aggregators().clear_incoming();

        // APPLY_MUTATIONS
        self.apply_mutations()?;

        // ROLL_MESSAGES
        self.data.messages().swap();

        Ok(global)
    }

    fn flush_requests(&self) -> Result<()> {
        self.processor.flush_all()?;
        self.client.wait_all()
    }

    /// Split this worker's partials by owning worker and ship them; the
    /// local share takes the shortcut.
    fn send_aggregator_partials(&self, requests_sent: u64) -> Result<()> {
        let partials = self.data.aggregators().take_partials();
        let mut per_worker: HashMap<WorkerId, Vec<(String, String, AggValue)>> = HashMap::new();
        for worker in 0..self.config.num_workers as WorkerId {
            per_worker.insert(worker, Vec::new());
        }
        for (name, value) in partials {
            if name == REQUEST_COUNT_AGGREGATOR {
                continue;
            }
            let Some(reg) = self.data.aggregators().registration(&name) else { continue };
            let owner = owner_of_name(&name, self.config.num_workers);
            per_worker
                .entry(owner)
                .or_default()
                .push((name, reg.function.kind().to_string(), value));
        }
        for (worker, entries) in per_worker {
            if worker == self.id {
                let mut partial: HashMap<String, AggValue> =
                    entries.into_iter().map(|(name, _, value)| (name, value)).collect();
                partial.insert(REQUEST_COUNT_AGGREGATOR.to_string(), AggValue::U64(requests_sent));
                self.data.aggregators().receive_partials(partial);
            } else {
                let payload = crate::rpc::wire::encode_aggregators(&entries, requests_sent)?;
                self.client.send_request(worker, RequestKind::SendAggregators, payload)?;
            }
        }
        self.client.wait_all()
    }

    /// Owner-side merge, broadcast through a second barrier round, and
    /// flow-control verification against the reserved count aggregator.
    fn finalize_aggregators(
        &self,
        superstep: SuperstepNumber,
        requests_received: u64,
    ) -> Result<HashMap<String, AggValue>> {
        let mut owned: Vec<(String, AggValue)> = Vec::new();
        for name in self.data.aggregators().names() {
            if owner_of_name(&name, self.config.num_workers) != self.id {
                continue;
            }
            if let Some(value) = self.data.aggregators().finalize_owned(&name) {
                owned.push((name, value));
            }
        }
        let blob = codec::encode(&(owned, requests_received))?;
        let entries =
            self.barrier.enter(&format!("/aggregators/superstep-{superstep}"), self.id, &blob)?;

        let mut finalized: HashMap<String, AggValue> = HashMap::new();
        let mut received_total = 0u64;
        for (_, data) in entries {
            let (values, received): (Vec<(String, AggValue)>, u64) = codec::decode(&data)?;
            finalized.extend(values);
            received_total += received;
        }
        if self.is_coordinator() {
            if let Some(AggValue::U64(sent_total)) = finalized.get(REQUEST_COUNT_AGGREGATOR) {
                if *sent_total != received_total {
                    warn!(
                        superstep,
                        sent = sent_total,
                        received = received_total,
                        "request-count verification mismatch"
                    );
                }
            }
        }
        Ok(finalized)
    }

    /* ------------------- APPLY_MUTATIONS ------------------- */

    /// Drain the mutation buffer exactly once and resolve every touched
    /// partition, unioned with next-inbox message destinations.
    fn apply_mutations(&self) -> Result<()> {
        let drained = self.data.mutations().drain();
        let mut by_partition: HashMap<PartitionId, BTreeMap<G::Id, Changes<G>>> = HashMap::new();
        for (id, changes) in drained {
            by_partition
                .entry(self.processor.partition_for(&id))
                .or_default()
                .insert(id, changes);
        }
        for pid in self.processor.owned_partitions() {
            let changes = by_partition.remove(&pid).unwrap_or_default();
            let destinations = self.data.messages().next_destination_vertices(pid);
            if changes.is_empty() && destinations.is_empty() {
                continue;
            }
            if !self.data.partitions().has(pid) {
                // First mutation targeting this partition; give it a home.
                self.data.add_vertices(pid, Vec::new())?;
            }
            let Some(mut partition) = self.data.partitions().get(pid)? else { continue };
            self.resolver.resolve_partition(&mut *partition, changes, &destinations);
        }
        Ok(())
    }

    /* ------------------- checkpointing ------------------- */

    #[cfg(feature = "checkpointing")]
    fn write_checkpoint(&self, superstep: SuperstepNumber, global: &GlobalStats) {
        let result = (|| -> Result<()> {
            let mut blobs = Vec::new();
            for pid in self.data.partitions().partition_ids() {
                if let Some(partition) = self.data.partitions().get(pid)? {
                    let mut buf = Vec::new();
                    partition.write_to(&mut buf)?;
                    blobs.push(buf);
                }
            }
            let mut aggregators: Vec<(String, AggValue)> =
                self.data.aggregators().finalized_snapshot().into_iter().collect();
            aggregators.sort_by(|(a, _), (b, _)| a.cmp(b));
            let data = CheckpointData::<G> {
                superstep,
                partitions: blobs,
                inbox: self.data.messages().snapshot_current(),
                aggregators,
                total_vertices: global.total_vertices,
                total_edges: global.total_edges,
            };
            self.checkpoints.write(self.id, &data)
        })();
        if let Err(e) = result {
            // Non-fatal; the next due checkpoint retries.
            warn!(worker = self.id, superstep, error = %e, "checkpoint write failed");
        }
    }

    #[cfg(feature = "checkpointing")]
    fn restore_checkpoint(&self, superstep: SuperstepNumber) -> Result<GlobalStats> {
        let data = self.checkpoints.read::<G>(superstep, self.id)?;
        for blob in &data.partitions {
            let partition = read_partition::<G>(self.config.partition_layout, blob)?;
            self.data.partitions().add(partition)?;
        }
        self.data.messages().restore_current(data.inbox);
        self.data.aggregators().set_finalized(data.aggregators.into_iter().collect());
        Ok(GlobalStats {
            superstep: superstep - 1,
            total_vertices: data.total_vertices,
            active_vertices: data.total_vertices,
            total_edges: data.total_edges,
            ..Default::default()
        })
    }

    /* ------------------- TERMINATE / output ------------------- */

    /// Write this worker's partitions through the configured output format.
    fn write_output(&self) -> Result<()> {
        let Some(output) = &self.output else { return Ok(()) };
        let mut writer = output.writer(self.id)?;
        for pid in self.data.partitions().partition_ids() {
            let Some(partition) = self.data.partitions().get(pid)? else { continue };
            for id in partition.vertex_ids() {
                if let Some(vertex) = partition.get_vertex(&id) {
                    writer.write_vertex(&vertex)?;
                }
            }
        }
        writer.close()
    }
}

/// Round-robin partition assignment over the sorted worker list.
fn assign_partitions(
    partition_count: u32,
    addresses: &[(WorkerId, SocketAddr)],
) -> Vec<PartitionOwner> {
    (0..partition_count)
        .map(|partition| {
            let (worker, addr) = addresses[partition as usize % addresses.len()];
            PartitionOwner { partition, worker, addr }
        })
        .collect()
}

/// Deterministic aggregator-name-to-owner mapping.
fn owner_of_name(name: &str, num_workers: usize) -> WorkerId {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() % num_workers.max(1) as u64) as WorkerId
}
