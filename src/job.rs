//! The in-process job driver.
//!
//! [`GraphJob`] spawns one [`Worker`] thread per configured worker, all
//! sharing a coordination service, and runs the job to completion. This is
//! the harness integration tests and single-machine jobs use; a distributed
//! deployment runs one worker per process against a shared coordination
//! service instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tracing::info;

use crate::aggregators::AggValue;
use crate::config::EngineConfig;
use crate::coordination::CoordinationService;
use crate::error::{Result, WorkerError};
use crate::formats::{EdgeInputFormat, VertexInputFormat, VertexOutputFormat};
use crate::graph::GraphTypes;
use crate::program::VertexProgram;
use crate::rpc::WorkerId;
use crate::superstep::{GlobalStats, SuperstepNumber};
use crate::worker::Worker;

/// What a completed job reports.
#[derive(Clone, Debug)]
pub struct JobResult {
    /// Compute supersteps executed.
    pub supersteps: SuperstepNumber,
    /// Finalized aggregator values after the last superstep.
    pub aggregators: HashMap<String, AggValue>,
    /// Global stats from the final barrier.
    pub stats: GlobalStats,
}

/// A configured job: program, formats, and engine configuration.
pub struct GraphJob<G: GraphTypes> {
    /// Engine configuration shared by every worker.
    pub config: EngineConfig<G>,
    /// The vertex program.
    pub program: Arc<dyn VertexProgram<G>>,
    /// Vertex input, if the graph is loaded from vertices.
    pub vertex_input: Option<Arc<dyn VertexInputFormat<G>>>,
    /// Edge input, if edges arrive separately.
    pub edge_input: Option<Arc<dyn EdgeInputFormat<G>>>,
    /// Output sink for the final graph.
    pub output: Option<Arc<dyn VertexOutputFormat<G>>>,
}

impl<G: GraphTypes> GraphJob<G> {
    /// Run the job over `coordination`, one worker thread per configured
    /// worker. The first worker error aborts the job.
    pub fn run(&self, coordination: Arc<dyn CoordinationService>) -> Result<JobResult> {
        let num_workers = self.config.num_workers;
        info!(num_workers, partitions = self.config.partition_count, "starting job");

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers as WorkerId {
            workers.push(Worker::new(
                id,
                self.config.clone(),
                Arc::clone(&self.program),
                self.vertex_input.clone(),
                self.edge_input.clone(),
                self.output.clone(),
                Arc::clone(&coordination),
            )?);
        }

        let mut handles = Vec::with_capacity(num_workers);
        for worker in workers {
            let handle = thread::Builder::new()
                .name(format!("worker-{}", handles.len()))
                .spawn(move || worker.run())
                .map_err(WorkerError::Io)?;
            handles.push(handle);
        }

        let mut coordinator_outcome = None;
        let mut first_error: Option<WorkerError> = None;
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(outcome)) => {
                    if id == 0 {
                        coordinator_outcome = Some(outcome);
                    }
                }
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(WorkerError::Aborted(format!("worker {id} panicked")));
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        let outcome = coordinator_outcome
            .ok_or_else(|| WorkerError::Aborted("coordinator produced no outcome".into()))?;
        info!(supersteps = outcome.supersteps, "job finished");
        Ok(JobResult {
            supersteps: outcome.supersteps,
            aggregators: outcome.aggregators,
            stats: outcome.stats,
        })
    }
}
