//! Superstep bookkeeping: the controller's states, per-worker stats
//! published at the barrier, and their global reduction.

use serde::{Deserialize, Serialize};

use crate::rpc::WorkerId;

/// Globally synchronized iteration counter. The distinguished input
/// superstep loads the graph before computation begins.
pub type SuperstepNumber = i64;

/// The superstep in which input splits are read and vertices exchanged.
pub const INPUT_SUPERSTEP: SuperstepNumber = -1;

/// The states the per-worker superstep controller moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuperstepState {
    /// Address exchange, peer registration, ownership publication.
    Setup,
    /// Reserving and reading input splits.
    InputSplits,
    /// Routing loaded vertices to their owners.
    VertexExchange,
    /// Running the user program over owned partitions.
    Compute,
    /// Flushing batched requests and waiting for acknowledgements.
    FlushRequests,
    /// Waiting at the global barrier.
    Barrier,
    /// Draining the mutation buffer into partitions.
    ApplyMutations,
    /// Rolling the message inboxes.
    RollMessages,
    /// Owner-side aggregator merge and broadcast.
    FinalizeAggregators,
    /// Advancing the superstep counter.
    NextSuperstep,
    /// The job is done (all halted, no messages) or aborted.
    Terminate,
}

/// What one worker publishes when entering the barrier.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    /// The publishing worker.
    pub worker: WorkerId,
    /// Vertices this worker owns (or read, during the input superstep).
    pub total_vertices: u64,
    /// Owned vertices that are not halted after this superstep.
    pub active_vertices: u64,
    /// Edges across owned vertices.
    pub total_edges: u64,
    /// Messages produced during this superstep.
    pub messages_sent: u64,
    /// Data-plane requests sent during this superstep.
    pub requests_sent: u64,
    /// A fatal error that should abort the whole job.
    pub failed: Option<String>,
}

/// The reduction of every worker's stats at one barrier.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    /// The superstep these stats close.
    pub superstep: SuperstepNumber,
    /// Total vertices across workers.
    pub total_vertices: u64,
    /// Total active (non-halted) vertices across workers.
    pub active_vertices: u64,
    /// Total edges across workers.
    pub total_edges: u64,
    /// Messages produced across workers; in flight toward the next
    /// superstep.
    pub messages_sent: u64,
    /// Data-plane requests sent across workers.
    pub requests_sent: u64,
    /// The first fatal error any worker reported.
    pub failed: Option<String>,
}

impl GlobalStats {
    /// Reduce the per-worker stats published at a barrier.
    pub fn reduce(superstep: SuperstepNumber, stats: &[WorkerStats]) -> Self {
        let mut global = GlobalStats { superstep, ..Default::default() };
        for s in stats {
            global.total_vertices += s.total_vertices;
            global.active_vertices += s.active_vertices;
            global.total_edges += s.total_edges;
            global.messages_sent += s.messages_sent;
            global.requests_sent += s.requests_sent;
            if global.failed.is_none() {
                global.failed = s.failed.clone();
            }
        }
        global
    }

    /// The halting law: done once every vertex is halted and no message is
    /// in flight.
    pub fn all_done(&self) -> bool {
        self.active_vertices == 0 && self.messages_sent == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_sums_and_keeps_first_failure() {
        let stats = vec![
            WorkerStats { worker: 0, total_vertices: 3, active_vertices: 1, ..Default::default() },
            WorkerStats {
                worker: 1,
                total_vertices: 4,
                active_vertices: 0,
                failed: Some("boom".into()),
                ..Default::default()
            },
        ];
        let global = GlobalStats::reduce(2, &stats);
        assert_eq!(global.total_vertices, 7);
        assert_eq!(global.active_vertices, 1);
        assert_eq!(global.failed.as_deref(), Some("boom"));
        assert!(!global.all_done());
    }

    #[test]
    fn halting_needs_no_active_vertices_and_no_messages() {
        let mut global = GlobalStats::default();
        assert!(global.all_done());
        global.messages_sent = 1;
        assert!(!global.all_done());
    }
}
