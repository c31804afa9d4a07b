//! Error kinds for the worker runtime.
//!
//! Network and disk errors inside the RPC layer are retried locally; every
//! other kind bubbles up to the superstep controller, which records the root
//! cause, signals peers through the coordination service, flushes logs, and
//! exits non-zero.

use crate::rpc::WorkerId;

/// The single error type threaded through the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A reader or peer produced a vertex or edge the runtime cannot accept
    /// (for example a vertex without an id).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A request payload or persisted blob could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Disk or network failure outside the RPC retry loop.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The user compute function failed. Fatal to the whole job; the
    /// offending vertex id is reported.
    #[error("compute failed for vertex {vertex}: {source}")]
    UserCompute {
        vertex: String,
        #[source]
        source: anyhow::Error,
    },

    /// Unknown request type, out-of-order frame, or a frame that does not
    /// match its declared length.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The coordination service stopped answering.
    #[error("coordination service lost: {0}")]
    CoordinationLost(String),

    /// A peer stayed unreachable after the bounded retry budget.
    #[error("worker {0} unreachable after retries")]
    PeerUnreachable(WorkerId),

    /// Checkpoint write or read failure. Writes are non-fatal and retried at
    /// the next checkpoint; a failed restore is fatal.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// The superstep was aborted by a supervisor error on this or another
    /// worker.
    #[error("job aborted: {0}")]
    Aborted(String),
}

/// Runtime-wide result alias.
pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

impl WorkerError {
    /// Whether the RPC layer may retry the operation locally before
    /// surfacing the error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, WorkerError::Io(_))
    }
}
