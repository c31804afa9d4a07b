//! Checkpointing: periodic snapshots of a worker's partitions,
//! next-superstep inbox, and aggregator values, suitable for restart.
//!
//! Every C supersteps (C = 0 disables) the worker writes
//! `superstep-<n>/worker-<id>.ckpt` under the configured root, where `n` is
//! the superstep the snapshot feeds. A SHA-256 checksum guards integrity.
//! Write failures are non-fatal -- logged and retried at the next
//! checkpoint; a failed restore aborts the job.

use std::fs::{File, create_dir_all};
use std::io::{Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::aggregators::AggValue;
use crate::codec;
use crate::error::{Result, WorkerError};
use crate::graph::GraphTypes;
use crate::messages::InboxSnapshot;
use crate::rpc::WorkerId;
use crate::superstep::SuperstepNumber;

/// Checkpoint behavior knobs.
#[derive(Clone, Debug)]
pub struct CheckpointOptions {
    /// Root directory for checkpoint files.
    pub directory: PathBuf,
    /// Checkpoint every this many supersteps; 0 disables.
    pub frequency: u32,
    /// Delete the checkpoint tree once the job succeeds.
    pub cleanup_after_success: bool,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./irongraph_checkpoints"),
            frequency: 0,
            cleanup_after_success: false,
        }
    }
}

/// One worker's serializable snapshot at a superstep boundary.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct CheckpointData<G: GraphTypes> {
    /// The superstep this snapshot feeds.
    pub superstep: SuperstepNumber,
    /// Serialized partitions (the shared partition stream layout).
    pub partitions: Vec<Vec<u8>>,
    /// The inbox the restarted superstep will read.
    pub inbox: InboxSnapshot<G>,
    /// Finalized aggregator values, name-sorted.
    pub aggregators: Vec<(String, AggValue)>,
    /// Global vertex count as of the snapshot.
    pub total_vertices: u64,
    /// Global edge count as of the snapshot.
    pub total_edges: u64,
}

/// Writes and restores checkpoint files.
pub struct CheckpointManager {
    options: CheckpointOptions,
}

impl CheckpointManager {
    /// Build a manager over `options`.
    pub fn new(options: CheckpointOptions) -> Self {
        Self { options }
    }

    /// Whether a snapshot should be written at the boundary feeding
    /// `superstep`.
    pub fn due(&self, superstep: SuperstepNumber) -> bool {
        self.options.frequency > 0
            && superstep > 0
            && superstep % i64::from(self.options.frequency) == 0
    }

    fn path(&self, superstep: SuperstepNumber, worker: WorkerId) -> PathBuf {
        self.options
            .directory
            .join(format!("superstep-{superstep}"))
            .join(format!("worker-{worker}.ckpt"))
    }

    /// Write one worker's snapshot. The file is checksum plus payload.
    pub fn write<G: GraphTypes>(
        &self,
        worker: WorkerId,
        data: &CheckpointData<G>,
    ) -> Result<()> {
        let path = self.path(data.superstep, worker);
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let payload = codec::encode(data)?;
        let checksum = Sha256::digest(&payload);
        let mut file = File::create(&path)?;
        file.write_all(&checksum)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        info!(superstep = data.superstep, worker, bytes = payload.len(), "checkpoint written");
        Ok(())
    }

    /// Restore one worker's snapshot for `superstep`.
    pub fn read<G: GraphTypes>(
        &self,
        superstep: SuperstepNumber,
        worker: WorkerId,
    ) -> Result<CheckpointData<G>> {
        let path = self.path(superstep, worker);
        let mut file = File::open(&path)
            .map_err(|e| WorkerError::Checkpoint(format!("open {}: {e}", path.display())))?;
        let mut stored = [0u8; 32];
        file.read_exact(&mut stored)
            .map_err(|e| WorkerError::Checkpoint(format!("short checkpoint header: {e}")))?;
        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        let checksum = Sha256::digest(&payload);
        if checksum.as_slice() != stored.as_slice() {
            return Err(WorkerError::Checkpoint(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        let data: CheckpointData<G> = codec::decode(&payload)
            .map_err(|e| WorkerError::Checkpoint(format!("decode {}: {e}", path.display())))?;
        if data.superstep != superstep {
            return Err(WorkerError::Checkpoint(format!(
                "checkpoint labeled superstep {} read as {superstep}",
                data.superstep
            )));
        }
        Ok(data)
    }

    /// Remove the whole checkpoint tree (successful-job cleanup).
    pub fn cleanup(&self) -> Result<()> {
        if self.options.cleanup_after_success && self.options.directory.exists() {
            std::fs::remove_dir_all(&self.options.directory)?;
        }
        Ok(())
    }
}
