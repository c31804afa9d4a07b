//! The coordination service boundary.
//!
//! The runtime treats cluster coordination as an opaque key-value store with
//! ephemeral nodes and watches -- the five operations of
//! [`CoordinationService`] are all it ever calls. Workers publish input-split
//! reservation nodes, barrier entries, aggregator blobs, and the
//! partition-ownership blob through it.
//!
//! [`LocalCoordination`] is the in-process implementation used by
//! single-process jobs and tests. A production deployment plugs in a real
//! service behind the same trait.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, WorkerError};
use crate::rpc::WorkerId;

/// Opaque key-value store with ephemeral nodes and watches.
pub trait CoordinationService: Send + Sync {
    /// Create or overwrite a persistent node.
    fn create_persistent(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create an ephemeral node. Returns `false` when the node already
    /// exists -- the first creator wins, which is what split reservation
    /// relies on.
    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<bool>;

    /// Read a node's payload.
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// All node paths directly or transitively under `prefix`, ascending.
    fn list_children(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a node (no-op when absent).
    fn delete(&self, path: &str) -> Result<()>;

    /// Block until anything in the store changes, or `timeout` elapses.
    /// Callers loop around this with their own predicate.
    fn watch(&self, timeout: Duration) -> Result<()>;
}

/* ===================== In-process implementation ===================== */

struct LocalState {
    nodes: BTreeMap<String, Vec<u8>>,
    version: u64,
}

/// In-process coordination backed by a mutex-protected map and a condvar.
pub struct LocalCoordination {
    state: Mutex<LocalState>,
    changed: Condvar,
}

impl LocalCoordination {
    /// Build an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LocalState { nodes: BTreeMap::new(), version: 0 }),
            changed: Condvar::new(),
        })
    }

    fn write(&self, path: &str, data: &[u8], exclusive: bool) -> bool {
        let mut state = self.state.lock();
        if exclusive && state.nodes.contains_key(path) {
            return false;
        }
        state.nodes.insert(path.to_string(), data.to_vec());
        state.version += 1;
        self.changed.notify_all();
        true
    }
}

impl CoordinationService for LocalCoordination {
    fn create_persistent(&self, path: &str, data: &[u8]) -> Result<()> {
        self.write(path, data, false);
        Ok(())
    }

    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<bool> {
        Ok(self.write(path, data, true))
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().nodes.get(path).cloned())
    }

    fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .nodes
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.nodes.remove(path).is_some() {
            state.version += 1;
            self.changed.notify_all();
        }
        Ok(())
    }

    fn watch(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let seen = state.version;
        while state.version == seen {
            if self.changed.wait_for(&mut state, timeout).timed_out() {
                return Err(WorkerError::CoordinationLost(format!(
                    "no change within {timeout:?}"
                )));
            }
        }
        Ok(())
    }
}

/* ===================== Barrier ===================== */

/// Global synchronization point built on the coordination service.
///
/// Each worker publishes its payload under the barrier prefix and blocks
/// until all `num_workers` entries exist, then reads every payload back.
pub struct BspBarrier {
    coordination: Arc<dyn CoordinationService>,
    num_workers: usize,
    timeout: Duration,
}

impl BspBarrier {
    /// Build a barrier over `coordination` for a job of `num_workers`.
    pub fn new(
        coordination: Arc<dyn CoordinationService>,
        num_workers: usize,
        timeout: Duration,
    ) -> Self {
        Self { coordination, num_workers, timeout }
    }

    /// Enter the barrier named by `prefix` and return every worker's
    /// payload, ascending by worker id.
    pub fn enter(&self, prefix: &str, worker: WorkerId, payload: &[u8]) -> Result<Vec<(WorkerId, Vec<u8>)>> {
        let path = format!("{prefix}/worker-{worker}");
        self.coordination.create_persistent(&path, payload)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let children = self.coordination.list_children(&format!("{prefix}/"))?;
            if children.len() >= self.num_workers {
                let mut entries = Vec::with_capacity(children.len());
                for child in children {
                    let id = child
                        .rsplit_once("worker-")
                        .and_then(|(_, id)| id.parse::<WorkerId>().ok())
                        .ok_or_else(|| {
                            WorkerError::CoordinationLost(format!("malformed barrier node {child}"))
                        })?;
                    let data = self.coordination.read(&child)?.unwrap_or_default();
                    entries.push((id, data));
                }
                entries.sort_by_key(|(id, _)| *id);
                return Ok(entries);
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| WorkerError::CoordinationLost(format!("barrier {prefix} timed out")))?;
            match self.coordination.watch(remaining.min(Duration::from_millis(500))) {
                Ok(()) => {}
                // A watch slice timing out is fine until the deadline passes.
                Err(WorkerError::CoordinationLost(_)) if Instant::now() < deadline => {}
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ephemeral_create_is_first_wins() {
        let coord = LocalCoordination::new();
        assert!(coord.create_ephemeral("/input/split-0/reserved", b"w0").unwrap());
        assert!(!coord.create_ephemeral("/input/split-0/reserved", b"w1").unwrap());
        assert_eq!(coord.read("/input/split-0/reserved").unwrap().unwrap(), b"w0");
    }

    #[test]
    fn barrier_releases_all_entrants_with_all_payloads() {
        let coord = LocalCoordination::new();
        let mut handles = Vec::new();
        for worker in 0..3u32 {
            let barrier = BspBarrier::new(coord.clone(), 3, Duration::from_secs(5));
            handles.push(thread::spawn(move || {
                barrier.enter("/barrier/superstep-0", worker, &[worker as u8]).unwrap()
            }));
        }
        for handle in handles {
            let entries = handle.join().unwrap();
            assert_eq!(entries.len(), 3);
            assert_eq!(entries[0].0, 0);
            assert_eq!(entries[2].1, vec![2]);
        }
    }

    #[test]
    fn watch_times_out_as_coordination_lost() {
        let coord = LocalCoordination::new();
        let err = coord.watch(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, WorkerError::CoordinationLost(_)));
    }
}
