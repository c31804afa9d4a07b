//! Partition stores: resident and out-of-core.
//!
//! Both variants share one contract ([`PartitionStore`]):
//!
//! - `add` merges when a partition with the same id already exists; vertex id
//!   conflicts inside the merge are last-write-wins.
//! - `get` hands out a live reference ([`PartitionRef`]); concurrent gets on
//!   the same id are serialized by a per-id mutex.
//! - `remove` detaches and returns the partition, `delete` discards it.
//! - `count` reflects exactly the ids added and not yet removed or deleted.
//!
//! The out-of-core variant keeps at most K partitions resident and evicts the
//! least-recently-used one to a stable `partition-<id>.bin` file. Eviction
//! happens inside the same critical section as the insertion or load that
//! pushed residency over the cap, and concurrent gets on a non-resident
//! partition deduplicate to exactly one disk load.

use std::collections::HashMap;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use tracing::{debug, warn};

use crate::error::Result;
use crate::graph::GraphTypes;
use crate::partition::{Partition, PartitionId, PartitionLayout, read_partition};

/// Per-id slot. `partition` is `None` while the partition lives on disk.
struct SlotState<G: GraphTypes> {
    partition: Option<Box<dyn Partition<G>>>,
}

type Slot<G> = Arc<Mutex<SlotState<G>>>;

/// A live, exclusively locked reference to one partition.
///
/// Holding the ref pins the partition: it cannot be evicted or handed to
/// another caller until the ref is dropped.
pub struct PartitionRef<G: GraphTypes> {
    guard: ArcMutexGuard<RawMutex, SlotState<G>>,
}

impl<G: GraphTypes> Deref for PartitionRef<G> {
    type Target = dyn Partition<G>;

    fn deref(&self) -> &Self::Target {
        self.guard.partition.as_deref().expect("ref only built while resident")
    }
}

impl<G: GraphTypes> DerefMut for PartitionRef<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.partition.as_deref_mut().expect("ref only built while resident")
    }
}

/// The store contract shared by the resident and out-of-core variants.
pub trait PartitionStore<G: GraphTypes>: Send + Sync {
    /// Insert a partition, merging into an existing one with the same id.
    fn add(&self, partition: Box<dyn Partition<G>>) -> Result<()>;

    /// Fetch a live reference, loading from disk if necessary.
    fn get(&self, id: PartitionId) -> Result<Option<PartitionRef<G>>>;

    /// Detach and return the partition; the caller takes ownership.
    fn remove(&self, id: PartitionId) -> Result<Option<Box<dyn Partition<G>>>>;

    /// Discard the partition and any on-disk state.
    fn delete(&self, id: PartitionId) -> Result<()>;

    /// Whether the store currently holds `id` (resident or spilled).
    fn has(&self, id: PartitionId) -> bool;

    /// All held partition ids, ascending. Stable within a superstep.
    fn partition_ids(&self) -> Vec<PartitionId>;

    /// Number of partitions held.
    fn count(&self) -> usize;
}

/* ===================== Resident store ===================== */

/// All partitions in memory; per-id locking for `get`/`add` composition.
pub struct InMemoryPartitionStore<G: GraphTypes> {
    slots: RwLock<HashMap<PartitionId, Slot<G>>>,
}

impl<G: GraphTypes> InMemoryPartitionStore<G> {
    /// Build an empty resident store.
    pub fn new() -> Self {
        Self { slots: RwLock::new(HashMap::new()) }
    }
}

impl<G: GraphTypes> Default for InMemoryPartitionStore<G> {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_into<G: GraphTypes>(existing: &mut dyn Partition<G>, mut incoming: Box<dyn Partition<G>>) {
    for vertex in incoming.drain() {
        existing.put_vertex(vertex);
    }
}

impl<G: GraphTypes> PartitionStore<G> for InMemoryPartitionStore<G> {
    fn add(&self, partition: Box<dyn Partition<G>>) -> Result<()> {
        let id = partition.id();
        let slot = {
            let mut slots = self.slots.write();
            Arc::clone(
                slots
                    .entry(id)
                    .or_insert_with(|| Arc::new(Mutex::new(SlotState { partition: None }))),
            )
        };
        let mut state = slot.lock();
        match state.partition.as_deref_mut() {
            Some(existing) => merge_into(existing, partition),
            None => state.partition = Some(partition),
        }
        Ok(())
    }

    fn get(&self, id: PartitionId) -> Result<Option<PartitionRef<G>>> {
        let slot = match self.slots.read().get(&id) {
            Some(slot) => Arc::clone(slot),
            None => return Ok(None),
        };
        let guard = slot.lock_arc();
        if guard.partition.is_none() {
            // Concurrently removed.
            return Ok(None);
        }
        Ok(Some(PartitionRef { guard }))
    }

    fn remove(&self, id: PartitionId) -> Result<Option<Box<dyn Partition<G>>>> {
        let slot = match self.slots.write().remove(&id) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let mut state = slot.lock();
        Ok(state.partition.take())
    }

    fn delete(&self, id: PartitionId) -> Result<()> {
        self.remove(id)?;
        Ok(())
    }

    fn has(&self, id: PartitionId) -> bool {
        self.slots.read().contains_key(&id)
    }

    fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.slots.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn count(&self) -> usize {
        self.slots.read().len()
    }
}

/* ===================== Out-of-core store ===================== */

struct OocState<G: GraphTypes> {
    slots: HashMap<PartitionId, Slot<G>>,
    /// Least-recently-used at the front, most-recently-used at the back.
    lru: Vec<PartitionId>,
    resident: usize,
}

/// Disk-backed store holding at most `max_resident` partitions in memory.
pub struct OutOfCorePartitionStore<G: GraphTypes> {
    layout: PartitionLayout,
    directory: PathBuf,
    max_resident: usize,
    inner: Mutex<OocState<G>>,
    spills: AtomicU64,
    loads: AtomicU64,
}

impl<G: GraphTypes> OutOfCorePartitionStore<G> {
    /// Build a store spilling into `directory`, keeping at most
    /// `max_resident` partitions in memory (clamped to at least 1).
    pub fn new(layout: PartitionLayout, directory: impl Into<PathBuf>, max_resident: usize) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            layout,
            directory,
            max_resident: max_resident.max(1),
            inner: Mutex::new(OocState { slots: HashMap::new(), lru: Vec::new(), resident: 0 }),
            spills: AtomicU64::new(0),
            loads: AtomicU64::new(0),
        })
    }

    /// Number of partitions evicted to disk so far.
    pub fn spill_count(&self) -> u64 {
        self.spills.load(Ordering::Relaxed)
    }

    /// Number of partitions loaded back from disk so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    fn spill_path(directory: &Path, id: PartitionId) -> PathBuf {
        directory.join(format!("partition-{id}.bin"))
    }

    fn touch(state: &mut OocState<G>, id: PartitionId) {
        state.lru.retain(|p| *p != id);
        state.lru.push(id);
    }

    /// Load `id` from its spill file into the slot. Caller holds `inner`.
    fn load_locked(&self, state: &mut OocState<G>, id: PartitionId) -> Result<()> {
        let slot = Arc::clone(state.slots.get(&id).expect("caller checked presence"));
        let path = Self::spill_path(&self.directory, id);
        let bytes = fs::read(&path)?;
        let partition = read_partition::<G>(self.layout, &bytes)?;
        // State is None, so no PartitionRef is outstanding; only other
        // loaders can contend here, and they release before retaking `inner`.
        slot.lock().partition = Some(partition);
        state.resident += 1;
        state.lru.retain(|p| *p != id);
        state.lru.push(id);
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(partition = id, "loaded partition from disk");
        Ok(())
    }

    /// Evict least-recently-used resident partitions until the cap holds.
    /// Runs inside the critical section of the insertion that triggered it.
    fn evict_locked(&self, state: &mut OocState<G>, keep: PartitionId) -> Result<()> {
        while state.resident > self.max_resident {
            let mut victim: Option<(PartitionId, Box<dyn Partition<G>>)> = None;
            for id in state.lru.iter().copied() {
                if id == keep {
                    continue;
                }
                let Some(slot) = state.slots.get(&id) else { continue };
                // A failed try_lock means a live ref pins the partition.
                let Some(mut guard) = slot.try_lock() else { continue };
                if let Some(partition) = guard.partition.take() {
                    victim = Some((id, partition));
                    break;
                }
            }
            let Some((id, partition)) = victim else {
                // Everything else is pinned by live references; run over cap
                // until one is released.
                warn!(resident = state.resident, cap = self.max_resident, "no evictable partition");
                return Ok(());
            };
            let mut bytes = Vec::new();
            partition.write_to(&mut bytes)?;
            fs::write(Self::spill_path(&self.directory, id), &bytes)?;
            state.resident -= 1;
            state.lru.retain(|p| *p != id);
            self.spills.fetch_add(1, Ordering::Relaxed);
            debug!(partition = id, bytes = bytes.len(), "spilled partition");
        }
        Ok(())
    }

    /// Make `id` resident and return its slot. Caller must not hold any slot
    /// lock. Returns `None` when the id is unknown.
    fn ensure_resident(&self, id: PartitionId) -> Result<Option<Slot<G>>> {
        let mut state = self.inner.lock();
        let Some(slot) = state.slots.get(&id).map(Arc::clone) else {
            return Ok(None);
        };
        let resident = {
            match slot.try_lock() {
                Some(guard) => guard.partition.is_some(),
                // Locked by a live ref, so necessarily resident.
                None => true,
            }
        };
        if !resident {
            self.load_locked(&mut state, id)?;
            self.evict_locked(&mut state, id)?;
        } else {
            Self::touch(&mut state, id);
        }
        Ok(Some(slot))
    }
}

impl<G: GraphTypes> PartitionStore<G> for OutOfCorePartitionStore<G> {
    fn add(&self, partition: Box<dyn Partition<G>>) -> Result<()> {
        let id = partition.id();
        let existing = {
            let mut state = self.inner.lock();
            if state.slots.contains_key(&id) {
                true
            } else {
                state
                    .slots
                    .insert(id, Arc::new(Mutex::new(SlotState { partition: Some(partition) })));
                state.resident += 1;
                Self::touch(&mut state, id);
                self.evict_locked(&mut state, id)?;
                return Ok(());
            }
        };
        debug_assert!(existing);
        // Merge path: make the partition resident, then fold vertices in.
        loop {
            let Some(slot) = self.ensure_resident(id)? else {
                // Deleted concurrently; treat the add as a fresh insert.
                return self.add(partition);
            };
            let mut guard = slot.lock();
            if guard.partition.is_none() {
                drop(guard);
                continue;
            }
            let existing = guard.partition.as_deref_mut().expect("checked above");
            merge_into(existing, partition);
            return Ok(());
        }
    }

    fn get(&self, id: PartitionId) -> Result<Option<PartitionRef<G>>> {
        loop {
            let Some(slot) = self.ensure_resident(id)? else {
                return Ok(None);
            };
            let guard = slot.lock_arc();
            if guard.partition.is_some() {
                return Ok(Some(PartitionRef { guard }));
            }
            // Evicted between `ensure_resident` and the lock; retry. The
            // guard is dropped before `inner` is retaken.
        }
    }

    fn remove(&self, id: PartitionId) -> Result<Option<Box<dyn Partition<G>>>> {
        let slot = {
            let mut state = self.inner.lock();
            let Some(slot) = state.slots.remove(&id) else {
                return Ok(None);
            };
            state.lru.retain(|p| *p != id);
            slot
        };
        let mut guard = slot.lock();
        let path = Self::spill_path(&self.directory, id);
        let partition = match guard.partition.take() {
            Some(partition) => {
                self.inner.lock().resident -= 1;
                partition
            }
            None => {
                let bytes = fs::read(&path)?;
                read_partition::<G>(self.layout, &bytes)?
            }
        };
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(Some(partition))
    }

    fn delete(&self, id: PartitionId) -> Result<()> {
        let slot = {
            let mut state = self.inner.lock();
            let Some(slot) = state.slots.remove(&id) else {
                return Ok(());
            };
            state.lru.retain(|p| *p != id);
            slot
        };
        if slot.lock().partition.take().is_some() {
            self.inner.lock().resident -= 1;
        }
        let path = Self::spill_path(&self.directory, id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn has(&self, id: PartitionId) -> bool {
        self.inner.lock().slots.contains_key(&id)
    }

    fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.inner.lock().slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}
