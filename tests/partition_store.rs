use irongraph::store::{InMemoryPartitionStore, OutOfCorePartitionStore, PartitionStore};
use irongraph::testing::SumGraph;
use irongraph::{MapPartition, Partition, PartitionLayout, Vertex};

fn partition(id: u32, vertex_ids: &[u64]) -> Box<dyn Partition<SumGraph>> {
    let mut p = MapPartition::new(id);
    for v in vertex_ids {
        p.put_vertex(Vertex::new(*v, *v as i64));
    }
    Box::new(p)
}

fn exercise_contract(store: &dyn PartitionStore<SumGraph>) {
    // Adds with duplicate partition ids merge.
    store.add(partition(1, &[1, 2])).unwrap();
    store.add(partition(2, &[3])).unwrap();
    store.add(partition(2, &[4])).unwrap();
    store.add(partition(3, &[5])).unwrap();
    store.add(partition(1, &[6])).unwrap();
    store.add(partition(4, &[7])).unwrap();

    assert_eq!(store.count(), 4);
    assert_eq!(store.get(1).unwrap().unwrap().vertex_count(), 3);
    assert_eq!(store.get(2).unwrap().unwrap().vertex_count(), 2);
    assert_eq!(store.get(3).unwrap().unwrap().vertex_count(), 1);
    assert_eq!(store.get(4).unwrap().unwrap().vertex_count(), 1);

    // Every held id answers `has` and `get` consistently.
    for id in store.partition_ids() {
        assert!(store.has(id));
        assert_eq!(store.get(id).unwrap().unwrap().id(), id);
    }

    // Remove detaches; the caller owns the partition.
    let removed = store.remove(3).unwrap().unwrap();
    assert_eq!(removed.id(), 3);
    assert_eq!(removed.vertex_count(), 1);
    assert!(!store.has(3));
    assert!(store.get(3).unwrap().is_none());
    assert_eq!(store.count(), 3);

    // Delete discards.
    store.delete(2).unwrap();
    assert_eq!(store.count(), 2);
    assert_eq!(store.partition_ids(), vec![1, 4]);
}

#[test]
fn resident_store_contract() {
    let store = InMemoryPartitionStore::<SumGraph>::new();
    exercise_contract(&store);
}

#[test]
fn out_of_core_store_same_contract() {
    let dir = tempfile::tempdir().unwrap();
    // Cap of one resident partition forces constant spilling.
    let store =
        OutOfCorePartitionStore::<SumGraph>::new(PartitionLayout::Map, dir.path(), 1).unwrap();
    exercise_contract(&store);
    assert!(store.spill_count() > 0);
}

#[test]
fn out_of_core_concurrent_gets_deduplicate_loads() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(
        OutOfCorePartitionStore::<SumGraph>::new(PartitionLayout::Map, dir.path(), 1).unwrap(),
    );
    store.add(partition(0, &[1, 2, 3])).unwrap();
    store.add(partition(1, &[4])).unwrap(); // evicts 0

    let loads_before = store.load_count();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = std::sync::Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            let p = store.get(0).unwrap().unwrap();
            assert_eq!(p.vertex_count(), 3);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    // The four gets raced, but partition 0 was read from disk exactly once.
    assert_eq!(store.load_count() - loads_before, 1);
}
