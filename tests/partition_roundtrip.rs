use irongraph::testing::SumGraph;
use irongraph::{ByteArrayPartition, Edge, Partition, PartitionLayout, Vertex, read_partition};

#[test]
fn byte_array_partition_round_trip() {
    // Seven edgeless vertices in partition 3.
    let mut original = ByteArrayPartition::<SumGraph>::new(3);
    for id in 1..=7u64 {
        original.put_vertex(Vertex::new(id, id as i64 * 10));
    }
    let mut bytes = Vec::new();
    original.write_to(&mut bytes).unwrap();

    let restored = read_partition::<SumGraph>(PartitionLayout::ByteArray, &bytes).unwrap();
    assert_eq!(restored.id(), 3);
    assert_eq!(restored.vertex_count(), 7);
    assert_eq!(restored.edge_count(), 0);
    for id in 1..=7u64 {
        assert_eq!(*restored.get_vertex(&id).unwrap().value(), id as i64 * 10);
    }
}

#[test]
fn round_trip_preserves_edges_values_and_halted() {
    let mut original = ByteArrayPartition::<SumGraph>::new(0);
    let mut a = Vertex::with_edges(1, -5, vec![Edge::new(2, 7), Edge::new(2, 8)]);
    a.vote_to_halt();
    original.put_vertex(a);
    original.put_vertex(Vertex::with_edges(2, 0, vec![Edge::new(1, 1)]));

    let mut bytes = Vec::new();
    original.write_to(&mut bytes).unwrap();
    // Cross-layout read: byte-array stream into a map partition.
    let restored = read_partition::<SumGraph>(PartitionLayout::Map, &bytes).unwrap();

    assert_eq!(restored.vertex_count(), 2);
    assert_eq!(restored.edge_count(), 3);
    let a = restored.get_vertex(&1).unwrap();
    assert!(a.is_halted());
    assert_eq!(a.edges()[0].target, 2);
    assert_eq!(a.edges()[1].value, 8);
    let b = restored.get_vertex(&2).unwrap();
    assert!(!b.is_halted());
    assert_eq!(*b.value(), 0);
}
