//! Request handling: the typed payloads applied through the handler
//! registry, and the client/server pair over real sockets.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use irongraph::aggregators::AggregatorService;
use irongraph::rpc::wire::{self, Frame};
use irongraph::testing::SumGraph;
use irongraph::worker::{ServerData, build_handlers};
use irongraph::{
    Changes, Edge, InMemoryPartitionStore, MessageStore, MutationBuffer, PartitionLayout,
    RequestKind, RpcClient, RpcClientConfig, RpcServer, Vertex,
};
use tokio_util::codec::Framed;

fn server_data() -> Arc<ServerData<SumGraph>> {
    Arc::new(ServerData::new(
        Arc::new(InMemoryPartitionStore::new()),
        Arc::new(MessageStore::new(None)),
        Arc::new(MutationBuffer::new()),
        Arc::new(AggregatorService::new(Vec::new())),
        PartitionLayout::Map,
    ))
}

#[test]
fn send_worker_messages_request() {
    let data = server_data();
    let registry = build_handlers(Arc::clone(&data));

    // Vertex i receives messages {0, .., i-1}.
    let entries: Vec<(u64, Vec<i64>)> =
        (1..=6u64).map(|i| (i, (0..i as i64).collect())).collect();
    let payload = wire::encode_worker_messages::<SumGraph>(&[(0, entries)]).unwrap();
    registry.dispatch(RequestKind::SendWorkerMessages, 1, &payload).unwrap();

    data.messages().swap();
    let destinations = data.messages().destination_vertices(0);
    assert_eq!(destinations.iter().sum::<u64>(), 21);
    let total: i64 = destinations
        .iter()
        .map(|v| data.messages().take_messages(0, v).into_iter().sum::<i64>())
        .sum();
    assert_eq!(total, 35);
}

#[test]
fn send_partition_mutations_request() {
    let data = server_data();
    let registry = build_handlers(Arc::clone(&data));

    let entries: Vec<(u64, Changes<SumGraph>)> = (0..=10u64)
        .map(|id| {
            (
                id,
                Changes {
                    added_vertices: (0..3).map(|v| Vertex::new(id, v)).collect(),
                    removed_vertex_count: 2,
                    added_edges: (0..5).map(|e| Edge::new(id + 1, e * 2)).collect(),
                    removed_edges: vec![99; 7],
                },
            )
        })
        .collect();
    let payload = wire::encode_partition_mutations::<SumGraph>(7, &entries).unwrap();
    registry.dispatch(RequestKind::SendPartitionMutations, 1, &payload).unwrap();

    let drained = data.mutations().drain();
    assert_eq!(drained.keys().sum::<u64>(), 55);
    for (_, changes) in drained {
        assert_eq!(changes.added_vertices.iter().map(|v| *v.value()).sum::<i64>(), 3);
        assert_eq!(changes.removed_vertex_count, 2);
        assert_eq!(changes.added_edges.iter().map(|e| e.value).sum::<i64>(), 20);
        assert_eq!(changes.removed_edges.len(), 7);
    }
}

#[test]
fn single_mutation_requests_buffer_changesets() {
    let data = server_data();
    let registry = build_handlers(Arc::clone(&data));

    let add_vertex = wire::encode_add_vertex::<SumGraph>(0, &Vertex::new(5, 50)).unwrap();
    registry.dispatch(RequestKind::AddVertex, 2, &add_vertex).unwrap();
    let add_edge = wire::encode_add_edge::<SumGraph>(0, &5, &Edge::new(6, 1)).unwrap();
    registry.dispatch(RequestKind::AddEdge, 2, &add_edge).unwrap();
    let remove_edge = wire::encode_remove_edge::<SumGraph>(0, &5, &7).unwrap();
    registry.dispatch(RequestKind::RemoveEdge, 2, &remove_edge).unwrap();
    let remove_vertex = wire::encode_remove_vertex::<SumGraph>(0, &9).unwrap();
    registry.dispatch(RequestKind::RemoveVertex, 2, &remove_vertex).unwrap();

    let drained = data.mutations().drain();
    let five = &drained[&5];
    assert_eq!(five.added_vertices.len(), 1);
    assert_eq!(five.added_edges.len(), 1);
    assert_eq!(five.removed_edges, vec![7]);
    assert_eq!(drained[&9].removed_vertex_count, 1);
}

#[test]
fn client_delivers_in_order_over_tcp() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let data = server_data();
    let server = RpcServer::spawn(
        runtime.handle(),
        "127.0.0.1:0".parse().unwrap(),
        1,
        Arc::new(build_handlers(Arc::clone(&data))),
    )
    .unwrap();

    let client = RpcClient::new(0, runtime.handle().clone(), RpcClientConfig::default());
    client.register_peer(1, server.local_addr());

    // One request per message, all to the same vertex; FIFO delivery means
    // the uncombined store sees them in send order.
    for m in 0..50i64 {
        let payload =
            wire::encode_worker_messages::<SumGraph>(&[(0, vec![(1, vec![m])])]).unwrap();
        client.send_request(1, RequestKind::SendWorkerMessages, payload).unwrap();
    }
    client.wait_all().unwrap();

    data.messages().swap();
    let got = data.messages().take_messages(0, &1);
    assert_eq!(got, (0..50).collect::<Vec<i64>>());
    client.close();
    server.stop();
}

#[test]
fn server_discards_duplicate_request_ids() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let data = server_data();
    let server = RpcServer::spawn(
        runtime.handle(),
        "127.0.0.1:0".parse().unwrap(),
        1,
        Arc::new(build_handlers(Arc::clone(&data))),
    )
    .unwrap();
    let addr = server.local_addr();

    runtime.block_on(async move {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, irongraph::rpc::RpcCodec);
        let payload =
            wire::encode_worker_messages::<SumGraph>(&[(0, vec![(1, vec![42])])]).unwrap();
        let frame = Frame {
            kind: RequestKind::SendWorkerMessages,
            request_id: 7,
            source: 3,
            payload,
        };
        // A retry reuses the request id; the second application must be
        // discarded but still acknowledged.
        framed.send(frame.clone()).await.unwrap();
        framed.send(frame).await.unwrap();
        let first = framed.next().await.unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap();
        assert_eq!(first.kind, RequestKind::Ack);
        assert_eq!(first.request_id, 7);
        assert_eq!(second.kind, RequestKind::Ack);
        assert_eq!(second.request_id, 7);
    });

    data.messages().swap();
    assert_eq!(data.messages().take_messages(0, &1), vec![42]);
    assert_eq!(data.take_data_requests_received(), 1);
    server.stop();
}
