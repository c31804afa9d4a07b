//! The wire format.
//!
//! Every frame is: unsigned 4-byte payload-inclusive length, 1-byte type
//! tag, 8-byte request id, 4-byte source worker id, then the type-specific
//! payload. Request ids are monotonic per client; the server deduplicates on
//! `(source worker, request id)`.
//!
//! Payload layouts use 4-byte count prefixes and length-prefixed value
//! bytes throughout, so a payload can be walked without knowing the graph
//! types; the typed `encode_*`/`decode_*` pairs below are the only producers
//! and consumers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::aggregators::{AggValue, REQUEST_COUNT_AGGREGATOR};
use crate::codec;
use crate::error::{Result, WorkerError};
use crate::graph::{Edge, GraphTypes, Vertex};
use crate::mutations::Changes;
use crate::partition::{PartitionId, read_vertex, write_vertex};
use crate::rpc::WorkerId;

/// Fixed request types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    /// A batch of vertices for one partition (input loading, rebalancing).
    SendVertices = 1,
    /// Messages grouped by destination partition and vertex.
    SendWorkerMessages = 2,
    /// Buffered changesets for one partition.
    SendPartitionMutations = 3,
    /// Aggregator partials shipped to the owning worker at barrier time.
    SendAggregators = 4,
    /// Single add-edge request.
    AddEdge = 5,
    /// Single remove-edge request.
    RemoveEdge = 6,
    /// Single add-vertex request.
    AddVertex = 7,
    /// Single remove-vertex request.
    RemoveVertex = 8,
    /// Control: flush batched state on the receiver.
    Flush = 9,
    /// Control: acknowledgement of one request id.
    Ack = 10,
}

impl RequestKind {
    /// Parse a wire tag.
    pub fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Self::SendVertices,
            2 => Self::SendWorkerMessages,
            3 => Self::SendPartitionMutations,
            4 => Self::SendAggregators,
            5 => Self::AddEdge,
            6 => Self::RemoveEdge,
            7 => Self::AddVertex,
            8 => Self::RemoveVertex,
            9 => Self::Flush,
            10 => Self::Ack,
            other => {
                return Err(WorkerError::ProtocolViolation(format!("unknown request type {other}")));
            }
        })
    }
}

/// One framed request or acknowledgement.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Request type tag.
    pub kind: RequestKind,
    /// Monotonic per sending client.
    pub request_id: u64,
    /// The sending worker.
    pub source: WorkerId,
    /// Type-specific payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// The acknowledgement for `request_id`, sent by `source`.
    pub fn ack(source: WorkerId, request_id: u64) -> Self {
        Self { kind: RequestKind::Ack, request_id, source, payload: Bytes::new() }
    }
}

/// Header bytes after the length prefix: tag + request id + source.
const FRAME_HEADER: usize = 1 + 8 + 4;

/// Frames larger than this are rejected as protocol violations.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length-delimited frame codec for [`Frame`].
#[derive(Default)]
pub struct RpcCodec;

impl Decoder for RpcCodec {
    type Item = Frame;
    type Error = WorkerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < FRAME_HEADER || len > MAX_FRAME_LEN {
            return Err(WorkerError::ProtocolViolation(format!("bad frame length {len}")));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(len);
        let kind = RequestKind::from_u8(frame.get_u8())?;
        let request_id = frame.get_u64();
        let source = frame.get_u32();
        Ok(Some(Frame { kind, request_id, source, payload: frame.freeze() }))
    }
}

impl Encoder<Frame> for RpcCodec {
    type Error = WorkerError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = FRAME_HEADER + frame.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(WorkerError::ProtocolViolation(format!("frame too large: {len}")));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u8(frame.kind as u8);
        dst.put_u64(frame.request_id);
        dst.put_u32(frame.source);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/* ===================== send-vertices ===================== */

/// partition-id, vertex-count, then each vertex in the shared layout.
pub fn encode_send_vertices<G: GraphTypes>(
    partition: PartitionId,
    vertices: &[Vertex<G>],
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(partition);
    buf.put_u32(vertices.len() as u32);
    for vertex in vertices {
        write_vertex::<G, _>(&mut buf, vertex)?;
    }
    Ok(buf.freeze())
}

/// Decode a send-vertices payload.
pub fn decode_send_vertices<G: GraphTypes>(payload: &[u8]) -> Result<(PartitionId, Vec<Vertex<G>>)> {
    let mut buf = payload;
    let partition = read_partition_id(&mut buf)?;
    let count = codec::get_count(&mut buf)?;
    let mut vertices = Vec::with_capacity(count);
    for _ in 0..count {
        vertices.push(read_vertex::<G, _>(&mut buf)?);
    }
    expect_consumed(buf, "send-vertices")?;
    Ok((partition, vertices))
}

/* ===================== send-worker-messages ===================== */

/// list of (partition-id, list of (vertex-id, list of message bytes)).
pub fn encode_worker_messages<G: GraphTypes>(
    batches: &[(PartitionId, Vec<(G::Id, Vec<G::Message>)>)],
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(batches.len() as u32);
    for (partition, entries) in batches {
        buf.put_u32(*partition);
        buf.put_u32(entries.len() as u32);
        for (vertex, messages) in entries {
            codec::put_value(&mut buf, vertex)?;
            buf.put_u32(messages.len() as u32);
            for message in messages {
                codec::put_value(&mut buf, message)?;
            }
        }
    }
    Ok(buf.freeze())
}

/// Decode a send-worker-messages payload.
#[allow(clippy::type_complexity)]
pub fn decode_worker_messages<G: GraphTypes>(
    payload: &[u8],
) -> Result<Vec<(PartitionId, Vec<(G::Id, Vec<G::Message>)>)>> {
    let mut buf = payload;
    let partition_count = codec::get_count(&mut buf)?;
    let mut batches = Vec::with_capacity(partition_count);
    for _ in 0..partition_count {
        let partition = read_partition_id(&mut buf)?;
        let vertex_count = codec::get_count(&mut buf)?;
        let mut entries = Vec::with_capacity(vertex_count);
        for _ in 0..vertex_count {
            let vertex: G::Id = codec::get_value(&mut buf)?;
            let message_count = codec::get_count(&mut buf)?;
            let mut messages = Vec::with_capacity(message_count);
            for _ in 0..message_count {
                messages.push(codec::get_value::<G::Message, _>(&mut buf)?);
            }
            entries.push((vertex, messages));
        }
        batches.push((partition, entries));
    }
    expect_consumed(buf, "send-worker-messages")?;
    Ok(batches)
}

/* ===================== send-partition-mutations ===================== */

/// partition-id then list of (vertex-id, changeset).
pub fn encode_partition_mutations<G: GraphTypes>(
    partition: PartitionId,
    entries: &[(G::Id, Changes<G>)],
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(partition);
    buf.put_u32(entries.len() as u32);
    for (vertex, changes) in entries {
        codec::put_value(&mut buf, vertex)?;
        codec::put_value(&mut buf, changes)?;
    }
    Ok(buf.freeze())
}

/// Decode a send-partition-mutations payload.
#[allow(clippy::type_complexity)]
pub fn decode_partition_mutations<G: GraphTypes>(
    payload: &[u8],
) -> Result<(PartitionId, Vec<(G::Id, Changes<G>)>)> {
    let mut buf = payload;
    let partition = read_partition_id(&mut buf)?;
    let count = codec::get_count(&mut buf)?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let vertex: G::Id = codec::get_value(&mut buf)?;
        let changes: Changes<G> = codec::get_value(&mut buf)?;
        entries.push((vertex, changes));
    }
    expect_consumed(buf, "send-partition-mutations")?;
    Ok((partition, entries))
}

/* ===================== send-aggregators ===================== */

/// 4-byte count, then per aggregator: UTF name, UTF kind identifier, value
/// bytes. The reserved `"<COUNT>"` entry carries a raw 64-bit request count.
pub fn encode_aggregators(
    entries: &[(String, String, AggValue)],
    request_count: u64,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(entries.len() as u32 + 1);
    for (name, kind, value) in entries {
        codec::put_utf(&mut buf, name);
        codec::put_utf(&mut buf, kind);
        codec::put_bytes(&mut buf, &codec::encode(value)?);
    }
    codec::put_utf(&mut buf, REQUEST_COUNT_AGGREGATOR);
    codec::put_utf(&mut buf, "u64-sum");
    codec::put_bytes(&mut buf, &request_count.to_be_bytes());
    Ok(buf.freeze())
}

/// Decode a send-aggregators payload into (named partials, request count).
pub fn decode_aggregators(payload: &[u8]) -> Result<(Vec<(String, String, AggValue)>, u64)> {
    let mut buf = payload;
    let count = codec::get_count(&mut buf)?;
    let mut entries = Vec::with_capacity(count.saturating_sub(1));
    let mut request_count = 0u64;
    for _ in 0..count {
        let name = codec::get_utf(&mut buf)?;
        let kind = codec::get_utf(&mut buf)?;
        let value_bytes = codec::get_bytes(&mut buf)?;
        if name == REQUEST_COUNT_AGGREGATOR {
            let raw: [u8; 8] = value_bytes.as_slice().try_into().map_err(|_| {
                WorkerError::Deserialization("request-count entry is not 8 bytes".into())
            })?;
            request_count = u64::from_be_bytes(raw);
        } else {
            entries.push((name, kind, codec::decode::<AggValue>(&value_bytes)?));
        }
    }
    expect_consumed(buf, "send-aggregators")?;
    Ok((entries, request_count))
}

/* ===================== single mutation requests ===================== */

/// partition-id, source vertex id, edge.
pub fn encode_add_edge<G: GraphTypes>(
    partition: PartitionId,
    source: &G::Id,
    edge: &Edge<G>,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(partition);
    codec::put_value(&mut buf, source)?;
    codec::put_value(&mut buf, &edge.target)?;
    codec::put_value(&mut buf, &edge.value)?;
    Ok(buf.freeze())
}

/// Decode an add-edge payload.
pub fn decode_add_edge<G: GraphTypes>(payload: &[u8]) -> Result<(PartitionId, G::Id, Edge<G>)> {
    let mut buf = payload;
    let partition = read_partition_id(&mut buf)?;
    let source: G::Id = codec::get_value(&mut buf)?;
    let target: G::Id = codec::get_value(&mut buf)?;
    let value: G::Edge = codec::get_value(&mut buf)?;
    expect_consumed(buf, "add-edge")?;
    Ok((partition, source, Edge::new(target, value)))
}

/// partition-id, source vertex id, target vertex id.
pub fn encode_remove_edge<G: GraphTypes>(
    partition: PartitionId,
    source: &G::Id,
    target: &G::Id,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(partition);
    codec::put_value(&mut buf, source)?;
    codec::put_value(&mut buf, target)?;
    Ok(buf.freeze())
}

/// Decode a remove-edge payload.
pub fn decode_remove_edge<G: GraphTypes>(payload: &[u8]) -> Result<(PartitionId, G::Id, G::Id)> {
    let mut buf = payload;
    let partition = read_partition_id(&mut buf)?;
    let source: G::Id = codec::get_value(&mut buf)?;
    let target: G::Id = codec::get_value(&mut buf)?;
    expect_consumed(buf, "remove-edge")?;
    Ok((partition, source, target))
}

/// partition-id then the vertex in the shared layout.
pub fn encode_add_vertex<G: GraphTypes>(partition: PartitionId, vertex: &Vertex<G>) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(partition);
    write_vertex::<G, _>(&mut buf, vertex)?;
    Ok(buf.freeze())
}

/// Decode an add-vertex payload.
pub fn decode_add_vertex<G: GraphTypes>(payload: &[u8]) -> Result<(PartitionId, Vertex<G>)> {
    let mut buf = payload;
    let partition = read_partition_id(&mut buf)?;
    let vertex = read_vertex::<G, _>(&mut buf)?;
    expect_consumed(buf, "add-vertex")?;
    Ok((partition, vertex))
}

/// partition-id, vertex id.
pub fn encode_remove_vertex<G: GraphTypes>(partition: PartitionId, id: &G::Id) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(partition);
    codec::put_value(&mut buf, id)?;
    Ok(buf.freeze())
}

/// Decode a remove-vertex payload.
pub fn decode_remove_vertex<G: GraphTypes>(payload: &[u8]) -> Result<(PartitionId, G::Id)> {
    let mut buf = payload;
    let partition = read_partition_id(&mut buf)?;
    let id: G::Id = codec::get_value(&mut buf)?;
    expect_consumed(buf, "remove-vertex")?;
    Ok((partition, id))
}

fn read_partition_id(buf: &mut &[u8]) -> Result<PartitionId> {
    if buf.remaining() < 4 {
        return Err(WorkerError::Deserialization("missing partition id".into()));
    }
    Ok(buf.get_u32())
}

fn expect_consumed(buf: &[u8], what: &str) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::Deserialization(format!("{what}: {} trailing bytes", buf.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SumGraph;

    #[test]
    fn frame_codec_round_trip() {
        let mut codec = RpcCodec;
        let frame = Frame {
            kind: RequestKind::SendWorkerMessages,
            request_id: 99,
            source: 3,
            payload: Bytes::from_static(b"abc"),
        };
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        // Length prefix covers tag + id + source + payload.
        assert_eq!(&buf[..4], &(16u32).to_be_bytes());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, RequestKind::SendWorkerMessages);
        assert_eq!(decoded.request_id, 99);
        assert_eq!(decoded.source, 3);
        assert_eq!(&decoded.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = RpcCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        let mut codec = RpcCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(200);
        buf.put_u64(1);
        buf.put_u32(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WorkerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn worker_messages_round_trip() {
        let batches: Vec<(PartitionId, Vec<(u64, Vec<i64>)>)> =
            vec![(2, vec![(1, vec![5, 6]), (4, vec![7])]), (9, vec![(3, vec![])])];
        let payload = encode_worker_messages::<SumGraph>(&batches).unwrap();
        let decoded = decode_worker_messages::<SumGraph>(&payload).unwrap();
        assert_eq!(decoded, batches);
    }

    #[test]
    fn aggregator_payload_carries_the_count() {
        let entries = vec![(
            "sum".to_string(),
            "i64-sum".to_string(),
            AggValue::I64(41),
        )];
        let payload = encode_aggregators(&entries, 1234).unwrap();
        let (decoded, count) = decode_aggregators(&payload).unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(count, 1234);
    }
}
