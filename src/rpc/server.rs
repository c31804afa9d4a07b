//! RPC server: accepts peer connections, deduplicates requests, and
//! dispatches each to the handler registered for its type.
//!
//! Handlers execute against the worker's server data (partition store,
//! message store, mutation buffer, aggregator state) and must synchronize
//! internally on the partition or vertex they touch; the server itself runs
//! them concurrently across connections.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::rpc::WorkerId;
use crate::rpc::wire::{Frame, RequestKind, RpcCodec};

/// A handler for one request type. Implementations decode the payload with
/// the typed `wire` decoders and apply it to the worker's server data.
pub trait RequestHandler: Send + Sync {
    /// Apply one request. Called at most once per `(source, request id)`.
    fn handle(&self, source: WorkerId, payload: &[u8]) -> Result<()>;
}

/// Registered handlers, one per request type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<RequestKind, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `kind`, replacing any previous binding.
    pub fn register(&mut self, kind: RequestKind, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Dispatch one request to its handler.
    pub fn dispatch(&self, kind: RequestKind, source: WorkerId, payload: &[u8]) -> Result<()> {
        match self.handlers.get(&kind) {
            Some(handler) => handler.handle(source, payload),
            None => Err(WorkerError::ProtocolViolation(format!("no handler for {kind:?}"))),
        }
    }
}

/// The per-worker RPC server.
pub struct RpcServer {
    local_addr: SocketAddr,
    received: Arc<AtomicU64>,
    fatal: Arc<Mutex<Option<String>>>,
    seen: Arc<Mutex<HashMap<WorkerId, HashSet<u64>>>>,
    shutdown: Arc<Notify>,
}

impl RpcServer {
    /// Bind `addr` and spawn the accept loop on `handle`. Incoming requests
    /// dispatch through `registry`; acks are stamped with `server_id`.
    pub fn spawn(
        handle: &tokio::runtime::Handle,
        addr: SocketAddr,
        server_id: WorkerId,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        let listener = handle.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;
        let server = Self {
            local_addr,
            received: Arc::new(AtomicU64::new(0)),
            fatal: Arc::new(Mutex::new(None)),
            seen: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(Notify::new()),
        };
        let received = Arc::clone(&server.received);
        let fatal = Arc::clone(&server.fatal);
        let seen = Arc::clone(&server.seen);
        let shutdown = Arc::clone(&server.shutdown);
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted worker connection");
                            tokio::spawn(serve_connection(
                                stream,
                                server_id,
                                Arc::clone(&registry),
                                Arc::clone(&received),
                                Arc::clone(&fatal),
                                Arc::clone(&seen),
                            ));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                }
            }
        });
        Ok(server)
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Distinct requests applied since the last reset.
    pub fn take_received_count(&self) -> u64 {
        self.received.swap(0, Ordering::Relaxed)
    }

    /// A fatal handler or protocol error recorded by a connection task.
    pub fn take_fatal(&self) -> Option<String> {
        self.fatal.lock().take()
    }

    /// Forget seen request ids. Called at superstep boundaries, once no
    /// request from the previous superstep can be retransmitted.
    pub fn reset_dedup(&self) {
        self.seen.lock().clear();
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

async fn serve_connection(
    stream: TcpStream,
    server_id: WorkerId,
    registry: Arc<HandlerRegistry>,
    received: Arc<AtomicU64>,
    fatal: Arc<Mutex<Option<String>>>,
    seen: Arc<Mutex<HashMap<WorkerId, HashSet<u64>>>>,
) {
    let mut framed = Framed::new(stream, RpcCodec);
    while let Some(next) = framed.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed frames are fatal; plain I/O errors just drop the
                // connection and let the client reconnect.
                if matches!(e, WorkerError::ProtocolViolation(_) | WorkerError::Deserialization(_)) {
                    record_fatal(&fatal, &e);
                } else {
                    debug!(error = %e, "connection error");
                }
                return;
            }
        };
        if frame.kind == RequestKind::Ack {
            warn!(source = frame.source, "server received an ack frame; ignoring");
            continue;
        }
        let fresh = seen.lock().entry(frame.source).or_default().insert(frame.request_id);
        if fresh {
            received.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = registry.dispatch(frame.kind, frame.source, &frame.payload) {
                warn!(kind = ?frame.kind, source = frame.source, error = %e, "request handler failed");
                record_fatal(&fatal, &e);
            }
        } else {
            debug!(source = frame.source, request = frame.request_id, "duplicate request discarded");
        }
        // Duplicates are re-acked: the original ack may have been lost.
        if framed.send(Frame::ack(server_id, frame.request_id)).await.is_err() {
            return;
        }
    }
}

fn record_fatal(fatal: &Mutex<Option<String>>, error: &WorkerError) {
    let mut slot = fatal.lock();
    if slot.is_none() {
        *slot = Some(error.to_string());
    }
}
