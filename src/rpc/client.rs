//! Connection-pooled RPC client.
//!
//! One task per destination worker owns that peer's TCP connection, so a
//! worker's requests to a single peer reach its handler in send order.
//! Three guarantees the superstep machinery leans on:
//!
//! - **Backpressure.** A bounded per-destination window of unacknowledged
//!   requests; `send_request` blocks while the window is full.
//! - **Prompt enqueue / blocking flush.** `send_request` returns as soon as
//!   the frame is queued; [`RpcClient::wait_all`] blocks until every
//!   enqueued request has been acknowledged.
//! - **Bounded retry.** Connection failures and ack timeouts reconnect with
//!   exponential backoff and retransmit pending frames under their original
//!   request ids (the server discards duplicates). After the attempt budget
//!   the destination is marked unreachable and the whole client fails fast.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::rpc::WorkerId;
use crate::rpc::wire::{Frame, RequestKind, RpcCodec};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Client tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct RpcClientConfig {
    /// Maximum unacknowledged requests per destination.
    pub max_outstanding_per_peer: usize,
    /// Connection / ack-timeout attempts before a destination is declared
    /// unreachable.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,
    /// How long to wait for an ack before forcing a reconnect.
    pub request_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            max_outstanding_per_peer: 128,
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/* ===================== outstanding-request tracking ===================== */

struct TrackerState {
    outstanding: u64,
    sent: u64,
    failed: Option<String>,
}

/// Counts enqueued-but-unacknowledged requests across all destinations.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    done: Condvar,
}

impl RequestTracker {
    fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState { outstanding: 0, sent: 0, failed: None }),
            done: Condvar::new(),
        }
    }

    fn begin(&self) {
        let mut state = self.state.lock();
        state.outstanding += 1;
        state.sent += 1;
    }

    fn complete(&self) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.done.notify_all();
        }
    }

    fn fail(&self, reason: String) {
        let mut state = self.state.lock();
        if state.failed.is_none() {
            state.failed = Some(reason);
        }
        self.done.notify_all();
    }

    /// Block until every enqueued request has been acknowledged, or a
    /// destination became unreachable.
    pub fn wait_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.failed {
                return Err(WorkerError::Aborted(reason.clone()));
            }
            if state.outstanding == 0 {
                return Ok(());
            }
            self.done.wait(&mut state);
        }
    }

    /// Detach the requests-sent count (read once per superstep for the
    /// flow-control aggregator).
    pub fn take_sent(&self) -> u64 {
        let mut state = self.state.lock();
        std::mem::take(&mut state.sent)
    }
}

/* ===================== per-peer window ===================== */

struct Window {
    state: Mutex<WindowState>,
    freed: Condvar,
    cap: usize,
}

struct WindowState {
    in_flight: usize,
    poisoned: bool,
}

impl Window {
    fn new(cap: usize) -> Self {
        Self {
            state: Mutex::new(WindowState { in_flight: 0, poisoned: false }),
            freed: Condvar::new(),
            cap: cap.max(1),
        }
    }

    /// Block until an outstanding-request slot frees up.
    fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.poisoned {
                return Err(WorkerError::Aborted("peer connection failed".into()));
            }
            if state.in_flight < self.cap {
                state.in_flight += 1;
                return Ok(());
            }
            self.freed.wait(&mut state);
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.freed.notify_one();
    }

    fn poison(&self) {
        self.state.lock().poisoned = true;
        self.freed.notify_all();
    }
}

/* ===================== client ===================== */

struct Peer {
    tx: mpsc::UnboundedSender<Frame>,
    window: Arc<Window>,
}

/// Connection-pooled client for a worker's outgoing requests.
pub struct RpcClient {
    source: WorkerId,
    handle: tokio::runtime::Handle,
    config: RpcClientConfig,
    tracker: Arc<RequestTracker>,
    next_request_id: AtomicU64,
    peers: RwLock<HashMap<WorkerId, Peer>>,
}

impl RpcClient {
    /// Build a client sending as `source`, spawning I/O tasks on `handle`.
    pub fn new(source: WorkerId, handle: tokio::runtime::Handle, config: RpcClientConfig) -> Self {
        Self {
            source,
            handle,
            config,
            tracker: Arc::new(RequestTracker::new()),
            next_request_id: AtomicU64::new(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a destination worker, spawning its connection task. Calling
    /// again for a known worker is a no-op.
    pub fn register_peer(&self, worker: WorkerId, addr: SocketAddr) {
        let mut peers = self.peers.write();
        if peers.contains_key(&worker) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let window = Arc::new(Window::new(self.config.max_outstanding_per_peer));
        peers.insert(worker, Peer { tx, window: Arc::clone(&window) });
        let tracker = Arc::clone(&self.tracker);
        let config = self.config;
        self.handle.spawn(run_peer(worker, addr, rx, window, tracker, config));
    }

    /// Enqueue a request to `dest` and return its request id. Blocks only
    /// when the destination's outstanding-request window is full.
    pub fn send_request(&self, dest: WorkerId, kind: RequestKind, payload: Bytes) -> Result<u64> {
        let (tx, window) = {
            let peers = self.peers.read();
            let peer = peers.get(&dest).ok_or_else(|| {
                WorkerError::ProtocolViolation(format!("no registered peer {dest}"))
            })?;
            (peer.tx.clone(), Arc::clone(&peer.window))
        };
        window.acquire()?;
        self.tracker.begin();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame { kind, request_id, source: self.source, payload };
        if tx.send(frame).is_err() {
            return Err(WorkerError::PeerUnreachable(dest));
        }
        Ok(request_id)
    }

    /// Block until every enqueued request has been acknowledged.
    pub fn wait_all(&self) -> Result<()> {
        self.tracker.wait_all()
    }

    /// Requests sent since the last call (flow-control verification).
    pub fn take_sent_count(&self) -> u64 {
        self.tracker.take_sent()
    }

    /// Drop all peer connections. Pending requests must already be
    /// acknowledged (`wait_all`).
    pub fn close(&self) {
        self.peers.write().clear();
    }
}

/// One destination's connection loop: sends queued frames in order, matches
/// acks, reconnects with backoff, retransmits pending frames after a
/// reconnect under their original ids.
async fn run_peer(
    peer: WorkerId,
    addr: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    window: Arc<Window>,
    tracker: Arc<RequestTracker>,
    config: RpcClientConfig,
) {
    let mut pending: BTreeMap<u64, Frame> = BTreeMap::new();
    let mut closed = false;
    let mut attempts: u32 = 0;
    let mut backoff = config.base_backoff;

    'connect: loop {
        if closed && pending.is_empty() {
            return;
        }
        macro_rules! retry_or_give_up {
            ($context:expr) => {{
                attempts += 1;
                if attempts >= config.max_attempts {
                    warn!(peer, context = %$context, attempts, "destination unreachable");
                    tracker.fail(format!("worker {peer} unreachable ({})", $context));
                    window.poison();
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue 'connect;
            }};
        }

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => retry_or_give_up!(format!("connect: {e}")),
        };
        let mut framed = Framed::new(stream, RpcCodec);

        // Retransmit anything unacknowledged, in request-id order; the
        // server discards ids it has already applied.
        for frame in pending.values() {
            if let Err(e) = framed.send(frame.clone()).await {
                retry_or_give_up!(format!("retransmit: {e}"));
            }
        }

        loop {
            tokio::select! {
                queued = rx.recv(), if !closed => match queued {
                    Some(frame) => {
                        pending.insert(frame.request_id, frame.clone());
                        if let Err(e) = framed.send(frame).await {
                            retry_or_give_up!(format!("send: {e}"));
                        }
                    }
                    None => {
                        closed = true;
                        if pending.is_empty() {
                            return;
                        }
                    }
                },
                incoming = framed.next() => match incoming {
                    Some(Ok(frame)) if frame.kind == RequestKind::Ack => {
                        if pending.remove(&frame.request_id).is_some() {
                            attempts = 0;
                            backoff = config.base_backoff;
                            window.release();
                            tracker.complete();
                            if closed && pending.is_empty() {
                                return;
                            }
                        } else {
                            debug!(peer, request = frame.request_id, "ack for unknown request");
                        }
                    }
                    Some(Ok(frame)) => {
                        warn!(peer, kind = ?frame.kind, "unexpected non-ack frame from server");
                    }
                    Some(Err(e)) => retry_or_give_up!(format!("recv: {e}")),
                    None => retry_or_give_up!("connection closed".to_string()),
                },
                _ = tokio::time::sleep(config.request_timeout), if !pending.is_empty() => {
                    // No ack in a full timeout window; reconnect and retransmit.
                    retry_or_give_up!("ack timeout".to_string());
                }
            }
        }
    }
}
