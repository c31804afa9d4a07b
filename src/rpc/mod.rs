//! Worker-to-worker RPC: a connection-oriented framed protocol with request
//! batching, a bounded outstanding-request window, and at-most-once
//! application on the server side.
//!
//! - [`wire`] -- the frame layout and the typed payload encodings.
//! - [`client`] -- connection-pooled client with per-destination ordering,
//!   backpressure, and bounded retry.
//! - [`server`] -- accept loop dispatching to registered per-type handlers.

pub mod client;
pub mod server;
pub mod wire;

/// Identifies one worker process within a job.
pub type WorkerId = u32;

pub use client::{RequestTracker, RpcClient, RpcClientConfig};
pub use server::{HandlerRegistry, RequestHandler, RpcServer};
pub use wire::{Frame, RequestKind, RpcCodec};
