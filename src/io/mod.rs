//! I/O layer - child process ownership and raw byte transport
//!
//! This layer knows nothing about message framing or JSON-RPC; it moves
//! opaque bytes between the client and a child process's standard streams.

pub mod process;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use process::{ProcessState, ProcessTransport, SpawnError, SpawnOptions};

/// Receiving end of the stdout chunk stream.
///
/// Chunks arrive in read order; the channel closing means the stream hit
/// EOF (process exited or closed its stdout), not "no data yet".
pub type ChunkReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Errors produced by transport write operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is offline")]
    Offline,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-level transport to a language server.
///
/// [`ProcessTransport`] is the production implementation; tests use
/// [`MockTransport`](crate::testing::MockTransport).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one fully framed message and flush it immediately
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Hand out the inbound chunk stream; yields `Some` exactly once
    fn take_reader(&mut self) -> Option<ChunkReceiver>;

    /// Non-blocking liveness check
    fn is_running(&self) -> bool;

    /// Stop the transport and release its resources; idempotent
    fn terminate(&mut self);
}
