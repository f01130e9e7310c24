//! Duplex transport seam
//!
//! The harness only needs four primitives from a connection: open, send a
//! text frame, receive the next text frame, close. [`Transport`] opens a
//! connection scoped by a target key and hands back its two halves so the
//! send path and the receive loop can be driven from different tasks.

mod websocket;

use async_trait::async_trait;
use thiserror::Error;

pub use websocket::WsTransport;

/// Errors raised by the transport primitives
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Recv(String),

    #[error("Connection closed")]
    Closed,
}

/// Write half of an open connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Initiate a graceful close. Calling it twice may return an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of an open connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame, or `None` once the peer has closed the connection
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}

/// An established connection, split into its halves
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Opens connections against the server under test
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection scoped by `target_key`. Timeouts are applied by the caller.
    async fn open(&self, target_key: &str) -> Result<Connection, TransportError>;
}
