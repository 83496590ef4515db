//! Transport abstraction traits.
//!
//! These traits define the interface that all transport implementations
//! must provide, allowing the acceptor to be transport-agnostic.

use async_trait::async_trait;
use banter_protocol::Frame;
use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] banter_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can accept connections.
///
/// Transports own the listening socket and handle the underlying protocol
/// (raw TCP framing, WebSocket), presenting a uniform interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "tcp", "websocket").
    fn name(&self) -> &'static str;

    /// Get the local address this transport is bound to.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// An accepted connection, not yet split into its task halves.
pub trait Connection: Send {
    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String>;

    /// Split into independently owned reader and writer halves.
    ///
    /// The halves are handed to the session's reader and writer tasks;
    /// neither half is ever touched by any other task.
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}

/// The receiving half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the connection closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// The sending half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Encode and send a frame.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Send pre-encoded frame bytes.
    ///
    /// The delivery path encodes each fan-out once; this avoids
    /// re-encoding per recipient.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}
