//! # banter-transport
//!
//! Connection transports for the banter chat server.
//!
//! This crate provides a unified interface over the ways a client can
//! reach the server:
//!
//! - **Framed TCP** - length-prefixed frames straight over a `TcpStream`
//! - **WebSocket** - frames carried in WebSocket binary messages
//!
//! All transports implement the [`Transport`] and [`Connection`] traits.
//! A connection splits into an independent [`FrameSource`] and
//! [`FrameSink`], one for the session's reader task and one for its
//! writer task.
//!
//! ```rust,ignore
//! use banter_transport::{Transport, Connection};
//!
//! async fn accept_one(transport: &dyn Transport) {
//!     let conn = transport.accept().await.unwrap();
//!     let (mut source, mut sink) = conn.split();
//!     while let Ok(Some(frame)) = source.recv().await {
//!         // hand the frame to the pipeline
//!     }
//! }
//! ```

pub mod tcp;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use tcp::{TcpConfig, TcpTransport};
pub use traits::{Connection, FrameSink, FrameSource, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
