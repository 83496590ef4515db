//! Framed TCP transport.
//!
//! The primary transport: length-prefixed frames straight over a
//! `TcpStream`. Each connection owns its accumulating read buffer, so the
//! streaming decoder needs no locking.

use async_trait::async_trait;
use banter_protocol::{codec, Frame};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::traits::{Connection, FrameSink, FrameSource, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
    /// Whether to set TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7600".parse().expect("valid default bind addr"),
            max_frame_size: 64 * 1024, // 64 KB
            nodelay: true,
        }
    }
}

/// Framed TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("TCP transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new TCP transport with default config on the given address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(TcpConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
            }
        }

        debug!("Accepted TCP connection from {}", addr);

        Ok(Box::new(TcpConnection {
            stream,
            remote_addr: addr,
            max_frame_size: self.config.max_frame_size,
        }))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// A framed TCP connection.
pub struct TcpConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    max_frame_size: usize,
}

impl Connection for TcpConnection {
    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (read, write) = self.stream.into_split();
        (
            Box::new(TcpFrameSource {
                read,
                buffer: BytesMut::with_capacity(4096),
                max_frame_size: self.max_frame_size,
            }),
            Box::new(TcpFrameSink { write }),
        )
    }
}

/// Reader half of a framed TCP connection.
pub struct TcpFrameSource {
    read: OwnedReadHalf,
    buffer: BytesMut,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            // Enforce the configured limit as soon as the length prefix
            // arrives, before buffering the body.
            if let Some(length) = codec::peek_frame_length(&self.buffer) {
                if length > self.max_frame_size {
                    return Err(TransportError::Protocol(
                        banter_protocol::ProtocolError::FrameTooLarge(length),
                    ));
                }
            }

            if let Some(frame) = codec::decode_from(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let n = self
                .read
                .read_buf(&mut self.buffer)
                .await
                .map_err(TransportError::Io)?;
            if n == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::ReceiveFailed(
                        "connection closed mid-frame".to_string(),
                    ))
                };
            }
        }
    }
}

/// Writer half of a framed TCP connection.
pub struct TcpFrameSink {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.write
            .write_all(&data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.write
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.write.shutdown().await.map_err(TransportError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_protocol::Scope;

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.bind_addr.port(), 7600);
        assert_eq!(config.max_frame_size, 64 * 1024);
        assert!(config.nodelay);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_loopback() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let frame = Frame::chat("alice", Scope::room("lobby"), b"over tcp".to_vec(), 1, 0);
            let encoded = codec::encode(&frame).unwrap();
            // Two writes to exercise the partial-read path
            stream.write_all(&encoded[..3]).await.unwrap();
            stream.flush().await.unwrap();
            stream.write_all(&encoded[3..]).await.unwrap();

            // Read one frame back
            let mut buf = BytesMut::new();
            loop {
                if let Some(frame) = codec::decode_from(&mut buf).unwrap() {
                    break frame;
                }
                stream.read_buf(&mut buf).await.unwrap();
            }
        });

        let conn = transport.accept().await.unwrap();
        let (mut source, mut sink) = conn.split();

        let received = source.recv().await.unwrap().unwrap();
        match &received {
            Frame::Chat { sender, .. } => assert_eq!(sender, "alice"),
            other => panic!("expected chat, got {:?}", other),
        }

        sink.send(&Frame::ack(1)).await.unwrap();
        let echoed = client.await.unwrap();
        assert_eq!(echoed, Frame::ack(1));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_buffering() {
        let transport = TcpTransport::new(TcpConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_frame_size: 64,
            nodelay: true,
        })
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // Length prefix claiming a 1 MiB body; body never sent.
            stream.write_all(&(1_048_576u32).to_be_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            stream
        });

        let conn = transport.accept().await.unwrap();
        let (mut source, _sink) = conn.split();

        match source.recv().await {
            Err(TransportError::Protocol(
                banter_protocol::ProtocolError::FrameTooLarge(n),
            )) => assert_eq!(n, 1_048_576),
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drop(stream);
        });

        let conn = transport.accept().await.unwrap();
        let (mut source, _sink) = conn.split();
        assert!(source.recv().await.unwrap().is_none());
        client.await.unwrap();
    }
}
