//! WebSocket transport.
//!
//! Carries banter frames in WebSocket binary messages using
//! tokio-tungstenite. One WebSocket message may hold a partial frame or
//! several frames; the accumulating buffer reassembles them.

use async_trait::async_trait;
use banter_protocol::{codec, Frame};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::traits::{Connection, FrameSink, FrameSource, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7601".parse().expect("valid default bind addr"),
            max_frame_size: 64 * 1024, // 64 KB
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("WebSocket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config on the given
    /// address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!("Accepted TCP connection from {}", addr);

        let ws_stream = accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {}", e))
        })?;

        debug!("WebSocket handshake completed with {}", addr);

        Ok(Box::new(WebSocketConnection {
            stream: ws_stream,
            remote_addr: addr,
            max_frame_size: self.config.max_frame_size,
        }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
    max_frame_size: usize,
}

impl Connection for WebSocketConnection {
    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WsFrameSource {
                stream,
                buffer: BytesMut::with_capacity(4096),
                max_frame_size: self.max_frame_size,
            }),
            Box::new(WsFrameSink { sink }),
        )
    }
}

/// Reader half of a WebSocket connection.
pub struct WsFrameSource {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    buffer: BytesMut,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = codec::decode_from(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_frame_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_frame_size
                        );
                        return Err(TransportError::Protocol(
                            banter_protocol::ProtocolError::FrameTooLarge(data.len()),
                        ));
                    }
                    self.buffer.extend_from_slice(&data);
                }
                Some(Ok(Message::Text(text))) => {
                    // For compatibility, treat text as binary
                    self.buffer.extend_from_slice(text.as_bytes());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // tungstenite queues the pong reply internally
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frame, ignore
                }
                Some(Err(WsError::ConnectionClosed)) => {
                    debug!("Connection closed");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Writer half of a WebSocket connection.
pub struct WsFrameSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_protocol::Scope;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.bind_addr.port(), 7601);
        assert_eq!(config.max_frame_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_websocket() {
        let transport = WebSocketTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
            let frame = Frame::chat("alice", Scope::room("lobby"), b"over ws".to_vec(), 1, 0);
            let encoded = codec::encode(&frame).unwrap();
            ws.send(Message::Binary(encoded.to_vec())).await.unwrap();

            // Read one frame back
            loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Binary(data) => {
                        let mut buf = BytesMut::from(&data[..]);
                        break codec::decode_from(&mut buf).unwrap().unwrap();
                    }
                    _ => continue,
                }
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
}
