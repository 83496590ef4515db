//! Connection acceptor and per-connection task wiring.
//!
//! The acceptor owns the listening sockets. Each accepted connection gets a
//! session registered in the Connecting state, a handshake (CONNECT ->
//! authenticate -> CONNECTED), then two tasks: a reader that decodes,
//! validates, rate-limits and publishes frames to the session's ingress
//! shard, and a writer that drains the session's egress ring to the
//! socket. Teardown runs exactly once on whichever event ends the reader
//! loop: clean close, socket error, idle timeout, or the ring being closed
//! by the slow-consumer policy.

use crate::auth::Authenticator;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MetricsObserver};
use crate::rate::RateLimiter;
use anyhow::{Context, Result};
use banter_core::{
    dispatch, EventRing, InboundEvent, IngressShards, Outbound, RoutingEngine, SessionId,
    SessionRegistry, SessionState,
};
use banter_protocol::{code, validate, Frame, PROTOCOL_VERSION, WIRE_VERSION};
use banter_transport::{Connection, FrameSink, FrameSource, TcpConfig, TcpTransport, Transport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct ServerState {
    /// The session registry.
    pub registry: Arc<SessionRegistry>,
    /// The routing engine.
    pub router: Arc<RoutingEngine>,
    /// Ingress ring shards, one per processing worker.
    pub ingress: IngressShards,
    /// Server configuration.
    pub config: Config,
    /// Injected authentication seam.
    pub authenticator: Arc<dyn Authenticator>,
}

impl ServerState {
    /// Create server state from configuration.
    #[must_use]
    pub fn new(config: Config, authenticator: Arc<dyn Authenticator>) -> Self {
        let registry = Arc::new(SessionRegistry::with_config(config.registry_config()));
        let router = Arc::new(RoutingEngine::with_config(
            Arc::clone(&registry),
            config.routing_config(),
            Arc::new(MetricsObserver),
        ));
        let ingress = IngressShards::new(config.worker_count(), config.limits.ingress_capacity);

        Self {
            registry,
            router,
            ingress,
            config,
            authenticator,
        }
    }
}

/// A bound server, ready to serve.
pub struct Server {
    state: Arc<ServerState>,
    transports: Vec<Box<dyn Transport>>,
}

impl Server {
    /// Bind the configured listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if no transport is enabled or a bind fails;
    /// startup errors are the only fatal ones.
    pub async fn bind(config: Config, authenticator: Arc<dyn Authenticator>) -> Result<Self> {
        let mut transports: Vec<Box<dyn Transport>> = Vec::new();

        if config.transport.tcp {
            let tcp = TcpTransport::new(TcpConfig {
                bind_addr: config.bind_addr()?,
                max_frame_size: config.limits.max_frame_size,
                nodelay: true,
            })
            .await
            .context("Failed to bind TCP listener")?;
            transports.push(Box::new(tcp));
        }

        #[cfg(feature = "websocket")]
        if config.transport.websocket {
            let ws = banter_transport::WebSocketTransport::new(banter_transport::WebSocketConfig {
                bind_addr: config.websocket_bind_addr()?,
                max_frame_size: config.limits.max_frame_size,
            })
            .await
            .context("Failed to bind WebSocket listener")?;
            transports.push(Box::new(ws));
        }

        if transports.is_empty() {
            anyhow::bail!("No transport enabled");
        }

        let state = Arc::new(ServerState::new(config, authenticator));
        Ok(Self { state, transports })
    }

    /// Local address of the framed TCP listener, if enabled.
    #[must_use]
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.transports
            .iter()
            .find(|t| t.name() == "tcp")
            .and_then(|t| t.local_addr())
    }

    /// Run the server: processing workers plus one accept loop per
    /// transport. Returns when an accept loop fails fatally.
    ///
    /// # Errors
    ///
    /// Returns the first accept-loop failure.
    pub async fn serve(self) -> Result<()> {
        let state = self.state;

        // Processing worker pool, one worker per ingress shard.
        for (index, shard) in state.ingress.shards().iter().enumerate() {
            tokio::spawn(dispatch::run_worker(
                index,
                Arc::clone(&state.router),
                Arc::clone(shard),
            ));
        }
        info!(workers = state.ingress.len(), "Processing workers started");

        let mut accept_loops = JoinSet::new();
        for transport in self.transports {
            let state = Arc::clone(&state);
            info!(
                transport = transport.name(),
                addr = ?transport.local_addr(),
                "Accepting connections"
            );
            accept_loops.spawn(accept_loop(state, transport));
        }

        while let Some(result) = accept_loops.join_next().await {
            result.context("Accept loop panicked")?;
        }
        Ok(())
    }
}

/// Run the server until an accept loop fails.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn run_server(config: Config, authenticator: Arc<dyn Authenticator>) -> Result<()> {
    let server = Server::bind(config, authenticator).await?;
    server.serve().await
}

/// One transport's accept loop.
async fn accept_loop(state: Arc<ServerState>, transport: Box<dyn Transport>) {
    loop {
        match transport.accept().await {
            Ok(conn) => {
                // Service degradation at the connection limit: refuse the
                // newcomer, never the established sessions.
                if state.registry.stats().sessions >= state.config.limits.max_connections {
                    warn!(
                        limit = state.config.limits.max_connections,
                        "Connection limit reached, rejecting"
                    );
                    metrics::record_rejected_connection();
                    tokio::spawn(reject_at_capacity(conn));
                    continue;
                }
                tokio::spawn(handle_connection(Arc::clone(&state), conn));
            }
            Err(e) => {
                error!(transport = transport.name(), error = %e, "Accept failed");
                metrics::record_error("accept");
                // Back off instead of spinning on a persistent failure.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn reject_at_capacity(conn: Box<dyn Connection>) {
    let (_source, mut sink) = conn.split();
    let frame = Frame::error(0, code::SERVER_AT_CAPACITY, "server at capacity");
    let _ = sink.send(&frame).await;
    let _ = sink.close().await;
}

/// Drive one connection from handshake to teardown.
async fn handle_connection(state: Arc<ServerState>, conn: Box<dyn Connection>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let remote = conn.remote_addr().unwrap_or_else(|| "unknown".to_string());
    let (mut source, mut sink) = conn.split();

    debug!(remote = %remote, "Connection accepted");

    // The session exists from accept time; everything else keys off its id.
    let session_id = state.registry.register();

    let Some(identity) = handshake(&state, &mut source, &mut sink).await else {
        let _ = sink.close().await;
        if state.registry.remove(&session_id).is_err() {
            debug!(session = %session_id, "Session already removed");
        }
        return;
    };

    if let Err(e) = activate(&state.registry, &session_id, &identity) {
        // Defensive: a failed transition here is a bug, not a crash.
        error!(session = %session_id, error = %e, "Failed to activate session");
        let _ = sink.close().await;
        let _ = state.registry.remove(&session_id);
        return;
    }

    let connected = Frame::connected(
        session_id.as_str(),
        WIRE_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if sink.send(&connected).await.is_err() {
        let _ = state.registry.remove(&session_id);
        return;
    }

    info!(session = %session_id, identity = %identity, remote = %remote, "Session established");

    // Writer: drain the egress ring until it closes, then close the socket.
    let Some(egress) = state.registry.outbound_of(&session_id) else {
        let _ = state.registry.remove(&session_id);
        return;
    };
    let writer = tokio::spawn(write_loop(Arc::clone(&egress), sink));

    // Reader: the task whose exit owns teardown.
    read_loop(&state, &session_id, &mut source, &egress).await;

    match state.registry.remove(&session_id) {
        Ok(removed) => {
            state.router.announce_departure(&session_id, &removed);
            metrics::set_active_rooms(state.registry.stats().rooms);
        }
        Err(_) => {
            // Already removed by a concurrent close path; accounted no-op.
            debug!(session = %session_id, "Session already removed");
        }
    }

    if writer.await.is_err() {
        debug!(session = %session_id, "Writer task aborted");
    }
    info!(session = %session_id, remote = %remote, "Connection closed");
}

/// Await the CONNECT frame and authenticate the peer.
///
/// Sends the rejection frame itself; `None` means the connection is done.
async fn handshake(
    state: &Arc<ServerState>,
    source: &mut Box<dyn FrameSource>,
    sink: &mut Box<dyn FrameSink>,
) -> Option<String> {
    let deadline = Duration::from_millis(state.config.heartbeat.handshake_timeout_ms);

    let frame = match timeout(deadline, source.recv()).await {
        Err(_) => {
            debug!("Handshake timed out");
            return None;
        }
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return None,
        Ok(Err(e)) => {
            debug!(error = %e, "Handshake read failed");
            return None;
        }
    };

    match frame {
        Frame::Connect {
            version,
            credentials,
        } => {
            if !PROTOCOL_VERSION.accepts_major(version) {
                let frame = Frame::error(
                    0,
                    code::UNSUPPORTED_VERSION,
                    format!("unsupported protocol version {}", version),
                );
                let _ = sink.send(&frame).await;
                return None;
            }

            match state
                .authenticator
                .authenticate(credentials.as_deref())
                .await
            {
                Ok(identity) => Some(identity),
                Err(e) => {
                    debug!(error = %e, "Authentication rejected");
                    let frame = Frame::error(0, code::NOT_AUTHENTICATED, e.to_string());
                    let _ = sink.send(&frame).await;
                    None
                }
            }
        }
        other => {
            debug!(frame_type = ?other.frame_type(), "Expected connect frame");
            let frame = Frame::error(0, code::INVALID_MESSAGE, "expected connect frame");
            let _ = sink.send(&frame).await;
            None
        }
    }
}

/// Walk the session through Connecting -> Authenticated -> Active.
fn activate(
    registry: &SessionRegistry,
    session_id: &SessionId,
    identity: &str,
) -> Result<(), banter_core::RegistryError> {
    registry.set_identity(session_id, identity)?;
    registry.transition(session_id, SessionState::Authenticated)?;
    registry.transition(session_id, SessionState::Active)
}

/// Reader loop: decode, validate, rate-limit, publish to the ingress shard.
async fn read_loop(
    state: &Arc<ServerState>,
    session_id: &SessionId,
    source: &mut Box<dyn FrameSource>,
    egress: &Arc<EventRing<Outbound>>,
) {
    let limiter = RateLimiter::per_second(state.config.limits.messages_per_second);
    let idle = Duration::from_millis(state.config.heartbeat.idle_timeout_ms);
    let shard = Arc::clone(state.ingress.shard_for(session_id));

    loop {
        match timeout(idle, source.recv()).await {
            Err(_) => {
                info!(session = %session_id, "Idle timeout, closing session");
                break;
            }
            Ok(Ok(None)) => {
                debug!(session = %session_id, "Peer closed connection");
                break;
            }
            Ok(Err(e)) => {
                // Protocol errors stay local to this connection: answer if
                // the egress path still works, then close.
                if let TransportError::Protocol(pe) = &e {
                    warn!(session = %session_id, error = %pe, "Protocol error");
                    metrics::record_error("protocol");
                    enqueue_error(egress, 0, protocol_error_code(pe), "protocol error");
                } else {
                    debug!(session = %session_id, error = %e, "Transport error");
                    metrics::record_error("transport");
                }
                break;
            }
            Ok(Ok(Some(frame))) => {
                let started = Instant::now();
                metrics::record_frame("inbound");

                if let Err(reason) = validate::validate_frame(&frame) {
                    debug!(session = %session_id, reason, "Invalid message");
                    metrics::record_error("validation");
                    enqueue_error(egress, request_id_of(&frame), code::INVALID_MESSAGE, reason);
                    continue;
                }

                if let Err(wait) = limiter.try_acquire() {
                    metrics::record_rate_limited();
                    enqueue_error(
                        egress,
                        request_id_of(&frame),
                        code::RATE_LIMITED,
                        "rate limit exceeded",
                    );
                    // Throttle the offender; nobody else is affected.
                    tokio::time::sleep(wait).await;
                    continue;
                }

                // A full shard suspends this reader only: paused reads are
                // the ingress backpressure.
                let event = InboundEvent::new(session_id.clone(), frame);
                if shard.publish(event).await.is_err() {
                    debug!(session = %session_id, "Ingress shard closed");
                    break;
                }

                metrics::record_latency(started.elapsed().as_secs_f64());
            }
        }
    }
}

/// Writer loop: drain the egress ring to the socket.
async fn write_loop(egress: Arc<EventRing<Outbound>>, mut sink: Box<dyn FrameSink>) {
    loop {
        match egress.consume().await {
            Ok(out) => {
                metrics::record_message(out.len(), "outbound");
                if let Err(e) = sink.send_raw(out.bytes).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
            }
            // Ring closed and drained: session is going away.
            Err(_) => break,
        }
    }
    let _ = sink.close().await;
}

/// Best-effort error reply through the session's own egress ring.
fn enqueue_error(egress: &Arc<EventRing<Outbound>>, id: u64, error_code: u16, message: &str) {
    let frame = Frame::error(id, error_code, message);
    if let Ok(bytes) = banter_protocol::codec::encode(&frame) {
        let _ = egress.try_publish(Outbound::critical(bytes));
    }
}

fn protocol_error_code(e: &banter_protocol::ProtocolError) -> u16 {
    use banter_protocol::ProtocolError;
    match e {
        ProtocolError::FrameTooLarge(_) => code::FRAME_TOO_LARGE,
        ProtocolError::UnsupportedVersion(_) => code::UNSUPPORTED_VERSION,
        _ => code::MALFORMED_FRAME,
    }
}

fn request_id_of(frame: &Frame) -> u64 {
    match frame {
        Frame::Join { id, .. } | Frame::Leave { id, .. } => *id,
        Frame::Chat { id, .. } => id.unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AnonymousAuthenticator;
    use banter_protocol::{codec, PresenceAction, Scope};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct TestClient {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, frame: &Frame) {
            let data = codec::encode(frame).unwrap();
            self.stream.write_all(&data).await.unwrap();
        }

        async fn recv(&mut self) -> Frame {
            timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(frame) = codec::decode_from(&mut self.buf).unwrap() {
                        return frame;
                    }
                    let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                    assert!(n > 0, "connection closed while awaiting frame");
                }
            })
            .await
            .expect("timed out awaiting frame")
        }

        async fn handshake(&mut self, identity: &str) -> String {
            self.send(&Frame::connect(WIRE_VERSION, Some(identity.to_string())))
                .await;
            match self.recv().await {
                Frame::Connected { session, .. } => session,
                other => panic!("expected connected, got {:?}", other),
            }
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.transport.websocket = false;
        config.metrics.enabled = false;
        config.limits.workers = 2;
        config
    }

    async fn start_server(config: Config) -> (SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let server = Server::bind(config, Arc::new(AnonymousAuthenticator::new()))
            .await
            .unwrap();
        let addr = server.tcp_addr().unwrap();
        let handle = tokio::spawn(server.serve());
        (addr, handle)
    }

    #[tokio::test]
    async fn test_end_to_end_room_chat() {
        let (addr, server) = start_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        alice.handshake("alice").await;
        alice.send(&Frame::join(1, "lobby")).await;
        assert!(matches!(alice.recv().await, Frame::Ack { id: 1 }));
        assert!(matches!(
            alice.recv().await,
            Frame::Presence {
                action: PresenceAction::Sync,
                ..
            }
        ));

        let mut bob = TestClient::connect(addr).await;
        bob.handshake("bob").await;
        bob.send(&Frame::join(2, "lobby")).await;
        assert!(matches!(bob.recv().await, Frame::Ack { id: 2 }));
        assert!(matches!(
            bob.recv().await,
            Frame::Presence {
                action: PresenceAction::Sync,
                ..
            }
        ));

        // Alice sees bob join.
        match alice.recv().await {
            Frame::Presence { action, member, .. } => {
                assert_eq!(action, PresenceAction::Join);
                assert_eq!(member, "bob");
            }
            other => panic!("expected presence, got {:?}", other),
        }

        // Room chat from alice reaches bob, with the server-stamped sender.
        alice
            .send(&Frame::chat(
                "alice",
                Scope::room("lobby"),
                b"hello bob".to_vec(),
                1,
                banter_core::message::unix_millis(),
            ))
            .await;
        match bob.recv().await {
            Frame::Chat {
                sender, payload, ..
            } => {
                assert_eq!(sender, "alice");
                assert_eq!(payload, b"hello bob");
            }
            other => panic!("expected chat, got {:?}", other),
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_end_to_end_direct_message_and_unknown_peer() {
        let (addr, server) = start_server(test_config()).await;

        let mut alice = TestClient::connect(addr).await;
        alice.handshake("alice").await;
        let mut bob = TestClient::connect(addr).await;
        let bob_session = bob.handshake("bob").await;

        alice
            .send(&Frame::chat(
                "alice",
                Scope::direct(&bob_session),
                b"psst".to_vec(),
                1,
                0,
            ))
            .await;
        match bob.recv().await {
            Frame::Chat { sender, .. } => assert_eq!(sender, "alice"),
            other => panic!("expected chat, got {:?}", other),
        }

        // Unknown peer comes back as exactly one error to the sender.
        alice
            .send(&Frame::chat(
                "alice",
                Scope::direct("sess_gone"),
                b"lost".to_vec(),
                2,
                0,
            ))
            .await;
        match alice.recv().await {
            Frame::Error { code: c, .. } => assert_eq!(c, code::UNKNOWN_TARGET),
            other => panic!("expected error, got {:?}", other),
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_version() {
        let (addr, server) = start_server(test_config()).await;

        let mut client = TestClient::connect(addr).await;
        client.send(&Frame::connect(WIRE_VERSION + 1, None)).await;

        match client.recv().await {
            Frame::Error { code: c, .. } => assert_eq!(c, code::UNSUPPORTED_VERSION),
            other => panic!("expected error, got {:?}", other),
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_invalid_message_answered_without_disconnect() {
        let (addr, server) = start_server(test_config()).await;

        let mut client = TestClient::connect(addr).await;
        client.handshake("alice").await;

        // Reserved room name fails validation but keeps the session alive.
        client.send(&Frame::join(3, "$system")).await;
        match client.recv().await {
            Frame::Error { id, code: c, .. } => {
                assert_eq!(id, 3);
                assert_eq!(c, code::INVALID_MESSAGE);
            }
            other => panic!("expected error, got {:?}", other),
        }

        client.send(&Frame::ping(Some(5))).await;
        assert_eq!(client.recv().await, Frame::pong(Some(5)));

        server.abort();
    }
}
