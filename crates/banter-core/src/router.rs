//! Routing and broadcast engine.
//!
//! The routing engine consumes dispatched inbound events, resolves their
//! recipients against the registry, and enqueues pre-encoded deliveries on
//! each target session's egress ring. Routing never waits on a full egress
//! ring: a slow consumer sheds droppable traffic or is disconnected, and
//! delivery to everyone else proceeds untouched.

use crate::message::{DeliveryClass, Envelope, InboundEvent, Outbound};
use crate::registry::{JoinOutcome, LeaveOutcome, RegistryError, RemovedSession, SessionRegistry};
use crate::ring::PublishError;
use crate::session::SessionId;
use banter_protocol::{code, codec, Frame, PresenceAction, Scope};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Routing configuration.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Whether senders receive their own ROOM/BROADCAST messages when the
    /// message does not carry an explicit echo request.
    pub echo_to_sender: bool,
    /// Whether a joining/leaving session receives the presence event about
    /// itself (it always receives a membership snapshot on join).
    pub notify_self_presence: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            notify_self_presence: false,
        }
    }
}

/// Observer interface for pipeline events.
///
/// The engine reports what happened; the embedding server decides how to
/// account for it (metrics, alerts). The default observer does nothing.
pub trait PipelineObserver: Send + Sync {
    /// A droppable delivery was shed because the target's egress ring was full.
    fn outbound_dropped(&self, session: &SessionId) {
        let _ = session;
    }

    /// A critical delivery hit a full egress ring; the session is being
    /// disconnected as a slow consumer.
    fn slow_consumer_disconnected(&self, session: &SessionId) {
        let _ = session;
    }

    /// A routing error was returned to a sender.
    fn routing_error(&self, code: u16) {
        let _ = code;
    }

    /// A message was fanned out to `recipients` targets.
    fn fanned_out(&self, recipients: usize, bytes: usize) {
        let _ = (recipients, bytes);
    }
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl PipelineObserver for NullObserver {}

/// The routing/broadcast engine.
pub struct RoutingEngine {
    registry: Arc<SessionRegistry>,
    config: RoutingConfig,
    observer: Arc<dyn PipelineObserver>,
}

impl RoutingEngine {
    /// Create an engine with the default configuration and observer.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_config(registry, RoutingConfig::default(), Arc::new(NullObserver))
    }

    /// Create an engine with custom configuration and observer.
    #[must_use]
    pub fn with_config(
        registry: Arc<SessionRegistry>,
        config: RoutingConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            registry,
            config,
            observer,
        }
    }

    /// The registry this engine routes against.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Process one dispatched inbound event.
    ///
    /// Non-blocking: every delivery goes through `try_publish` on the
    /// target's egress ring and full rings are handled by policy, so one
    /// slow session never stalls the worker.
    pub fn process(&self, event: InboundEvent) {
        let sender = event.session;
        match event.frame {
            Frame::Chat {
                id,
                scope,
                payload,
                sequence,
                timestamp,
                echo,
                ..
            } => self.route_chat(sender, id, scope, payload, sequence, timestamp, echo),
            Frame::Join { id, room } => self.handle_join(&sender, id, &room),
            Frame::Leave { id, room } => self.handle_leave(&sender, id, &room),
            Frame::Ping { timestamp } => {
                let frame = Frame::pong(timestamp);
                if let Some(bytes) = self.encode(&frame) {
                    self.send_to(&sender, Outbound::droppable(bytes));
                }
            }
            Frame::Pong { .. } => {
                // Liveness is tracked at the connection reader.
                trace!(session = %sender, "Pong");
            }
            other => {
                // Server-originated types arriving from a client.
                warn!(session = %sender, frame_type = ?other.frame_type(), "Unexpected frame type");
                self.send_error(
                    &sender,
                    0,
                    code::INVALID_MESSAGE,
                    "unexpected frame type",
                );
            }
        }
    }

    /// Route one chat message to its recipients.
    #[allow(clippy::too_many_arguments)]
    fn route_chat(
        &self,
        sender: SessionId,
        ack_id: Option<u64>,
        scope: Scope,
        payload: Vec<u8>,
        sequence: u64,
        timestamp: u64,
        echo: bool,
    ) {
        let Some(identity) = self.registry.identity_of(&sender) else {
            // Sender disconnected between dispatch and routing.
            debug!(session = %sender, "Dropping chat from unregistered session");
            return;
        };

        if !self.registry.note_sequence(&sender, sequence) {
            warn!(session = %sender, sequence, "Non-monotonic sequence from sender");
        }

        let envelope = Envelope {
            sender: sender.clone(),
            sender_identity: identity,
            scope,
            payload: Arc::new(Bytes::from(payload)),
            sequence,
            timestamp,
            echo,
            ack_id,
        };

        let targets = match self.resolve(&envelope) {
            Ok(targets) => targets,
            Err((error_code, message)) => {
                self.observer.routing_error(error_code);
                self.send_error(&sender, ack_id.unwrap_or(0), error_code, message);
                return;
            }
        };

        if let Some(bytes) = self.encode(&envelope.to_frame()) {
            let total = bytes.len() * targets.len();
            for target in &targets {
                self.send_to(target, Outbound::critical(bytes.clone()));
            }
            self.observer.fanned_out(targets.len(), total);
            trace!(
                session = %envelope.sender,
                sequence = envelope.sequence,
                recipients = targets.len(),
                "Routed chat"
            );
        }

        if let Some(id) = ack_id {
            self.send_ack(&envelope.sender, id);
        }
    }

    /// Resolve the recipient set for an envelope. Targets are resolved
    /// exactly once per call, so a recipient never gets duplicate copies.
    fn resolve(&self, envelope: &Envelope) -> Result<Vec<SessionId>, (u16, &'static str)> {
        let echo = envelope.echo || self.config.echo_to_sender;

        match &envelope.scope {
            Scope::Direct { peer } => {
                let peer = SessionId::new(peer.clone());
                if !self.registry.contains(&peer) {
                    return Err((code::UNKNOWN_TARGET, "unknown peer"));
                }
                Ok(vec![peer])
            }
            Scope::Room { room } => {
                let Some(members) = self.registry.room_members(room) else {
                    return Err((code::UNKNOWN_TARGET, "unknown room"));
                };
                if !members.contains(&envelope.sender) {
                    return Err((code::NOT_A_MEMBER, "not a room member"));
                }
                Ok(members
                    .into_iter()
                    .filter(|m| echo || *m != envelope.sender)
                    .collect())
            }
            Scope::Broadcast => Ok(self
                .registry
                .active_sessions()
                .into_iter()
                .filter(|s| echo || *s != envelope.sender)
                .collect()),
        }
    }

    fn handle_join(&self, sender: &SessionId, ack_id: u64, room: &str) {
        let identity = self.registry.identity_of(sender).unwrap_or_default();

        match self.registry.join_room(sender, room) {
            Ok(JoinOutcome {
                newly_joined,
                members,
                ..
            }) => {
                self.send_ack(sender, ack_id);

                // Joiner always gets the membership snapshot.
                let snapshot =
                    Frame::presence_sync(room, &identity, self.registry.identities_of(&members));
                if let Some(bytes) = self.encode(&snapshot) {
                    self.send_to(sender, Outbound::droppable(bytes));
                }

                if newly_joined {
                    self.announce(
                        room,
                        PresenceAction::Join,
                        &identity,
                        sender,
                        members.iter(),
                    );
                }
            }
            Err(e) => {
                debug!(session = %sender, room = %room, error = %e, "Join failed");
                let (error_code, message) = registry_error_code(&e);
                self.observer.routing_error(error_code);
                self.send_error(sender, ack_id, error_code, message);
            }
        }
    }

    fn handle_leave(&self, sender: &SessionId, ack_id: u64, room: &str) {
        let identity = self.registry.identity_of(sender).unwrap_or_default();

        match self.registry.leave_room(sender, room) {
            Ok(LeaveOutcome {
                was_member,
                remaining,
                ..
            }) => {
                self.send_ack(sender, ack_id);
                if was_member {
                    self.announce(
                        room,
                        PresenceAction::Leave,
                        &identity,
                        sender,
                        remaining.iter(),
                    );
                }
            }
            Err(e) => {
                debug!(session = %sender, room = %room, error = %e, "Leave failed");
                let (error_code, message) = registry_error_code(&e);
                self.observer.routing_error(error_code);
                self.send_error(sender, ack_id, error_code, message);
            }
        }
    }

    /// Fan out presence events after a session disconnected.
    ///
    /// Called from the connection teardown path with the departures that
    /// `SessionRegistry::remove` reported.
    pub fn announce_departure(&self, session: &SessionId, removed: &RemovedSession) {
        for departure in &removed.departures {
            self.announce(
                &departure.room,
                PresenceAction::Leave,
                &removed.identity,
                session,
                departure.remaining.iter(),
            );
        }
    }

    /// Deliver a presence event about `subject` to `targets`, excluding the
    /// subject itself unless self-notify is configured.
    fn announce<'a>(
        &self,
        room: &str,
        action: PresenceAction,
        identity: &str,
        subject: &SessionId,
        targets: impl Iterator<Item = &'a SessionId>,
    ) {
        let frame = Frame::presence(room, action, identity);
        let Some(bytes) = self.encode(&frame) else {
            return;
        };

        let mut count = 0;
        for target in targets {
            if target == subject && !self.config.notify_self_presence {
                continue;
            }
            self.send_to(target, Outbound::droppable(bytes.clone()));
            count += 1;
        }
        trace!(room = %room, action = ?action, member = %identity, recipients = count, "Presence");
    }

    fn send_ack(&self, target: &SessionId, id: u64) {
        if let Some(bytes) = self.encode(&Frame::ack(id)) {
            self.send_to(target, Outbound::critical(bytes));
        }
    }

    fn send_error(&self, target: &SessionId, id: u64, error_code: u16, message: &str) {
        if let Some(bytes) = self.encode(&Frame::error(id, error_code, message)) {
            self.send_to(target, Outbound::critical(bytes));
        }
    }

    /// Enqueue one delivery on a session's egress ring.
    ///
    /// Backpressure policy on a full ring: droppable deliveries are shed
    /// and counted; a critical delivery disconnects the slow session by
    /// closing its ring, which ends its writer task and triggers the
    /// normal teardown path. Either way this never blocks.
    fn send_to(&self, target: &SessionId, outbound: Outbound) -> bool {
        let Some(ring) = self.registry.outbound_of(target) else {
            trace!(session = %target, "Delivery target gone");
            return false;
        };

        match ring.try_publish(outbound) {
            Ok(_) => true,
            Err(PublishError::Full(out)) => match out.class {
                DeliveryClass::Droppable => {
                    self.registry.mark_degraded(target);
                    self.observer.outbound_dropped(target);
                    debug!(session = %target, "Egress ring full, dropped presence-class delivery");
                    false
                }
                DeliveryClass::Critical => {
                    warn!(session = %target, "Egress ring full on critical delivery, disconnecting slow consumer");
                    self.observer.slow_consumer_disconnected(target);
                    ring.close();
                    false
                }
            },
            Err(PublishError::Closed(_)) => {
                trace!(session = %target, "Delivery to closing session skipped");
                false
            }
        }
    }

    fn encode(&self, frame: &Frame) -> Option<Bytes> {
        match codec::encode(frame) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                // Server-built frames should always encode; log and drop.
                error!(error = %e, "Failed to encode outbound frame");
                None
            }
        }
    }
}

fn registry_error_code(e: &RegistryError) -> (u16, &'static str) {
    match e {
        RegistryError::InvalidRoom(msg) => (code::INVALID_MESSAGE, *msg),
        RegistryError::MaxRooms | RegistryError::MaxRoomsPerSession => {
            (code::LIMIT_REACHED, "room limit reached")
        }
        RegistryError::SessionNotFound(_) | RegistryError::SessionClosing(_) => {
            (code::UNKNOWN_TARGET, "session is closing")
        }
        RegistryError::InvalidTransition { .. } => (code::INVALID_MESSAGE, "invalid transition"),
    }
}
