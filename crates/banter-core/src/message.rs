//! Internal message types for the banter pipeline.
//!
//! These types are the units moved through the dispatch rings: decoded
//! client frames on the way in, pre-encoded deliveries on the way out.

use crate::session::SessionId;
use banter_protocol::{Frame, Scope};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A decoded frame entering the pipeline from one connection's reader.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Session the frame arrived on.
    pub session: SessionId,
    /// The decoded frame.
    pub frame: Frame,
}

impl InboundEvent {
    /// Create a new inbound event.
    #[must_use]
    pub fn new(session: SessionId, frame: Frame) -> Self {
        Self { session, frame }
    }
}

/// An immutable routed chat message.
///
/// Constructed once per inbound CHAT frame and never mutated; every stage
/// of the pipeline sees the same value. The payload is shared so fan-out
/// never copies the body.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Session the message originated from.
    pub sender: SessionId,
    /// Server-verified identity of the sender.
    pub sender_identity: String,
    /// Delivery scope.
    pub scope: Scope,
    /// Opaque message body (shared for zero-copy fan-out).
    pub payload: Arc<Bytes>,
    /// Monotonic per-sender sequence number.
    pub sequence: u64,
    /// Sender-side timestamp, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Whether the sender requested its own copy back.
    pub echo: bool,
    /// Request id to acknowledge, if the sender asked for one.
    pub ack_id: Option<u64>,
}

impl Envelope {
    /// Build the delivery frame for this message.
    ///
    /// The sender field carries the server-verified identity, not whatever
    /// the client originally wrote on the wire.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::Chat {
            id: None,
            sender: self.sender_identity.clone(),
            scope: self.scope.clone(),
            payload: self.payload.to_vec(),
            sequence: self.sequence,
            timestamp: self.timestamp,
            echo: false,
        }
    }
}

/// Delivery priority class for outbound traffic.
///
/// The slow-consumer policy keys off this: droppable traffic is shed when
/// a session's egress ring fills, critical traffic is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Must reach the client or the session is torn down (CHAT, ACK, ERROR).
    Critical,
    /// May be shed under backpressure (PRESENCE, PONG).
    Droppable,
}

/// A pre-encoded frame queued on a session's egress ring.
///
/// Encoding happens once per logical message; each recipient gets a cheap
/// clone of the same bytes.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Encoded frame, ready for the socket.
    pub bytes: Bytes,
    /// Delivery priority class.
    pub class: DeliveryClass,
}

impl Outbound {
    /// Create a critical outbound entry.
    #[must_use]
    pub fn critical(bytes: Bytes) -> Self {
        Self {
            bytes,
            class: DeliveryClass::Critical,
        }
    }

    /// Create a droppable outbound entry.
    #[must_use]
    pub fn droppable(bytes: Bytes) -> Self {
        Self {
            bytes,
            class: DeliveryClass::Droppable,
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the encoded frame is empty (never true in practice).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_to_frame_stamps_identity() {
        let env = Envelope {
            sender: SessionId::new("sess_1"),
            sender_identity: "alice".to_string(),
            scope: Scope::room("lobby"),
            payload: Arc::new(Bytes::from_static(b"hi")),
            sequence: 3,
            timestamp: 99,
            echo: true,
            ack_id: Some(7),
        };

        match env.to_frame() {
            Frame::Chat {
                sender,
                sequence,
                timestamp,
                echo,
                ..
            } => {
                assert_eq!(sender, "alice");
                assert_eq!(sequence, 3);
                assert_eq!(timestamp, 99);
                assert!(!echo);
            }
            other => panic!("expected chat frame, got {:?}", other),
        }
    }

    #[test]
    fn test_outbound_classes() {
        let critical = Outbound::critical(Bytes::from_static(b"x"));
        assert_eq!(critical.class, DeliveryClass::Critical);
        assert_eq!(critical.len(), 1);

        let droppable = Outbound::droppable(Bytes::from_static(b"yz"));
        assert_eq!(droppable.class, DeliveryClass::Droppable);
        assert!(!droppable.is_empty());
    }
}
