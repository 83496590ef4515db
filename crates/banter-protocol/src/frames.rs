//! Frame types for the banter protocol.
//!
//! Frames are the fundamental unit of communication between clients and the
//! server. Each frame is serialized using MessagePack for efficient binary
//! encoding.

use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod code {
    /// Frame body could not be decoded.
    pub const MALFORMED_FRAME: u16 = 1001;
    /// Frame exceeded the configured maximum size.
    pub const FRAME_TOO_LARGE: u16 = 1002;
    /// Peer speaks an incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 1003;
    /// Frame decoded but failed validation.
    pub const INVALID_MESSAGE: u16 = 1004;
    /// Direct peer or room does not exist.
    pub const UNKNOWN_TARGET: u16 = 1005;
    /// Sender is not a member of the target room.
    pub const NOT_A_MEMBER: u16 = 1006;
    /// Handshake rejected by the authenticator.
    pub const NOT_AUTHENTICATED: u16 = 1007;
    /// Sender exceeded the inbound message rate limit.
    pub const RATE_LIMITED: u16 = 1008;
    /// Server refused the connection at its connection limit.
    pub const SERVER_AT_CAPACITY: u16 = 1009;
    /// Session or room limit reached (rooms per session, total rooms).
    pub const LIMIT_REACHED: u16 = 1010;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Join = 0x03,
    Leave = 0x04,
    Chat = 0x05,
    Presence = 0x06,
    Ack = 0x07,
    Error = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Join),
            0x04 => Ok(FrameType::Leave),
            0x05 => Ok(FrameType::Chat),
            0x06 => Ok(FrameType::Presence),
            0x07 => Ok(FrameType::Ack),
            0x08 => Ok(FrameType::Error),
            0x09 => Ok(FrameType::Ping),
            0x0A => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Delivery scope of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Scope {
    /// Deliver to exactly one session.
    #[serde(rename = "direct")]
    Direct {
        /// Target session id.
        peer: String,
    },

    /// Deliver to every member of a room.
    #[serde(rename = "room")]
    Room {
        /// Target room name.
        room: String,
    },

    /// Deliver to every active session.
    #[serde(rename = "broadcast")]
    Broadcast,
}

impl Scope {
    /// Create a direct scope.
    #[must_use]
    pub fn direct(peer: impl Into<String>) -> Self {
        Scope::Direct { peer: peer.into() }
    }

    /// Create a room scope.
    #[must_use]
    pub fn room(room: impl Into<String>) -> Self {
        Scope::Room { room: room.into() }
    }
}

/// Presence action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    /// A member joined the room.
    Join = 0,
    /// A member left the room.
    Leave = 1,
    /// Server sending a full membership snapshot.
    Sync = 2,
}

impl From<PresenceAction> for u8 {
    fn from(pa: PresenceAction) -> u8 {
        pa as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Join),
            1 => Ok(PresenceAction::Leave),
            2 => Ok(PresenceAction::Sync),
            _ => Err("Invalid presence action"),
        }
    }
}

/// A protocol frame.
///
/// Frames are the messages exchanged between clients and servers.
/// Each frame type has specific fields relevant to its operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version the client speaks.
        version: u8,
        /// Optional authentication credentials.
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique session identifier assigned by the server.
        session: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat_ms: u32,
    },

    /// Join a room.
    #[serde(rename = "join")]
    Join {
        /// Request ID for acknowledgment.
        id: u64,
        /// Room to join.
        room: String,
    },

    /// Leave a room.
    #[serde(rename = "leave")]
    Leave {
        /// Request ID for acknowledgment.
        id: u64,
        /// Room to leave.
        room: String,
    },

    /// A chat message.
    #[serde(rename = "chat")]
    Chat {
        /// Optional request ID for acknowledgment.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Sender identity. Stamped authoritatively by the server on
        /// delivery regardless of what the client put here.
        sender: String,
        /// Delivery scope.
        scope: Scope,
        /// Opaque message body.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
        /// Monotonic per-sender sequence number.
        sequence: u64,
        /// Sender-side timestamp, milliseconds since the Unix epoch.
        timestamp: u64,
        /// Whether the sender wants its own copy delivered back.
        #[serde(default)]
        echo: bool,
    },

    /// Room membership change notification.
    #[serde(rename = "presence")]
    Presence {
        /// Room the change applies to.
        room: String,
        /// What happened.
        action: PresenceAction,
        /// Identity of the member that joined or left.
        member: String,
        /// Full membership snapshot, present for [`PresenceAction::Sync`].
        #[serde(skip_serializing_if = "Option::is_none")]
        members: Option<Vec<String>>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`code`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Chat { .. } => FrameType::Chat,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, credentials: Option<String>) -> Self {
        Frame::Connect {
            version,
            credentials,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(session: impl Into<String>, version: u8, heartbeat_ms: u32) -> Self {
        Frame::Connected {
            session: session.into(),
            version,
            heartbeat_ms,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, room: impl Into<String>) -> Self {
        Frame::Join {
            id,
            room: room.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, room: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            room: room.into(),
        }
    }

    /// Create a new Chat frame without an ack request.
    #[must_use]
    pub fn chat(
        sender: impl Into<String>,
        scope: Scope,
        payload: impl Into<Vec<u8>>,
        sequence: u64,
        timestamp: u64,
    ) -> Self {
        Frame::Chat {
            id: None,
            sender: sender.into(),
            scope,
            payload: payload.into(),
            sequence,
            timestamp,
            echo: false,
        }
    }

    /// Create a presence notification.
    #[must_use]
    pub fn presence(room: impl Into<String>, action: PresenceAction, member: impl Into<String>) -> Self {
        Frame::Presence {
            room: room.into(),
            action,
            member: member.into(),
            members: None,
        }
    }

    /// Create a presence membership snapshot.
    #[must_use]
    pub fn presence_sync(
        room: impl Into<String>,
        member: impl Into<String>,
        members: Vec<String>,
    ) -> Self {
        Frame::Presence {
            room: room.into(),
            action: PresenceAction::Sync,
            member: member.into(),
            members: Some(members),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        Frame::Ping { timestamp }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let join = Frame::join(1, "lobby");
        assert_eq!(join.frame_type(), FrameType::Join);

        let chat = Frame::chat("alice", Scope::room("lobby"), b"hi".to_vec(), 1, 0);
        assert_eq!(chat.frame_type(), FrameType::Chat);
    }

    #[test]
    fn test_presence_action_conversion() {
        assert_eq!(PresenceAction::try_from(0), Ok(PresenceAction::Join));
        assert_eq!(PresenceAction::try_from(1), Ok(PresenceAction::Leave));
        assert_eq!(PresenceAction::try_from(2), Ok(PresenceAction::Sync));
        assert!(PresenceAction::try_from(3).is_err());
    }

    #[test]
    fn test_frame_type_conversion() {
        for byte in 0x01..=0x0A_u8 {
            let ft = FrameType::try_from(byte).unwrap();
            assert_eq!(u8::from(ft), byte);
        }
        assert!(FrameType::try_from(0x0B).is_err());
        assert!(FrameType::try_from(0x00).is_err());
    }

    #[test]
    fn test_scope_helpers() {
        assert_eq!(
            Scope::direct("sess_1"),
            Scope::Direct {
                peer: "sess_1".to_string()
            }
        );
        assert_eq!(
            Scope::room("lobby"),
            Scope::Room {
                room: "lobby".to_string()
            }
        );
    }
}
