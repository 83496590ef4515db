//! Message validation for inbound frames.
//!
//! Validation runs after decoding and before routing, so malformed content
//! is rejected at the connection edge with an error response instead of
//! propagating into the pipeline.

use crate::frames::{Frame, Scope};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Identity length bounds.
pub const MIN_IDENTITY_LENGTH: usize = 3;
pub const MAX_IDENTITY_LENGTH: usize = 20;

/// Maximum chat payload size in bytes.
pub const MAX_CHAT_PAYLOAD: usize = 4096;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("room name too long");
    }
    if name.starts_with('$') {
        return Err("room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("room name contains invalid characters");
    }
    Ok(())
}

/// Validate a user identity: 3-20 alphanumeric characters.
///
/// # Errors
///
/// Returns an error message if the identity is invalid.
pub fn validate_identity(identity: &str) -> Result<(), &'static str> {
    if identity.is_empty() {
        return Err("identity is required");
    }
    if identity.len() < MIN_IDENTITY_LENGTH || identity.len() > MAX_IDENTITY_LENGTH {
        return Err("identity must be 3-20 characters");
    }
    if !identity.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("identity must be alphanumeric");
    }
    Ok(())
}

/// Validate a chat payload.
///
/// # Errors
///
/// Returns an error message if the payload is empty or oversized.
pub fn validate_payload(payload: &[u8]) -> Result<(), &'static str> {
    if payload.is_empty() {
        return Err("message payload is required");
    }
    if payload.len() > MAX_CHAT_PAYLOAD {
        return Err("message payload too large");
    }
    Ok(())
}

/// Validate a client-originated frame before it enters the pipeline.
///
/// Server-originated frame types pass through untouched; the routing layer
/// rejects them as unexpected.
///
/// # Errors
///
/// Returns an error message describing the first violation found.
pub fn validate_frame(frame: &Frame) -> Result<(), &'static str> {
    match frame {
        Frame::Join { room, .. } | Frame::Leave { room, .. } => validate_room_name(room),
        Frame::Chat { scope, payload, .. } => {
            validate_payload(payload)?;
            match scope {
                Scope::Room { room } => validate_room_name(room),
                Scope::Direct { peer } => {
                    if peer.is_empty() {
                        Err("direct peer is required")
                    } else {
                        Ok(())
                    }
                }
                Scope::Broadcast => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Scope;

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("general").is_ok());
        assert!(validate_room_name("chat:lobby").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("$system").is_err());
        assert!(validate_room_name("caf\u{e9}").is_err());

        let long_name = "a".repeat(MAX_ROOM_NAME_LENGTH + 1);
        assert!(validate_room_name(&long_name).is_err());
    }

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("bob42").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("ab").is_err());
        assert!(validate_identity(&"a".repeat(21)).is_err());
        assert!(validate_identity("no spaces").is_err());
        assert!(validate_identity("under_score").is_err());
    }

    #[test]
    fn test_payload_validation() {
        assert!(validate_payload(b"hello").is_ok());
        assert!(validate_payload(b"").is_err());
        assert!(validate_payload(&vec![0u8; MAX_CHAT_PAYLOAD]).is_ok());
        assert!(validate_payload(&vec![0u8; MAX_CHAT_PAYLOAD + 1]).is_err());
    }

    #[test]
    fn test_frame_validation() {
        assert!(validate_frame(&Frame::join(1, "lobby")).is_ok());
        assert!(validate_frame(&Frame::join(1, "$reserved")).is_err());

        let chat = Frame::chat("alice", Scope::room("lobby"), b"hi".to_vec(), 1, 0);
        assert!(validate_frame(&chat).is_ok());

        let empty = Frame::chat("alice", Scope::room("lobby"), Vec::new(), 1, 0);
        assert!(validate_frame(&empty).is_err());

        let no_peer = Frame::chat("alice", Scope::direct(""), b"hi".to_vec(), 1, 0);
        assert!(validate_frame(&no_peer).is_err());

        // Server-originated types are not the validator's concern
        assert!(validate_frame(&Frame::ack(1)).is_ok());
    }
}
