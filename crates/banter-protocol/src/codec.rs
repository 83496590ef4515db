//! Codec for encoding and decoding banter frames.
//!
//! This module provides MessagePack-based serialization with length-prefixed
//! framing. The wire format of one frame is:
//!
//! - 4 bytes: big-endian body length
//! - 1 byte: protocol wire version (first body byte)
//! - N bytes: MessagePack-encoded frame
//!
//! Decoding is purely functional over an accumulating buffer, so one decoder
//! state (a `BytesMut`) per connection is enough and no locking is needed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;
use crate::version::WIRE_VERSION;

/// Hard ceiling on frame size (16 MiB). Deployments configure a lower limit
/// at the transport layer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Version prefix size in bytes (first byte of the body).
pub const VERSION_PREFIX_SIZE: usize = 1;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// Peer speaks an incompatible wire version.
    #[error("Unsupported wire version {0} (expected {WIRE_VERSION})")]
    UnsupportedVersion(u8),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;
    let body_len = VERSION_PREFIX_SIZE + payload.len();

    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(WIRE_VERSION);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    if length < VERSION_PREFIX_SIZE {
        return Err(ProtocolError::Invalid("empty frame body".to_string()));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let version = data[LENGTH_PREFIX_SIZE];
    if version != WIRE_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let body = &data[LENGTH_PREFIX_SIZE + VERSION_PREFIX_SIZE..total_size];
    let frame = rmp_serde::from_slice(body)?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// The buffer is not advanced on error, so the caller can surface the
/// failure and close the connection.
///
/// # Errors
///
/// Returns an error if the frame is too large, has an incompatible
/// version, or is invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    if length < VERSION_PREFIX_SIZE {
        return Err(ProtocolError::Invalid("empty frame body".to_string()));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    let version = buf[LENGTH_PREFIX_SIZE];
    if version != WIRE_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    buf.advance(LENGTH_PREFIX_SIZE + VERSION_PREFIX_SIZE);
    let body = buf.split_to(length - VERSION_PREFIX_SIZE);
    let frame = rmp_serde::from_slice(&body)?;

    Ok(Some(frame))
}

/// Peek at the body length of the frame at the front of the buffer, if the
/// length prefix has arrived. Lets transports enforce a configured frame
/// size limit below the codec's hard ceiling without consuming input.
#[must_use]
pub fn peek_frame_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{code, Scope};

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::connect(1, Some("token123".to_string())),
            Frame::connected("sess_1f", 1, 30000),
            Frame::join(1, "lobby"),
            Frame::leave(2, "lobby"),
            Frame::chat("alice", Scope::room("lobby"), b"Hello, world!".to_vec(), 7, 1000),
            Frame::chat("alice", Scope::direct("sess_2a"), b"psst".to_vec(), 8, 1001),
            Frame::chat("alice", Scope::Broadcast, b"everyone".to_vec(), 9, 1002),
            Frame::presence("lobby", crate::frames::PresenceAction::Join, "bob"),
            Frame::presence_sync("lobby", "bob", vec!["alice".into(), "bob".into()]),
            Frame::ack(42),
            Frame::error(1, code::INVALID_MESSAGE, "bad message"),
            Frame::ping(Some(12345)),
            Frame::pong(None),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::join(1, "lobby");
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let large_payload = vec![0u8; MAX_FRAME_SIZE + 1];
        let frame = Frame::chat("alice", Scope::Broadcast, large_payload, 1, 0);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_reject_wrong_version() {
        let frame = Frame::ping(None);
        let encoded = encode(&frame).unwrap();

        let mut tampered = BytesMut::from(&encoded[..]);
        tampered[LENGTH_PREFIX_SIZE] = WIRE_VERSION + 1;

        match decode_from(&mut tampered) {
            Err(ProtocolError::UnsupportedVersion(v)) => assert_eq!(v, WIRE_VERSION + 1),
            other => panic!("Expected UnsupportedVersion error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::join(1, "room-one");
        let frame2 = Frame::join(2, "room-two");

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(frame1, decoded1);
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_streaming_decode_partial_reads() {
        let frame = Frame::chat("alice", Scope::room("lobby"), b"hello".to_vec(), 1, 0);
        let encoded = encode(&frame).unwrap();

        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(3) {
            // Nothing to decode until the last chunk lands
            assert!(decode_from(&mut buf).unwrap().is_none() || buf.is_empty());
            buf.extend_from_slice(chunk);
        }

        let decoded = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_peek_frame_length() {
        let frame = Frame::ping(None);
        let encoded = encode(&frame).unwrap();

        assert_eq!(peek_frame_length(&encoded[..2]), None);
        assert_eq!(
            peek_frame_length(&encoded),
            Some(encoded.len() - LENGTH_PREFIX_SIZE)
        );
    }
}
