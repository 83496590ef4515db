//! # banter-protocol
//!
//! Wire protocol definitions for the banter chat server.
//!
//! This crate defines the binary protocol spoken between banter clients and
//! servers: frame types, the length-prefixed codec, message validation, and
//! protocol versioning. The codec is symmetric, so the same crate serves as
//! the client-side encoder/decoder.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Connection handshake
//! - `Join` / `Leave` - Room membership
//! - `Chat` - Messages addressed to a peer, a room, or everyone
//! - `Presence` - Membership change notifications
//! - `Ack` / `Error` - Acknowledgments and errors
//! - `Ping` / `Pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use banter_protocol::{Frame, Scope, codec};
//!
//! let frame = Frame::chat("alice", Scope::room("lobby"), b"hello".to_vec(), 1, 0);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod validate;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{code, Frame, FrameType, PresenceAction, Scope};
pub use version::{Version, PROTOCOL_VERSION, WIRE_VERSION};
