//! # banter-core
//!
//! Session registry, event dispatch ring, and routing engine for the banter
//! chat server.
//!
//! This crate is the server-side message pipeline between socket I/O and
//! business semantics:
//!
//! - **Session / SessionRegistry** - connection lifecycle and room membership
//! - **EventRing** - bounded, ordered, backpressured hand-off between tasks
//! - **RoutingEngine** - recipient resolution and fan-out
//! - **IngressShards** - sender-affine dispatch into the worker pool
//!
//! ## Architecture
//!
//! ```text
//! readers ──▶ ingress shards ──▶ workers ──▶ RoutingEngine
//!                                                 │
//!                        SessionRegistry ◀────────┤
//!                                                 ▼
//!                              per-session egress rings ──▶ writers
//! ```

pub mod dispatch;
pub mod message;
pub mod registry;
pub mod ring;
pub mod router;
pub mod session;

pub use dispatch::IngressShards;
pub use message::{DeliveryClass, Envelope, InboundEvent, Outbound};
pub use registry::{RegistryConfig, RegistryError, SessionRegistry};
pub use ring::{EventRing, PublishError, RingError};
pub use router::{NullObserver, PipelineObserver, RoutingConfig, RoutingEngine};
pub use session::{RoomId, Session, SessionId, SessionState};
