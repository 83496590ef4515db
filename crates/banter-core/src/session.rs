//! Per-connection session state.
//!
//! A session is created when a connection is accepted and lives until the
//! connection closes. Sessions are owned exclusively by the registry; other
//! components refer to them by [`SessionId`] and look them up.

use crate::message::Outbound;
use crate::ring::EventRing;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A room identifier.
pub type RoomId = String;

/// Counter folded into generated ids so two sessions accepted in the same
/// nanosecond still differ.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from a known value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh session ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sess_{:x}{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, handshake not yet completed.
    Connecting,
    /// Handshake authenticated, not yet serving traffic.
    Authenticated,
    /// Fully connected and routable.
    Active,
    /// Teardown in progress.
    Closing,
    /// Removed from the registry.
    Closed,
}

impl SessionState {
    /// Check whether the state machine allows moving to `next`.
    ///
    /// Forward edges are Connecting -> Authenticated -> Active. Any state
    /// may enter Closing; only Closing may enter Closed.
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Active, Authenticated, Closed, Closing, Connecting};
        match (self, next) {
            (Connecting, Authenticated) | (Authenticated, Active) => true,
            (Closed, Closing) => false,
            (_, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

/// Server-side state for one connected client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    identity: String,
    state: SessionState,
    rooms: HashSet<RoomId>,
    outbound: Arc<EventRing<Outbound>>,
    last_sequence: u64,
    last_activity: Instant,
    degraded: bool,
}

impl Session {
    /// Create a new session in the Connecting state.
    #[must_use]
    pub fn new(id: SessionId, outbound: Arc<EventRing<Outbound>>) -> Self {
        Self {
            id,
            identity: String::new(),
            state: SessionState::Connecting,
            rooms: HashSet::new(),
            outbound,
            last_sequence: 0,
            last_activity: Instant::now(),
            degraded: false,
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Get the authenticated identity (empty until the handshake completes).
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Set the authenticated identity.
    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = identity.into();
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Set the lifecycle state. Callers validate the edge first.
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Rooms this session is a member of.
    #[must_use]
    pub fn rooms(&self) -> &HashSet<RoomId> {
        &self.rooms
    }

    /// Record a room membership. Returns `false` if already a member.
    pub fn join(&mut self, room: impl Into<RoomId>) -> bool {
        self.rooms.insert(room.into())
    }

    /// Drop a room membership. Returns `false` if not a member.
    pub fn leave(&mut self, room: &str) -> bool {
        self.rooms.remove(room)
    }

    /// The session's egress ring.
    #[must_use]
    pub fn outbound(&self) -> &Arc<EventRing<Outbound>> {
        &self.outbound
    }

    /// Highest sequence number seen from this sender.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Record an observed sequence number. Returns `false` when the
    /// sequence regressed, which callers log as a client anomaly.
    pub fn note_sequence(&mut self, sequence: u64) -> bool {
        let monotonic = sequence > self.last_sequence;
        if monotonic {
            self.last_sequence = sequence;
        }
        monotonic
    }

    /// Time of the last observed read activity.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record read activity for liveness tracking.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the slow-consumer policy has flagged this session.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Flag this session as a slow consumer.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }
}

/// A point-in-time copy of a session's observable state.
///
/// This is what `lookup` hands out: callers never hold the session itself.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: SessionId,
    /// Authenticated identity.
    pub identity: String,
    /// Lifecycle state at snapshot time.
    pub state: SessionState,
    /// Room memberships at snapshot time.
    pub rooms: Vec<RoomId>,
    /// Highest sequence seen from this sender.
    pub last_sequence: u64,
    /// Whether the session is flagged as a slow consumer.
    pub degraded: bool,
}

impl SessionSnapshot {
    pub(crate) fn of(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            identity: session.identity.clone(),
            state: session.state,
            rooms: session.rooms.iter().cloned().collect(),
            last_sequence: session.last_sequence,
            degraded: session.degraded,
        }
    }
}
