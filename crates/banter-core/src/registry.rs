//! Session and room registry.
//!
//! The registry is the single ownership boundary for connection state:
//! sessions and room membership live here and nowhere else. Other
//! components hold session and room ids and come back through these
//! operations. Lookups on the routing hot path are lock-free reads of the
//! underlying maps; mutations that touch both maps are serialized through
//! one internal lock, so `remove` is linearizable with respect to every
//! concurrent `join_room`/`leave_room`/`register` and a session can never
//! be observed half removed.
//!
//! Lock discipline: mutation paths never hold a session map entry while
//! touching the room map (membership is collected first, then applied),
//! which keeps readers that walk rooms -> sessions deadlock-free.

use crate::message::Outbound;
use crate::ring::EventRing;
use crate::session::{RoomId, Session, SessionId, SessionSnapshot, SessionState};
use banter_protocol::validate::validate_room_name;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No session with that id.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The state machine forbids this edge.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// The session is closing and no longer accepts membership changes.
    #[error("session is closing: {0}")]
    SessionClosing(SessionId),

    /// Total room limit reached.
    #[error("maximum number of rooms reached")]
    MaxRooms,

    /// Per-session room limit reached.
    #[error("maximum rooms per session reached")]
    MaxRoomsPerSession,

    /// Room name failed validation.
    #[error("invalid room name: {0}")]
    InvalidRoom(&'static str),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms one session may join.
    pub max_rooms_per_session: usize,
    /// Whether a room is destroyed the moment its last member leaves.
    pub destroy_empty_rooms: bool,
    /// Capacity of each session's egress ring.
    pub egress_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_rooms_per_session: 100,
            destroy_empty_rooms: true,
            egress_capacity: 256,
        }
    }
}

/// A named group of sessions.
#[derive(Debug, Default)]
struct Room {
    members: HashSet<SessionId>,
}

/// Outcome of a `join_room` call.
#[derive(Debug)]
pub struct JoinOutcome {
    /// `false` when the session was already a member (idempotent join).
    pub newly_joined: bool,
    /// Whether the room was created by this join.
    pub created_room: bool,
    /// Members after the join, including the joiner.
    pub members: Vec<SessionId>,
}

/// Outcome of a `leave_room` call.
#[derive(Debug)]
pub struct LeaveOutcome {
    /// `false` when the session was not a member (idempotent leave).
    pub was_member: bool,
    /// Members remaining after the leave.
    pub remaining: Vec<SessionId>,
    /// Whether the room was destroyed because it emptied.
    pub destroyed: bool,
}

/// One room departure recorded during session removal.
#[derive(Debug)]
pub struct RoomDeparture {
    /// Room the session left.
    pub room: RoomId,
    /// Members remaining in the room.
    pub remaining: Vec<SessionId>,
    /// Whether the room was destroyed because it emptied.
    pub destroyed: bool,
}

/// What `remove` tore down.
#[derive(Debug)]
pub struct RemovedSession {
    /// Identity the session was authenticated as.
    pub identity: String,
    /// Every room the session was removed from.
    pub departures: Vec<RoomDeparture>,
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of registered sessions.
    pub sessions: usize,
    /// Number of live rooms.
    pub rooms: usize,
    /// Total room memberships.
    pub memberships: usize,
}

/// The session registry.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    rooms: DashMap<RoomId, Room>,
    /// Serializes mutations that span both maps.
    mutation: Mutex<()>,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating session registry with config: {:?}", config);
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            mutation: Mutex::new(()),
            config,
        }
    }

    fn mutate(&self) -> MutexGuard<'_, ()> {
        // A poisoned lock means a panic mid-mutation; the maps themselves
        // are still structurally sound, so keep serving.
        self.mutation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session in the Connecting state.
    ///
    /// Never blocks beyond the map insert; the session id is the only
    /// handle callers keep.
    pub fn register(&self) -> SessionId {
        let id = SessionId::generate();
        let ring = Arc::new(EventRing::with_capacity(self.config.egress_capacity));
        let session = Session::new(id.clone(), ring);

        let _guard = self.mutate();
        self.sessions.insert(id.clone(), session);
        debug!(session = %id, "Session registered");
        id
    }

    /// Look up a session, returning a point-in-time snapshot.
    #[must_use]
    pub fn lookup(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|s| SessionSnapshot::of(&s))
    }

    /// Whether a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Current state of a session.
    #[must_use]
    pub fn state_of(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|s| s.state())
    }

    /// Authenticated identity of a session.
    #[must_use]
    pub fn identity_of(&self, id: &SessionId) -> Option<String> {
        self.sessions.get(id).map(|s| s.identity().to_string())
    }

    /// The egress ring of a session, cloned for a writer task or the
    /// routing engine. The ring outlives registry removal so producers
    /// observe a closed ring instead of a dangling reference.
    #[must_use]
    pub fn outbound_of(&self, id: &SessionId) -> Option<Arc<EventRing<Outbound>>> {
        self.sessions.get(id).map(|s| Arc::clone(s.outbound()))
    }

    /// Record the authenticated identity on a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session is gone.
    pub fn set_identity(&self, id: &SessionId, identity: &str) -> Result<(), RegistryError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;
        session.set_identity(identity);
        Ok(())
    }

    /// Transition a session's lifecycle state, validating the edge.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for a forbidden edge. Callers log and
    /// carry on; an invalid edge is a bug, not a fatal condition.
    pub fn transition(&self, id: &SessionId, next: SessionState) -> Result<(), RegistryError> {
        let _guard = self.mutate();
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;

        let current = session.state();
        if !current.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        session.set_state(next);
        debug!(session = %id, from = ?current, to = ?next, "Session state transition");
        Ok(())
    }

    /// Record an observed per-sender sequence number.
    ///
    /// Returns `false` when the sequence regressed (logged by the caller).
    #[must_use]
    pub fn note_sequence(&self, id: &SessionId, sequence: u64) -> bool {
        self.sessions
            .get_mut(id)
            .map(|mut s| s.note_sequence(sequence))
            .unwrap_or(false)
    }

    /// Flag a session as a slow consumer.
    pub fn mark_degraded(&self, id: &SessionId) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            if !session.is_degraded() {
                session.mark_degraded();
                warn!(session = %id, "Session marked degraded (slow consumer)");
            }
        }
    }

    /// Join a session to a room, creating the room on first join.
    /// Idempotent: joining a room twice reports `newly_joined: false`.
    ///
    /// # Errors
    ///
    /// Fails on unknown sessions, closing sessions, invalid room names,
    /// and configured room limits.
    pub fn join_room(&self, id: &SessionId, room: &str) -> Result<JoinOutcome, RegistryError> {
        validate_room_name(room).map_err(RegistryError::InvalidRoom)?;

        let _guard = self.mutate();

        let creating = !self.rooms.contains_key(room);
        if creating && self.rooms.len() >= self.config.max_rooms {
            return Err(RegistryError::MaxRooms);
        }

        {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;

            match session.state() {
                SessionState::Closing | SessionState::Closed => {
                    return Err(RegistryError::SessionClosing(id.clone()));
                }
                _ => {}
            }

            if session.rooms().contains(room) {
                drop(session);
                let members = self.members_of(room);
                return Ok(JoinOutcome {
                    newly_joined: false,
                    created_room: false,
                    members,
                });
            }

            if session.rooms().len() >= self.config.max_rooms_per_session {
                return Err(RegistryError::MaxRoomsPerSession);
            }

            session.join(room);
        }

        let mut entry = self.rooms.entry(room.to_string()).or_default();
        entry.members.insert(id.clone());
        let members: Vec<SessionId> = entry.members.iter().cloned().collect();
        drop(entry);

        debug!(
            session = %id,
            room = %room,
            members = members.len(),
            created = creating,
            "Joined room"
        );

        Ok(JoinOutcome {
            newly_joined: true,
            created_room: creating,
            members,
        })
    }

    /// Remove a session from a room. Idempotent: leaving a room the
    /// session is not in reports `was_member: false`.
    ///
    /// An emptied room is destroyed immediately when the registry is
    /// configured to do so.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session is gone.
    pub fn leave_room(&self, id: &SessionId, room: &str) -> Result<LeaveOutcome, RegistryError> {
        let _guard = self.mutate();

        let was_member = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;
            session.leave(room)
        };

        if !was_member {
            return Ok(LeaveOutcome {
                was_member: false,
                remaining: Vec::new(),
                destroyed: false,
            });
        }

        let (remaining, destroyed) = self.drop_member(room, id);
        debug!(
            session = %id,
            room = %room,
            remaining = remaining.len(),
            destroyed,
            "Left room"
        );

        Ok(LeaveOutcome {
            was_member: true,
            remaining,
            destroyed,
        })
    }

    /// Deregister a session and remove it from every room it belonged to.
    ///
    /// The session's egress ring is closed first, so any producer waiting
    /// on it unblocks with a closed-ring signal; room membership is cleared
    /// before the registry entry disappears, so membership is always a
    /// subset of registered sessions. A second `remove` of the same id is
    /// the caller's double-close bug: it gets `SessionNotFound`, which
    /// callers treat as an accounted no-op.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session is already gone.
    pub fn remove(&self, id: &SessionId) -> Result<RemovedSession, RegistryError> {
        let _guard = self.mutate();

        let (identity, rooms) = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;

            if session.state() != SessionState::Closing {
                session.set_state(SessionState::Closing);
            }
            session.outbound().close();
            (
                session.identity().to_string(),
                session.rooms().iter().cloned().collect::<Vec<_>>(),
            )
        };

        let mut departures = Vec::with_capacity(rooms.len());
        for room in &rooms {
            let (remaining, destroyed) = self.drop_member(room, id);
            departures.push(RoomDeparture {
                room: room.clone(),
                remaining,
                destroyed,
            });
        }

        if let Some((_, mut session)) = self.sessions.remove(id) {
            session.set_state(SessionState::Closed);
        }

        info!(session = %id, identity = %identity, rooms = departures.len(), "Session removed");
        Ok(RemovedSession {
            identity,
            departures,
        })
    }

    /// Members of a room, or `None` if the room does not exist.
    #[must_use]
    pub fn room_members(&self, room: &str) -> Option<Vec<SessionId>> {
        self.rooms
            .get(room)
            .map(|r| r.members.iter().cloned().collect())
    }

    /// Whether a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Every session currently in the Active state.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|s| s.state() == SessionState::Active)
            .map(|s| s.id().clone())
            .collect()
    }

    /// Identities for a set of session ids, skipping unknown sessions.
    #[must_use]
    pub fn identities_of(&self, ids: &[SessionId]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.identity_of(id))
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions: self.sessions.len(),
            rooms: self.rooms.len(),
            memberships: self.rooms.iter().map(|r| r.members.len()).sum(),
        }
    }

    fn members_of(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .get(room)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop one member from a room, destroying the room if it empties.
    /// Callers hold the mutation lock.
    fn drop_member(&self, room: &str, id: &SessionId) -> (Vec<SessionId>, bool) {
        let Some(mut entry) = self.rooms.get_mut(room) else {
            return (Vec::new(), false);
        };
        entry.members.remove(id);
        let remaining: Vec<SessionId> = entry.members.iter().cloned().collect();
        let destroy = remaining.is_empty() && self.config.destroy_empty_rooms;
        drop(entry);

        if destroy {
            self.rooms.remove(room);
            debug!(room = %room, "Destroyed empty room");
        }
        (remaining, destroy)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_session(registry: &SessionRegistry, identity: &str) -> SessionId {
        let id = registry.register();
        registry.set_identity(&id, identity).unwrap();
        registry
            .transition(&id, SessionState::Authenticated)
            .unwrap();
        registry.transition(&id, SessionState::Active).unwrap();
        id
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let id = registry.register();

        let snapshot = registry.lookup(&id).unwrap();
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert!(snapshot.rooms.is_empty());

        assert!(registry.lookup(&SessionId::new("sess_missing")).is_none());
    }

    #[test]
    fn test_transition_validation() {
        let registry = SessionRegistry::new();
        let id = registry.register();

        // Connecting -> Active skips Authenticated
        match registry.transition(&id, SessionState::Active) {
            Err(RegistryError::InvalidTransition { from, to }) => {
                assert_eq!(from, SessionState::Connecting);
                assert_eq!(to, SessionState::Active);
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }

        registry
            .transition(&id, SessionState::Authenticated)
            .unwrap();
        registry.transition(&id, SessionState::Active).unwrap();
        registry.transition(&id, SessionState::Closing).unwrap();
        registry.transition(&id, SessionState::Closed).unwrap();
    }

    #[test]
    fn test_join_creates_room_and_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = active_session(&registry, "alice");

        assert!(!registry.room_exists("lobby"));
        let outcome = registry.join_room(&id, "lobby").unwrap();
        assert!(outcome.newly_joined);
        assert!(outcome.created_room);
        assert_eq!(outcome.members, vec![id.clone()]);

        let again = registry.join_room(&id, "lobby").unwrap();
        assert!(!again.newly_joined);
        assert!(!again.created_room);
        assert_eq!(again.members, vec![id.clone()]);
    }

    #[test]
    fn test_leave_destroys_empty_room() {
        let registry = SessionRegistry::new();
        let alice = active_session(&registry, "alice");
        let bob = active_session(&registry, "bob");

        registry.join_room(&alice, "lobby").unwrap();
        registry.join_room(&bob, "lobby").unwrap();

        let outcome = registry.leave_room(&alice, "lobby").unwrap();
        assert!(outcome.was_member);
        assert!(!outcome.destroyed);
        assert_eq!(outcome.remaining, vec![bob.clone()]);

        let outcome = registry.leave_room(&bob, "lobby").unwrap();
        assert!(outcome.destroyed);
        assert!(!registry.room_exists("lobby"));

        // Idempotent leave
        let outcome = registry.leave_room(&bob, "lobby").unwrap();
        assert!(!outcome.was_member);
    }

    #[test]
    fn test_remove_clears_all_memberships() {
        let registry = SessionRegistry::new();
        let alice = active_session(&registry, "alice");
        let bob = active_session(&registry, "bob");

        registry.join_room(&alice, "one").unwrap();
        registry.join_room(&alice, "two").unwrap();
        registry.join_room(&bob, "one").unwrap();

        let ring = registry.outbound_of(&alice).unwrap();
        let removed = registry.remove(&alice).unwrap();
        assert_eq!(removed.identity, "alice");
        assert_eq!(removed.departures.len(), 2);

        // No orphan membership anywhere
        assert!(registry.lookup(&alice).is_none());
        assert_eq!(registry.room_members("one").unwrap(), vec![bob.clone()]);
        assert!(!registry.room_exists("two"));

        // Producers on the egress ring are unblocked
        assert!(ring.is_closed());

        // Double remove is a no-op error
        assert!(matches!(
            registry.remove(&alice),
            Err(RegistryError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_closing_session_cannot_join() {
        let registry = SessionRegistry::new();
        let id = active_session(&registry, "alice");
        registry.transition(&id, SessionState::Closing).unwrap();

        assert!(matches!(
            registry.join_room(&id, "lobby"),
            Err(RegistryError::SessionClosing(_))
        ));
    }

    #[test]
    fn test_room_limits() {
        let registry = SessionRegistry::with_config(RegistryConfig {
            max_rooms: 1,
            max_rooms_per_session: 1,
            ..RegistryConfig::default()
        });
        let alice = active_session(&registry, "alice");
        let bob = active_session(&registry, "bob");

        registry.join_room(&alice, "one").unwrap();
        assert!(matches!(
            registry.join_room(&bob, "two"),
            Err(RegistryError::MaxRooms)
        ));
        // Joining the existing room is still allowed
        registry.join_room(&bob, "one").unwrap();
        assert!(matches!(
            registry.join_room(&alice, "one-more"),
            Err(RegistryError::MaxRoomsPerSession)
        ));
    }

    #[test]
    fn test_invalid_room_name_rejected() {
        let registry = SessionRegistry::new();
        let id = active_session(&registry, "alice");

        assert!(matches!(
            registry.join_room(&id, "$system"),
            Err(RegistryError::InvalidRoom(_))
        ));
        assert!(matches!(
            registry.join_room(&id, ""),
            Err(RegistryError::InvalidRoom(_))
        ));
    }

    #[test]
    fn test_active_sessions_excludes_connecting() {
        let registry = SessionRegistry::new();
        let alice = active_session(&registry, "alice");
        let _pending = registry.register();

        let active = registry.active_sessions();
        assert_eq!(active, vec![alice]);
    }

    #[test]
    fn test_stats() {
        let registry = SessionRegistry::new();
        let alice = active_session(&registry, "alice");
        let bob = active_session(&registry, "bob");

        registry.join_room(&alice, "one").unwrap();
        registry.join_room(&bob, "one").unwrap();
        registry.join_room(&bob, "two").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.rooms, 2);
        assert_eq!(stats.memberships, 3);
    }
}
