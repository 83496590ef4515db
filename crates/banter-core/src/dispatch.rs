//! Ingress dispatch: ring shards and the processing worker loop.
//!
//! Inbound events are spread across one ring shard per processing worker,
//! with sender-affine placement: every event from one session lands on the
//! same shard and is consumed by the same worker, so per-sender FIFO holds
//! across the whole pool. A reader suspended on its full shard is a paused
//! read; readers mapped to other shards are unaffected.

use crate::message::InboundEvent;
use crate::ring::EventRing;
use crate::router::RoutingEngine;
use crate::session::SessionId;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info};

/// The set of ingress ring shards.
pub struct IngressShards {
    shards: Vec<Arc<EventRing<InboundEvent>>>,
}

impl IngressShards {
    /// Create `workers` shards, each with the given capacity.
    #[must_use]
    pub fn new(workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        info!(workers, capacity, "Creating ingress ring shards");
        Self {
            shards: (0..workers)
                .map(|_| Arc::new(EventRing::with_capacity(capacity)))
                .collect(),
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether there are no shards (never true in practice).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// The shard every event from `session` is published to.
    #[must_use]
    pub fn shard_for(&self, session: &SessionId) -> &Arc<EventRing<InboundEvent>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        session.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// All shards, for spawning one worker per shard.
    #[must_use]
    pub fn shards(&self) -> &[Arc<EventRing<InboundEvent>>] {
        &self.shards
    }

    /// Close every shard, releasing the workers.
    pub fn close_all(&self) {
        for shard in &self.shards {
            shard.close();
        }
    }
}

/// The processing worker loop.
///
/// Consumes one ingress shard and hands each event to the routing engine.
/// Runs until the shard is closed and drained.
pub async fn run_worker(worker: usize, router: Arc<RoutingEngine>, shard: Arc<EventRing<InboundEvent>>) {
    debug!(worker, "Processing worker started");
    loop {
        match shard.consume().await {
            Ok(event) => router.process(event),
            Err(_) => break,
        }
    }
    debug!(worker, "Processing worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::session::SessionState;
    use banter_protocol::{codec, Frame, Scope};

    #[test]
    fn test_shard_placement_is_stable() {
        let shards = IngressShards::new(4, 16);
        let id = SessionId::new("sess_abc");

        let first = Arc::as_ptr(shards.shard_for(&id));
        for _ in 0..10 {
            assert_eq!(Arc::as_ptr(shards.shard_for(&id)), first);
        }
    }

    #[test]
    fn test_single_worker_floor() {
        let shards = IngressShards::new(0, 16);
        assert_eq!(shards.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_preserves_sender_order() {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(RoutingEngine::new(Arc::clone(&registry)));
        let shards = IngressShards::new(1, 8);

        let alice = registry.register();
        registry.set_identity(&alice, "alice").unwrap();
        registry
            .transition(&alice, SessionState::Authenticated)
            .unwrap();
        registry.transition(&alice, SessionState::Active).unwrap();
        let bob = registry.register();
        registry.set_identity(&bob, "bob").unwrap();
        registry
            .transition(&bob, SessionState::Authenticated)
            .unwrap();
        registry.transition(&bob, SessionState::Active).unwrap();

        let worker = tokio::spawn(run_worker(
            0,
            Arc::clone(&router),
            Arc::clone(&shards.shards()[0]),
        ));

        let shard = shards.shard_for(&alice);
        for sequence in 1..=20u64 {
            let frame = Frame::chat(
                "alice",
                Scope::direct(bob.as_str()),
                sequence.to_be_bytes().to_vec(),
                sequence,
                0,
            );
            shard
                .publish(InboundEvent::new(alice.clone(), frame))
                .await
                .unwrap();
        }

        // Bob observes alice's messages in send order.
        let ring = registry.outbound_of(&bob).unwrap();
        let mut expected = 1u64;
        while expected <= 20 {
            let out = ring.consume().await.unwrap();
            match codec::decode(&out.bytes).unwrap() {
                Frame::Chat { sequence, .. } => {
                    assert_eq!(sequence, expected);
                    expected += 1;
                }
                other => panic!("expected chat, got {:?}", other),
            }
        }

        shards.close_all();
        worker.await.unwrap();
    }
}
