//! Bounded event dispatch ring.
//!
//! The ring is the hand-off structure between producer tasks (connection
//! readers, the routing engine) and consumer tasks (processing workers,
//! per-session writers). It is a fixed-capacity circular buffer with atomic
//! claim/publish sequencing: producers claim the next slot sequence, write
//! the value, and stamp the slot published; consumers claim the next
//! unconsumed sequence and stamp the slot free one lap ahead. Publish and
//! consume are lock-free; waiting producers and consumers park on
//! [`tokio::sync::Notify`] and are woken by the opposite side.
//!
//! Capacity is a hard bound: when consumers lag a full lap behind, a
//! producer either observes [`RingError::Full`] (`try_publish`) or suspends
//! (`publish`) until space frees. That suspension is the pipeline's
//! backpressure: a connection reader awaiting its ingress ring is a paused
//! read.
//!
//! Closing the ring wakes every waiter. Publishing to a closed ring fails
//! immediately; consumers drain what was already published, then observe
//! [`RingError::Closed`].

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Notify;

/// Ring operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// The ring is at capacity.
    #[error("ring is full")]
    Full,

    /// No published event is available.
    #[error("ring is empty")]
    Empty,

    /// The ring was closed.
    #[error("ring is closed")]
    Closed,
}

/// Failed `try_publish`, handing the value back to the caller.
#[derive(Debug)]
pub enum PublishError<T> {
    /// The ring is at capacity.
    Full(T),
    /// The ring was closed.
    Closed(T),
}

impl<T> PublishError<T> {
    /// Recover the value that could not be published.
    pub fn into_inner(self) -> T {
        match self {
            PublishError::Full(v) | PublishError::Closed(v) => v,
        }
    }
}

/// One ring slot: a value cell plus the sequence stamp that coordinates
/// claim and publish.
///
/// Stamp protocol for slot `i` of a ring with capacity `cap`, lap `L`
/// starting at zero:
/// - `stamp == seq`            the slot is free for the producer claiming `seq`
/// - `stamp == seq + 1`        the slot holds the value published at `seq`
/// - `stamp == seq + cap`      the slot was consumed and is free for lap `L+1`
struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<Option<T>>,
}

/// Bounded, ordered, multi-producer multi-consumer dispatch ring.
pub struct EventRing<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    /// Next sequence a producer will claim.
    tail: AtomicU64,
    /// Next sequence a consumer will claim.
    head: AtomicU64,
    closed: AtomicBool,
    /// Woken when a slot frees.
    space: Notify,
    /// Woken when a value publishes.
    items: Notify,
}

// The UnsafeCell is only touched by the single task that won the CAS on the
// corresponding sequence, and the stamp's release/acquire pair orders the
// value write against the reader.
unsafe impl<T: Send> Send for EventRing<T> {}
unsafe impl<T: Send> Sync for EventRing<T> {}

impl<T> EventRing<T> {
    /// Create a ring with at least the requested capacity, rounded up to a
    /// power of two (minimum 2).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicU64::new(i as u64),
                value: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: (capacity - 1) as u64,
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    /// Ring capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Point-in-time count of published, unconsumed events.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    /// How far the consumer side lags the producer side. Alias for [`len`]
    /// in the vocabulary of the backpressure policy.
    ///
    /// [`len`]: EventRing::len
    #[must_use]
    pub fn lag(&self) -> usize {
        self.len()
    }

    /// Whether the ring currently holds no unconsumed events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the ring is currently at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Whether the ring has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the ring and wake every waiter.
    ///
    /// Already-published events remain consumable; new publishes fail with
    /// [`RingError::Closed`]. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.space.notify_waiters();
            self.items.notify_waiters();
        }
    }

    /// Publish an event without waiting.
    ///
    /// Returns the sequence the event was published at.
    ///
    /// # Errors
    ///
    /// Returns the value back inside [`PublishError::Full`] when the ring
    /// is at capacity, or [`PublishError::Closed`] after [`close`].
    ///
    /// [`close`]: EventRing::close
    pub fn try_publish(&self, value: T) -> Result<u64, PublishError<T>> {
        if self.is_closed() {
            return Err(PublishError::Closed(value));
        }

        let mut seq = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(seq & self.mask) as usize];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == seq {
                // Free slot for this lap; claim it.
                match self.tail.compare_exchange_weak(
                    seq,
                    seq + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Claim won: this task is the only writer of the cell
                        // until the stamp below publishes it.
                        unsafe {
                            *slot.value.get() = Some(value);
                        }
                        slot.stamp.store(seq + 1, Ordering::Release);
                        self.items.notify_one();
                        return Ok(seq);
                    }
                    Err(current) => seq = current,
                }
            } else if stamp < seq {
                // The slot still holds last lap's value: full lap behind.
                return Err(PublishError::Full(value));
            } else {
                // Another producer claimed this sequence; move on.
                seq = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Publish an event, suspending while the ring is at capacity.
    ///
    /// Returns the sequence the event was published at.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Closed`] if the ring closes before space frees.
    pub async fn publish(&self, value: T) -> Result<u64, RingError> {
        let mut pending = value;
        loop {
            match self.try_publish(pending) {
                Ok(seq) => return Ok(seq),
                Err(PublishError::Closed(_)) => return Err(RingError::Closed),
                Err(PublishError::Full(v)) => {
                    // Register for the wakeup before re-checking so a free
                    // that lands in between is not missed.
                    let notified = self.space.notified();
                    match self.try_publish(v) {
                        Ok(seq) => return Ok(seq),
                        Err(PublishError::Closed(_)) => return Err(RingError::Closed),
                        Err(PublishError::Full(v)) => {
                            pending = v;
                            notified.await;
                        }
                    }
                }
            }
        }
    }

    /// Take the next event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Empty`] if nothing is published, or
    /// [`RingError::Closed`] once the ring is closed and drained.
    pub fn try_consume(&self) -> Result<T, RingError> {
        let mut seq = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(seq & self.mask) as usize];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == seq + 1 {
                // Published slot; claim it.
                match self.head.compare_exchange_weak(
                    seq,
                    seq + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).take() };
                        // Free the slot for the producer one lap ahead.
                        slot.stamp
                            .store(seq + self.capacity() as u64, Ordering::Release);
                        self.space.notify_one();
                        match value {
                            Some(v) => return Ok(v),
                            // Unreachable by the stamp protocol.
                            None => unreachable!("published slot at sequence {seq} was empty"),
                        }
                    }
                    Err(current) => seq = current,
                }
            } else if stamp <= seq {
                // Nothing published at this sequence yet.
                return if self.is_closed() {
                    Err(RingError::Closed)
                } else {
                    Err(RingError::Empty)
                };
            } else {
                // Another consumer claimed this sequence; move on.
                seq = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Take the next event, suspending while the ring is empty.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Closed`] once the ring is closed and drained.
    pub async fn consume(&self) -> Result<T, RingError> {
        loop {
            match self.try_consume() {
                Ok(v) => return Ok(v),
                Err(RingError::Closed) => return Err(RingError::Closed),
                Err(_) => {
                    let notified = self.items.notified();
                    match self.try_consume() {
                        Ok(v) => return Ok(v),
                        Err(RingError::Closed) => return Err(RingError::Closed),
                        Err(_) => notified.await,
                    }
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for EventRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
