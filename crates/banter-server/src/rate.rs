//! Inbound message rate limiting.
//!
//! A fixed-interval limiter: each permit reserves the next allowed slot
//! with a compare-and-swap, so the acquired rate never exceeds the
//! configured permits per second even under concurrent callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A fixed-rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    interval_ns: u64,
    start: Instant,
    next_allowed_ns: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter allowing `permits_per_second` acquisitions per
    /// second. A zero rate is clamped to one permit per second.
    #[must_use]
    pub fn per_second(permits_per_second: u64) -> Self {
        let permits = permits_per_second.max(1);
        let interval_ns = (1_000_000_000 / permits).max(1);
        Self {
            interval_ns,
            start: Instant::now(),
            next_allowed_ns: AtomicU64::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Try to take a permit without waiting.
    ///
    /// # Errors
    ///
    /// Returns how long the caller would have to wait for the reserved
    /// slot. The slot stays reserved, so a caller that sleeps the returned
    /// duration and proceeds is correctly paced.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut now;
        let mut next;
        let mut base;
        loop {
            now = self.now_ns();
            next = self.next_allowed_ns.load(Ordering::Relaxed);
            base = next.max(now);
            let new_next = base + self.interval_ns;
            if self
                .next_allowed_ns
                .compare_exchange_weak(next, new_next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        let wait_ns = base.saturating_sub(now);
        if wait_ns == 0 {
            Ok(())
        } else {
            Err(Duration::from_nanos(wait_ns))
        }
    }

    /// Take a permit, sleeping until the reserved slot arrives.
    pub async fn acquire(&self) {
        if let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }
}
