//! Token-bucket pacing for the paced driver loop.
//!
//! The bucket holds at most one token, so tokens are handed out at a steady
//! interval of `1 / rate` seconds and no burst credit accrues while the
//! driver is busy elsewhere. Burstiness, when wanted, comes from bypassing
//! the limiter entirely.
//!
//! `set_limit` and `limit` are lock-free (the rate is an `f64` bit-cast into
//! an `AtomicU64`) and a new rate applies to every subsequent [`wait`].
//! Waiters serialize only long enough to claim a time slot; the sleep itself
//! happens outside the lock, so concurrent waiters receive consecutive
//! slots. A rate of zero parks the waiter forever — callers race `wait`
//! against their stop signal in a `select!`.
//!
//! [`wait`]: RateLimiter::wait

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Cap on the computed token interval: pathologically small positive rates
/// must not overflow `Duration`.
const MAX_TOKEN_INTERVAL_SECS: f64 = u32::MAX as f64;

pub struct RateLimiter {
    rate_bits: AtomicU64,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            rate_bits: AtomicU64::new(rate.to_bits()),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Current rate in tokens per second.
    pub fn limit(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Relaxed))
    }

    /// Replace the rate. Takes effect for the next `wait`.
    pub fn set_limit(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Relaxed);
    }

    /// Wait until a token is available and consume it.
    pub async fn wait(&self) {
        let rate = self.limit();
        if rate <= 0.0 {
            std::future::pending::<()>().await;
        }
        let at = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let at = (*next).max(now);
            let interval = Duration::from_secs_f64((1.0 / rate).min(MAX_TOKEN_INTERVAL_SECS));
            *next = at + interval;
            at
        };
        tokio::time::sleep_until(at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_limit_is_visible_immediately() {
        let limiter = RateLimiter::new(1.0);
        assert_eq!(limiter.limit(), 1.0);
        limiter.set_limit(250.5);
        assert_eq!(limiter.limit(), 250.5);
    }

    #[tokio::test]
    async fn waits_pace_out_at_the_configured_rate() {
        let limiter = RateLimiter::new(100.0);
        let started = Instant::now();
        for _ in 0..5 {
            limiter.wait().await;
        }
        // First token is free, the remaining four cost 10ms each.
        assert!(started.elapsed() >= Duration::from_millis(35));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn zero_rate_parks_the_waiter() {
        let limiter = RateLimiter::new(0.0);
        let parked = tokio::time::timeout(Duration::from_millis(50), limiter.wait()).await;
        assert!(parked.is_err());
    }

    #[tokio::test]
    async fn vanishingly_small_rate_clamps_instead_of_panicking() {
        let limiter = RateLimiter::new(1e-20);
        // The first token is free; claiming it computes the (clamped)
        // interval for the next slot.
        limiter.wait().await;
        // The next slot is the full clamped interval away, so the waiter
        // just parks.
        let parked = tokio::time::timeout(Duration::from_millis(50), limiter.wait()).await;
        assert!(parked.is_err());
    }

    #[tokio::test]
    async fn raised_rate_speeds_up_subsequent_waits() {
        let limiter = RateLimiter::new(2.0);
        limiter.wait().await;
        limiter.set_limit(10_000.0);
        // The slot claimed under the old rate still applies once, then the
        // new interval takes over; the whole sequence stays well under the
        // old 500ms-per-token pace.
        let started = Instant::now();
        limiter.wait().await;
        for _ in 0..10 {
            limiter.wait().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
