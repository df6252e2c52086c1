//! Token-bucket pacing for the read loop.
//!
//! The bucket refills every 250ms with a quarter of the configured
//! per-second rate, and reads are sized against the remaining quota before
//! they are issued. The rate itself lives in an atomic shared with the
//! connection handle so it can be changed while a request is in flight;
//! setting it to zero lifts the constraint without disarming a tick that
//! is already pending.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Interval};

const TICK: Duration = Duration::from_millis(250);

pub(crate) struct RateLimiter {
    rate: Arc<AtomicUsize>,
    quota: usize,
    timer: Option<Interval>,
}

impl RateLimiter {
    pub(crate) fn new(rate: Arc<AtomicUsize>) -> Self {
        Self {
            rate,
            quota: 0,
            timer: None,
        }
    }

    fn rate(&self) -> usize {
        self.rate.load(Ordering::Relaxed)
    }

    /// Cap a read request at the remaining quota. Unlimited when no rate is
    /// configured.
    pub(crate) fn clamp(&self, want: usize) -> usize {
        if self.rate() == 0 {
            want
        } else {
            want.min(self.quota)
        }
    }

    /// True when the next read must wait for a refill.
    pub(crate) fn exhausted(&self) -> bool {
        self.rate() > 0 && self.quota == 0
    }

    /// Account for bytes handed back by a completed read.
    pub(crate) fn consume(&mut self, bytes: usize) {
        if self.rate() > 0 {
            self.quota = self.quota.saturating_sub(bytes);
        }
    }

    /// Wait for the next tick and grant a quarter-second of budget. The
    /// first call arms the timer and grants immediately.
    pub(crate) async fn refill(&mut self) {
        let timer = self.timer.get_or_insert_with(|| interval(TICK));
        timer.tick().await;
        self.quota = self.rate() / 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn limiter(rate: usize) -> RateLimiter {
        RateLimiter::new(Arc::new(AtomicUsize::new(rate)))
    }

    #[tokio::test]
    async fn unlimited_when_rate_is_zero() {
        let limiter = limiter(0);
        assert_eq!(limiter.clamp(4096), 4096);
        assert!(!limiter.exhausted());
    }

    #[tokio::test]
    async fn first_refill_is_immediate() {
        let mut limiter = limiter(4000);
        assert!(limiter.exhausted());

        let before = Instant::now();
        limiter.refill().await;
        assert!(before.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.clamp(4096), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_is_consumed_and_refilled_per_tick() {
        let mut limiter = limiter(4000);
        limiter.refill().await;
        limiter.consume(600);
        assert_eq!(limiter.clamp(4096), 400);
        limiter.consume(400);
        assert!(limiter.exhausted());

        let before = Instant::now();
        limiter.refill().await;
        assert_eq!(before.elapsed(), TICK);
        assert_eq!(limiter.clamp(4096), 1000);
    }

    #[tokio::test]
    async fn raising_the_rate_applies_at_next_refill() {
        let mut limiter = limiter(4000);
        limiter.refill().await;
        limiter.rate.store(8000, Ordering::Relaxed);
        assert_eq!(limiter.clamp(4096), 1000);
        limiter.consume(1000);
        limiter.refill().await;
        assert_eq!(limiter.clamp(4096), 2000);
    }
}
