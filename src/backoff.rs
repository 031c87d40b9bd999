//! Backoff schedules for REST retries and gateway reconnects.

use crate::jitter::Jitter;
use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with jitter.
///
/// The delay for attempt `n` is `min(cap, base << min(n, max_exponent))`
/// plus the configured jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    base: Duration,
    cap: Duration,
    max_exponent: u32,
    jitter: Jitter,
}

impl RetryBackoff {
    pub fn new(base: Duration, cap: Duration, max_exponent: u32, jitter: Jitter) -> Self {
        Self { base, cap, max_exponent, jitter }
    }

    /// Schedule for requests rejected with 429: 125 ms doubling up to 1.5 s,
    /// with up to 20 % extra jitter.
    pub fn ratelimited() -> Self {
        Self::new(
            Duration::from_millis(125),
            Duration::from_millis(1_500),
            5,
            Jitter::Proportional(0.2),
        )
    }

    /// Schedule for 5xx responses and transport errors: 200 ms doubling up
    /// to 3 s, with up to 20 % extra jitter.
    pub fn server_error() -> Self {
        Self::new(
            Duration::from_millis(200),
            Duration::from_millis(3_000),
            5,
            Jitter::Proportional(0.2),
        )
    }

    /// Schedule for gateway reconnect attempts: 1 s doubling up to 60 s.
    pub fn reconnect() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            6,
            Jitter::Proportional(0.25),
        )
    }

    /// Delay before retry number `retries` (0-indexed).
    pub fn delay(&self, retries: u32) -> Duration {
        self.delay_with_rng(retries, &mut rand::thread_rng())
    }

    /// Deterministic variant of [`delay`](Self::delay).
    pub fn delay_with_rng<R: Rng>(&self, retries: u32, rng: &mut R) -> Duration {
        let exponent = retries.min(self.max_exponent);
        let multiplier = 2u32.saturating_pow(exponent);
        let raw = self
            .base
            .checked_mul(multiplier)
            .unwrap_or(self.cap)
            .min(self.cap);
        self.jitter.apply_with_rng(raw, rng)
    }
}
