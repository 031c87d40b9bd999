//! Process-global REST rate-limit state: the account-wide request window
//! and the invalid-request circuit breaker.

use futures_util::future::Shared;
use futures_util::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type SharedSleep = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Account-wide request accounting plus the coalesced delay shared by
/// everything waiting out a global window.
#[derive(Debug)]
pub struct GlobalLimiter {
    limit: u32,
    inner: Mutex<GlobalInner>,
    timers_armed: AtomicU32,
}

struct GlobalInner {
    remaining: u32,
    reset_at_ms: i64,
    /// One sleep future per global window, shared by every waiter.
    delay: Option<(i64, SharedSleep)>,
}

impl std::fmt::Debug for GlobalInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalInner")
            .field("remaining", &self.remaining)
            .field("reset_at_ms", &self.reset_at_ms)
            .field("delay_armed", &self.delay.is_some())
            .finish()
    }
}

impl GlobalLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            inner: Mutex::new(GlobalInner { remaining: limit.max(1), reset_at_ms: 0, delay: None }),
            timers_armed: AtomicU32::new(0),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Milliseconds until the global window opens, or `None` when the
    /// request may proceed. Webhook calls bypass global accounting.
    pub fn wait_needed_ms(&self, now_unix_ms: i64, webhook: bool) -> Option<u64> {
        if webhook {
            return None;
        }
        let inner = self.lock();
        if inner.remaining == 0 && now_unix_ms < inner.reset_at_ms {
            Some((inner.reset_at_ms - now_unix_ms) as u64)
        } else {
            None
        }
    }

    /// Account for a request about to go out, refreshing the one-second
    /// window when it lapsed.
    pub fn consume(&self, now_unix_ms: i64, webhook: bool) {
        if webhook {
            return;
        }
        let mut inner = self.lock();
        if inner.reset_at_ms < now_unix_ms {
            inner.reset_at_ms = now_unix_ms + 1_000;
            inner.remaining = self.limit;
        }
        inner.remaining = inner.remaining.saturating_sub(1);
    }

    /// A 429 told us the account is globally limited until `until_ms`.
    pub fn mark_limited_until(&self, until_ms: i64) {
        let mut inner = self.lock();
        inner.remaining = 0;
        if until_ms > inner.reset_at_ms {
            inner.reset_at_ms = until_ms;
        }
    }

    /// Sleep until the global window opens. Concurrent waiters share one
    /// timer; whoever arrives first arms it.
    pub async fn wait_for_reset(&self, now_unix_ms: i64) {
        let sleep = {
            let mut inner = self.lock();
            let reset_at = inner.reset_at_ms;
            if now_unix_ms >= reset_at {
                inner.delay = None;
                return;
            }
            let reusable = match inner.delay.as_ref() {
                Some((until, existing)) if *until >= reset_at => Some(existing.clone()),
                _ => None,
            };
            match reusable {
                Some(existing) => existing,
                None => {
                    let wait = Duration::from_millis((reset_at - now_unix_ms) as u64);
                    let fresh: SharedSleep = (Box::pin(tokio::time::sleep(wait))
                        as Pin<Box<dyn Future<Output = ()> + Send>>)
                        .shared();
                    self.timers_armed.fetch_add(1, Ordering::Relaxed);
                    inner.delay = Some((reset_at, fresh.clone()));
                    fresh
                }
            }
        };
        sleep.await;
    }

    #[cfg(test)]
    fn timers_armed(&self) -> u32 {
        self.timers_armed.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GlobalInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rolling window of the invalid-request counter.
const INVALID_WINDOW_MS: i64 = 10 * 60 * 1_000;

/// Process-wide invalid-request circuit breaker.
///
/// Counts 401, 403, and non-shared 429 responses in ten-minute windows
/// and answers with escalating penalty sleeps as the count climbs. This
/// is intentionally a process global (the service bans by origin, not by
/// client instance); [`InvalidRequestTracker::reset`] exists so tests
/// stay deterministic.
#[derive(Debug)]
pub struct InvalidRequestTracker {
    count: AtomicU32,
    reset_at_ms: AtomicI64,
}

/// The shared process-wide tracker.
pub static INVALID_REQUESTS: InvalidRequestTracker = InvalidRequestTracker::new();

impl InvalidRequestTracker {
    pub const fn new() -> Self {
        Self { count: AtomicU32::new(0), reset_at_ms: AtomicI64::new(0) }
    }

    /// Record one invalid request, rolling the window when it lapsed.
    /// Returns the count inside the current window.
    pub fn register(&self, now_unix_ms: i64) -> u32 {
        if now_unix_ms >= self.reset_at_ms.load(Ordering::Acquire) {
            self.reset_at_ms.store(now_unix_ms + INVALID_WINDOW_MS, Ordering::Release);
            self.count.store(0, Ordering::Release);
        }
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Milliseconds until the window rolls over.
    pub fn remaining_ms(&self, now_unix_ms: i64) -> u64 {
        (self.reset_at_ms.load(Ordering::Acquire) - now_unix_ms).max(0) as u64
    }

    /// The penalty sleep for a given count, escalating through three
    /// tiers.
    pub fn penalty(count: u32) -> Option<Duration> {
        match count {
            c if c >= 9_000 => Some(Duration::from_millis(5_000)),
            c if c >= 5_000 => Some(Duration::from_millis(1_500)),
            c if c >= 2_500 => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    /// Test hook: zero the counter and window.
    #[doc(hidden)]
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
        self.reset_at_ms.store(0, Ordering::Release);
    }
}

impl Default for InvalidRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn requests_proceed_until_the_window_drains() {
        let limiter = GlobalLimiter::new(3);
        let now = 1_000_000;

        assert_eq!(limiter.wait_needed_ms(now, false), None);
        limiter.consume(now, false);
        limiter.consume(now, false);
        limiter.consume(now, false);

        let wait = limiter.wait_needed_ms(now, false).expect("drained");
        assert!(wait > 0 && wait <= 1_000);
    }

    #[test]
    fn window_refreshes_after_reset_passes() {
        let limiter = GlobalLimiter::new(2);
        limiter.consume(0, false);
        limiter.consume(0, false);
        assert!(limiter.wait_needed_ms(500, false).is_some());

        // Past the reset, accounting starts over.
        assert_eq!(limiter.wait_needed_ms(1_001, false), None);
        limiter.consume(1_001, false);
        assert_eq!(limiter.wait_needed_ms(1_001, false), None);
    }

    #[test]
    fn webhooks_bypass_global_accounting() {
        let limiter = GlobalLimiter::new(1);
        limiter.consume(0, false);
        assert!(limiter.wait_needed_ms(10, false).is_some());
        assert_eq!(limiter.wait_needed_ms(10, true), None);

        // Webhook consumption is a no-op.
        limiter.consume(10, true);
        assert!(limiter.wait_needed_ms(10, true).is_none());
    }

    #[test]
    fn global_429_extends_the_window() {
        let limiter = GlobalLimiter::new(50);
        limiter.mark_limited_until(5_000);
        assert_eq!(limiter.wait_needed_ms(3_000, false), Some(2_000));
    }

    #[tokio::test]
    async fn concurrent_waiters_share_one_timer() {
        let limiter = Arc::new(GlobalLimiter::new(50));
        let now = 1_000;
        limiter.mark_limited_until(now + 50);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            tasks.push(tokio::spawn(async move {
                limiter.wait_for_reset(now).await;
            }));
        }
        for task in tasks {
            task.await.expect("waiter finished");
        }

        assert_eq!(limiter.timers_armed(), 1, "waiters must share a single timer");
    }

    #[tokio::test]
    async fn wait_is_a_noop_once_the_window_passed() {
        let limiter = GlobalLimiter::new(50);
        limiter.mark_limited_until(100);
        // `now` is already past the reset.
        limiter.wait_for_reset(5_000).await;
        assert_eq!(limiter.wait_needed_ms(5_000, false), None);
    }

    #[test]
    fn tracker_counts_within_one_window() {
        let tracker = InvalidRequestTracker::new();
        assert_eq!(tracker.register(0), 1);
        assert_eq!(tracker.register(1), 2);
        assert_eq!(tracker.count(), 2);
        assert_eq!(tracker.remaining_ms(1), (INVALID_WINDOW_MS - 1) as u64);
    }

    #[test]
    fn tracker_window_rolls_over() {
        let tracker = InvalidRequestTracker::new();
        for _ in 0..10 {
            tracker.register(0);
        }
        assert_eq!(tracker.count(), 10);

        // Past the window, the count starts over.
        assert_eq!(tracker.register(INVALID_WINDOW_MS + 1), 1);
    }

    #[test]
    fn penalty_tiers_escalate() {
        assert_eq!(InvalidRequestTracker::penalty(0), None);
        assert_eq!(InvalidRequestTracker::penalty(2_499), None);
        assert_eq!(InvalidRequestTracker::penalty(2_500), Some(Duration::from_millis(500)));
        assert_eq!(InvalidRequestTracker::penalty(4_999), Some(Duration::from_millis(500)));
        assert_eq!(InvalidRequestTracker::penalty(5_000), Some(Duration::from_millis(1_500)));
        assert_eq!(InvalidRequestTracker::penalty(8_999), Some(Duration::from_millis(1_500)));
        assert_eq!(InvalidRequestTracker::penalty(9_000), Some(Duration::from_millis(5_000)));
        assert_eq!(InvalidRequestTracker::penalty(u32::MAX), Some(Duration::from_millis(5_000)));
    }

    #[test]
    fn tracker_reset_hook_clears_state() {
        let tracker = InvalidRequestTracker::new();
        tracker.register(0);
        tracker.reset();
        assert_eq!(tracker.count(), 0);
        assert_eq!(tracker.register(0), 1);
    }
}
