//! Clock abstractions used by the send scheduler and rate-limit bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// The scheduler only needs a monotonic millisecond reading; rate-limit
/// bookkeeping also compares against the server's wall clock, so both views
/// are exposed.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed on a monotonic timeline.
    fn now_millis(&self) -> u64;

    /// Milliseconds since the unix epoch.
    fn unix_millis(&self) -> i64;
}

/// Production clock: monotonic reading backed by `Instant::now()`, wall
/// reading backed by `SystemTime::now()`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn unix_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Test clock advanced by hand.
///
/// The unix reading tracks the monotonic reading from a fixed epoch offset
/// so skew-sensitive code sees a consistent timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    unix_base: i64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Start the monotonic timeline at `millis`.
    pub fn starting_at(millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(millis)), unix_base: 1_700_000_000_000 }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn unix_millis(&self) -> i64 {
        self.unix_base + self.now.load(Ordering::SeqCst) as i64
    }
}
