//! Abstraction for sleeping/waiting.
//!
//! The REST handler spends most of its life waiting: on bucket resets, on
//! global windows, on retry backoff, on circuit-breaker penalties. Routing
//! every wait through [`Sleeper`] keeps those paths testable without real
//! time delays.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping/waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper using the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that records every requested duration and returns
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every duration requested so far, in call order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Sum of all requested durations.
    pub fn total(&self) -> Duration {
        self.recorded().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sleeper_returns_immediately() {
        let sleeper = RecordingSleeper::new();
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn recording_sleeper_tracks_calls_in_order() {
        let sleeper = RecordingSleeper::new();

        sleeper.sleep(Duration::from_millis(125)).await;
        sleeper.sleep(Duration::from_millis(250)).await;

        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_millis(125), Duration::from_millis(250)]
        );
        assert_eq!(sleeper.total(), Duration::from_millis(375));
    }

    #[tokio::test]
    async fn tokio_sleeper_actually_sleeps() {
        let sleeper = TokioSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_millis(50)).await;
        // Small tolerance for timer granularity.
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
