//! Jitter strategies for randomizing delays.
//!
//! Every delay in the protocol that could synchronize across clients gets
//! jitter: the first heartbeat lands somewhere inside the interval, the
//! invalid-session pause is drawn from a range, and retry backoff carries a
//! proportional fudge so a fleet of handlers does not stampede the API the
//! instant a window expires.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy applied to a base delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact delay.
    None,
    /// Random between 0 and the delay. Used for the first heartbeat, which
    /// must land uniformly inside the interval.
    Full,
    /// The delay plus a random extra of up to `fraction` of it.
    Proportional(f64),
}

impl Jitter {
    /// Apply jitter using the thread RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.gen_range(0..millis))
            }
            Jitter::Proportional(fraction) => {
                let extra_max = (millis as f64 * fraction) as u64;
                if extra_max == 0 {
                    return delay;
                }
                Duration::from_millis(millis + rng.gen_range(0..=extra_max))
            }
        }
    }
}

/// Uniform draw from `[lo, hi)` milliseconds. Covers the delays the
/// protocol specifies as ranges, like the pause before re-identifying
/// after a non-resumable invalid session.
pub fn range_millis(lo: u64, hi: u64) -> Duration {
    range_millis_with_rng(lo, hi, &mut rand::thread_rng())
}

/// Deterministic variant of [`range_millis`].
pub fn range_millis_with_rng<R: Rng>(lo: u64, hi: u64, rng: &mut R) -> Duration {
    if hi <= lo {
        return Duration::from_millis(lo);
    }
    Duration::from_millis(rng.gen_range(lo..hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn full_stays_below_delay() {
        let delay = Duration::from_millis(41_250);
        for _ in 0..100 {
            let jittered = Jitter::Full.apply(delay);
            assert!(jittered < delay);
        }
    }

    #[test]
    fn proportional_stays_within_fraction() {
        let delay = Duration::from_millis(1_000);
        let jitter = Jitter::Proportional(0.2);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn zero_delay_is_preserved() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Proportional(0.2).apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn full_is_deterministic_with_seeded_rng() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(45_000);
        assert_eq!(
            Jitter::Full.apply_with_rng(delay, &mut a),
            Jitter::Full.apply_with_rng(delay, &mut b)
        );
    }

    #[test]
    fn range_draw_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let d = range_millis_with_rng(1_000, 5_000, &mut rng);
            assert!(d >= Duration::from_millis(1_000));
            assert!(d < Duration::from_millis(5_000));
        }
    }

    #[test]
    fn degenerate_range_returns_lower_bound() {
        assert_eq!(range_millis(500, 500), Duration::from_millis(500));
        assert_eq!(range_millis(500, 100), Duration::from_millis(500));
    }
}
