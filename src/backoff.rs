//! Backoff delay functions
//!
//! A backoff maps a 1-based attempt number to the pause before that
//! attempt. Recovery probing consults it once per scheduler iteration.

use std::time::Duration;

use rand::Rng;

/// Pure function from attempt number to delay.
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay for every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay before the first attempt.
    pub base: Duration,
    /// Upper bound on any delay (before jitter).
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1)`: each delay is scaled by a random
    /// factor in `1 ± jitter`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl ExponentialBackoff {
    /// Exponent cap; beyond it the delay has long since saturated at
    /// `max`.
    const MAX_EXPONENT: u32 = 63;
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(Self::MAX_EXPONENT);
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_attempt() {
        let backoff = ConstantBackoff(Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(5));
        assert_eq!(backoff.delay(100), Duration::from_millis(5));
    }

    #[test]
    fn exponential_doubles_from_base() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_caps_at_max() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(backoff.delay(20), Duration::from_secs(1));
        // Far past the exponent cap: still finite, still capped.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_band() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 1.0,
            jitter: 0.3,
        };
        for _ in 0..100 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_millis(70));
            assert!(d <= Duration::from_millis(130));
        }
    }
}
