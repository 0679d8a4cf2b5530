//! Exponential backoff schedule

use rand::Rng;
use std::time::Duration;

/// Exponent cap, keeps `2^attempt` from overflowing
const MAX_EXPONENT: u32 = 16;

/// `min(base * 2^attempt, max)` with symmetric jitter
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `[0, 1]` of the delay to randomize by
    pub jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay for `attempt` without jitter
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for `attempt` with jitter applied, never above `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_doubles_until_cap() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_secs(60),
            0.0,
        );
        assert_eq!(backoff.nominal(0), Duration::from_millis(500));
        assert_eq!(backoff.nominal(1), Duration::from_millis(1000));
        assert_eq!(backoff.nominal(3), Duration::from_millis(4000));
        assert_eq!(backoff.nominal(7), Duration::from_secs(60));
        assert_eq!(backoff.nominal(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(1000),
            Duration::from_secs(60),
            0.2,
        );
        for _ in 0..100 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_millis(1600), "{d:?}");
            assert!(d <= Duration::from_millis(2400), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            1.0,
        );
        for _ in 0..100 {
            assert!(backoff.delay(10) <= Duration::from_secs(4));
        }
    }
}
