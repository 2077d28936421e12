//! Exponential backoff for sync retries.

use std::time::Duration;

use rand::Rng;

use crate::domain::RetryConfig;

/// Delay before retry number `attempt` (1-based). Attempt 0 has no delay.
#[must_use]
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    // factors below 1.0 and NaN count as 1.0
    let multiplier = if config.multiplier >= 1.0 {
        config.multiplier
    } else {
        1.0
    };
    let max_ms = config.max_delay_ms as f64;
    let base_ms = config.initial_delay_ms as f64 * multiplier.powi(exponent);
    let delay_ms = if base_ms.is_finite() {
        base_ms.clamp(0.0, max_ms)
    } else {
        max_ms
    };

    if config.jitter {
        // up to 25% on top
        let jitter = delay_ms * 0.25 * rand::thread_rng().gen::<f64>();
        Duration::from_secs_f64((delay_ms + jitter) / 1000.0)
    } else {
        Duration::from_secs_f64(delay_ms / 1000.0)
    }
}

/// Attempt counter that grows the delay until reset by a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    /// Start with no failures recorded.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failure and return the delay before the next try.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        delay_for_attempt(&self.config, self.attempt)
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let config = no_jitter();
        assert_eq!(delay_for_attempt(&config, 0), Duration::ZERO);
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&config, 4), Duration::from_secs(8));
        assert_eq!(delay_for_attempt(&config, 9), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..no_jitter()
        };
        for _ in 0..50 {
            let delay = delay_for_attempt(&config, 2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2_500));
        }
    }

    #[test]
    fn test_bad_multiplier_does_not_shrink_or_panic() {
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = RetryConfig {
                multiplier,
                ..no_jitter()
            };
            let mut previous = Duration::ZERO;
            for attempt in 1..40 {
                let delay = delay_for_attempt(&config, attempt);
                assert!(delay >= previous, "multiplier {multiplier} attempt {attempt}");
                assert!(delay <= Duration::from_secs(10));
                previous = delay;
            }
            assert!(previous >= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
