//! Backoff policy for transient publish failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for requeued events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How many times a transiently failing event is attempted, and how long to
/// wait between attempts.
///
/// `max_attempts` counts publish attempts, the first one included. With
/// `max_attempts <= 1` every failure is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on any computed delay, jitter included.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Every failure marks the event failed.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // Cap the exponent; 2^30 * base is past any sane max_delay.
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
        }
        .min(max_ms);

        // Deterministic spread so events that failed together do not all come back together.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Whether an event that has failed `attempts` times gets another attempt.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn defaults_match_relay_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn exponential_doubles_until_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1))
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(1));
    }

    #[test]
    fn linear_and_fixed() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(3));
    }

    #[test]
    fn no_retry_makes_every_failure_terminal() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn should_retry_counts_total_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_max(
            attempt in 0u32..10_000,
            base_ms in 0u64..10_000,
            max_ms in 0u64..120_000,
            jitter in 0.0f64..1.0,
        ) {
            let policy = RetryPolicy {
                jitter,
                ..RetryPolicy::exponential(5, Duration::from_millis(base_ms), Duration::from_millis(max_ms))
            };
            prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(max_ms));
        }

        #[test]
        fn exponential_without_jitter_is_monotonic(attempt in 1u32..64) {
            let policy = RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::exponential(5, Duration::from_millis(50), Duration::from_secs(60))
            };
            prop_assert!(policy.delay_for_attempt(attempt) <= policy.delay_for_attempt(attempt + 1));
        }
    }
}
