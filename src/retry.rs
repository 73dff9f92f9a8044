use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5,
            max_delay_ms: 50,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// Full-jitter delay: uniform in `[0, delay_for_attempt(attempt)]`.
    ///
    /// Many waiters on one key would otherwise wake in lockstep.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_for_attempt(attempt);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_millis(ms)
    }

    /// Total number of attempts this config allows (first try plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 10,
            max_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(1), 10);
        assert_eq!(config.delay_for_attempt(2), 20);
        assert_eq!(config.delay_for_attempt(3), 40);
        assert_eq!(config.delay_for_attempt(4), 80);
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig::new(10, 5, 50);
        assert_eq!(config.delay_for_attempt(4), 40);
        assert_eq!(config.delay_for_attempt(5), 50);
        assert_eq!(config.delay_for_attempt(60), 50);
    }

    #[test]
    fn zero_base_never_sleeps() {
        let config = RetryConfig::new(3, 0, 50);
        assert_eq!(config.jittered_delay(3), Duration::ZERO);
    }

    #[test]
    fn max_attempts_counts_first_try() {
        assert_eq!(RetryConfig::new(0, 1, 1).max_attempts(), 1);
        assert_eq!(RetryConfig::new(3, 1, 1).max_attempts(), 4);
        assert_eq!(RetryConfig::new(u32::MAX, 1, 1).max_attempts(), u32::MAX);
    }

    proptest! {
        #[test]
        fn jitter_stays_within_ceiling(base in 0u64..100, cap in 0u64..500, attempt in 0u32..80) {
            let config = RetryConfig::new(3, base, cap);
            let delay = config.jittered_delay(attempt);
            prop_assert!(delay <= Duration::from_millis(config.delay_for_attempt(attempt)));
            prop_assert!(config.delay_for_attempt(attempt) <= cap);
        }
    }
}
