//! Per-key exponential backoff for failed reconciliations

use dashmap::DashMap;
use std::time::Duration;

/// Configuration for the per-key backoff
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Delay after the first failure (default: 5 milliseconds)
    pub base_delay: Duration,
    /// Upper bound on any single delay (default: 5 minutes)
    pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Tracks consecutive failures per key and hands out doubling delays
pub struct RateLimiter {
    config: RateLimiterConfig,
    failures: DashMap<String, u32>,
}

impl RateLimiter {
    pub fn new(mut config: RateLimiterConfig) -> Self {
        // a zero base would make every retry immediate
        if config.base_delay.is_zero() {
            config.base_delay = Duration::from_millis(1);
        }
        if config.max_delay < config.base_delay {
            config.max_delay = config.base_delay;
        }

        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn when(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = *entry;
        *entry = exponent.saturating_add(1);
        self.delay_for(exponent)
    }

    /// Clear the failure history for `key`
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Number of keys currently backing off
    pub fn tracked_keys(&self) -> usize {
        self.failures.len()
    }

    fn delay_for(&self, exponent: u32) -> Duration {
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        });

        let delays: Vec<Duration> = (0..6).map(|_| limiter.when("ns/x")).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
        assert_eq!(limiter.num_requeues("ns/x"), 6);
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter = RateLimiter::default();
        limiter.when("ns/x");
        limiter.when("ns/x");
        assert_eq!(limiter.num_requeues("ns/x"), 2);

        limiter.forget("ns/x");
        assert_eq!(limiter.num_requeues("ns/x"), 0);
        assert_eq!(limiter.when("ns/x"), Duration::from_millis(5));
    }

    #[test]
    fn test_keys_back_off_independently() {
        let limiter = RateLimiter::default();
        limiter.when("ns/a");
        limiter.when("ns/a");
        assert_eq!(limiter.when("ns/b"), Duration::from_millis(5));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_huge_exponent_saturates_at_cap() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.delay_for(200), Duration::from_secs(300));
    }

    #[test]
    fn test_zero_base_is_clamped_positive() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        });
        assert!(limiter.when("ns/x") > Duration::ZERO);
    }
}
