//! Runtime configuration.
//!
//! Every knob has a default; `from_env` overrides them from `GIFTLIST_*`
//! variables and ignores values that do not parse.

use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;

/// Bounded retry for optimistic commits that lose to a concurrent writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 25,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the first retry waits one base interval.
    pub fn delay_for_attempt(&self, attempt: usize) -> StdDuration {
        StdDuration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiftlistConfig {
    pub retry: RetryPolicy,
    /// Buffered change notifications per store before slow feed
    /// subscribers lag and re-snapshot.
    pub feed_capacity: usize,
    /// How long a visitor's chosen display name is remembered.
    pub visitor_name_ttl: Duration,
}

impl Default for GiftlistConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            feed_capacity: 256,
            visitor_name_ttl: Duration::days(365),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl GiftlistConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry: RetryPolicy {
                max_attempts: env_parse("GIFTLIST_RETRY_MAX_ATTEMPTS")
                    .filter(|attempts: &usize| *attempts > 0)
                    .unwrap_or(defaults.retry.max_attempts),
                base_backoff_ms: env_parse("GIFTLIST_RETRY_BACKOFF_MS")
                    .unwrap_or(defaults.retry.base_backoff_ms),
            },
            feed_capacity: env_parse("GIFTLIST_FEED_CAPACITY")
                .filter(|capacity: &usize| *capacity > 0)
                .unwrap_or(defaults.feed_capacity),
            visitor_name_ttl: env_parse("GIFTLIST_VISITOR_NAME_TTL_DAYS")
                .map(Duration::days)
                .unwrap_or(defaults.visitor_name_ttl),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), StdDuration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), StdDuration::from_millis(50));
    }

    #[test]
    fn test_defaults() {
        let config = GiftlistConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.feed_capacity, 256);
        assert_eq!(config.visitor_name_ttl, Duration::days(365));
    }
}
