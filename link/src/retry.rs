//! Retry policy for operations that may fail transiently.
//!
//! The link itself never retries. The policy is used by the token renewer
//! when acquiring tokens and by owners that re-create links after a
//! transient [`LinkError`](crate::common::LinkError).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fraction of the base delay added as random jitter.
const JITTER_FACTOR: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    Fixed,
    #[default]
    Exponential,
}

/// Retry settings, deserializable from the `retry` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Base delay between attempts (milliseconds)
    pub delay_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Time allowed for one attempt (seconds)
    pub try_timeout_secs: u64,
    pub mode: RetryMode,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 800,
            max_delay_ms: 60_000,
            try_timeout_secs: 60,
            mode: RetryMode::Exponential,
        }
    }
}

impl RetryOptions {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn try_timeout(&self) -> Duration {
        Duration::from_secs(self.try_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub fn max_retries(&self) -> u32 {
        self.options.max_retries
    }

    /// Delay before retry number `retry_count` (0 for the first retry).
    ///
    /// Returns `None` when the failure is not transient or retries are
    /// exhausted.
    pub fn calculate_retry_delay(&self, transient: bool, retry_count: u32) -> Option<Duration> {
        if !transient || retry_count >= self.options.max_retries {
            return None;
        }

        let base = self.base_delay(retry_count);
        let jitter_ms = (self.options.delay_ms as f64 * JITTER_FACTOR) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        Some((base + jitter).min(self.options.max_delay()))
    }

    fn base_delay(&self, retry_count: u32) -> Duration {
        match self.options.mode {
            RetryMode::Fixed => self.options.delay(),
            RetryMode::Exponential => {
                let factor = 2u64.saturating_pow(retry_count);
                Duration::from_millis(self.options.delay_ms.saturating_mul(factor))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: RetryMode) -> RetryPolicy {
        RetryPolicy::new(RetryOptions {
            max_retries: 3,
            delay_ms: 1000,
            max_delay_ms: 3000,
            try_timeout_secs: 60,
            mode,
        })
    }

    #[test]
    fn test_non_transient_is_never_retried() {
        assert_eq!(policy(RetryMode::Fixed).calculate_retry_delay(false, 0), None);
    }

    #[test]
    fn test_exhausted_after_max_retries() {
        let policy = policy(RetryMode::Fixed);
        assert!(policy.calculate_retry_delay(true, 2).is_some());
        assert_eq!(policy.calculate_retry_delay(true, 3), None);
    }

    #[test]
    fn test_exponential_grows_and_is_capped() {
        let policy = policy(RetryMode::Exponential);
        let first = policy.calculate_retry_delay(true, 0).unwrap();
        let second = policy.calculate_retry_delay(true, 1).unwrap();
        let third = policy.calculate_retry_delay(true, 2).unwrap();

        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1080));
        assert!(second >= Duration::from_millis(2000) && second <= Duration::from_millis(2080));
        assert_eq!(third, Duration::from_millis(3000));
    }

    #[test]
    fn test_fixed_stays_flat() {
        let policy = policy(RetryMode::Fixed);
        let delay = policy.calculate_retry_delay(true, 2).unwrap();
        assert!(delay >= Duration::from_millis(1000) && delay <= Duration::from_millis(1080));
    }
}
