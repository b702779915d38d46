//! Retry policy for transient analyzer errors.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use triage_core::ErrorKind;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry bound.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base and maximum delay.
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Whether an attempt that failed with `kind` should be followed by
    /// another one. `attempts` counts invocations made so far.
    pub fn should_retry(&self, kind: ErrorKind, attempts: u32) -> bool {
        kind.is_retryable() && attempts <= self.max_retries
    }

    /// Delay before retry number `retry` (0 for the first retry):
    /// `base * 2^retry`, capped at the maximum.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(6), Duration::from_millis(5_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_only_transient_errors_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorKind::Transient, 1));
        assert!(policy.should_retry(ErrorKind::Transient, 3));
        assert!(!policy.should_retry(ErrorKind::Transient, 4));
        assert!(!policy.should_retry(ErrorKind::Input, 1));
        assert!(!policy.should_retry(ErrorKind::Timeout, 1));
        assert!(!RetryPolicy::none().should_retry(ErrorKind::Transient, 1));
    }

    #[test]
    fn test_partial_config() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 100);
    }
}
