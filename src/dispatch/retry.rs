//! Retry policy for destination executions
//!
//! Provides exponential backoff and error classification.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Execution retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after the initial attempt
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given retry (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether a request that has made `attempts` attempts may be retried.
    /// A request makes at most `max_retries + 1` attempts.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Earliest time the next attempt may start after `attempts` failures
    pub fn next_retry_after(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let backoff = self.backoff_for_attempt(attempts.saturating_sub(1));
        now + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// Classifies RPC and submission errors
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Endpoint-level failure (timeout, network, rate limit)
    Transient,
    /// The node answered and rejected the call
    Permanent,
    Unknown,
}

/// Classify an error message
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("error sending request")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("nonce too low")
        || error_lower.contains("already executed")
        || error_lower.contains("deserialization error")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_retry_budget_boundaries() {
        let config = RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        };
        assert!(config.should_retry(1));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));

        let none = RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        };
        assert!(!none.should_retry(1));
    }

    #[test]
    fn test_next_retry_after_uses_previous_failures() {
        let config = RetryConfig::default();
        let now = Utc::now();
        assert_eq!(config.next_retry_after(1, now), now + chrono::Duration::seconds(2));
        assert_eq!(config.next_retry_after(2, now), now + chrono::Duration::seconds(4));
    }

    #[test]
    fn test_zero_backoff_is_immediately_due() {
        let config = RetryConfig {
            initial_backoff: Duration::ZERO,
            ..RetryConfig::default()
        };
        let now = Utc::now();
        assert_eq!(config.next_retry_after(3, now), now);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_error("error sending request for url (http://127.0.0.1:1/)"),
            ErrorClass::Transient
        );
        assert_eq!(classify_error("HTTP error 503 with body"), ErrorClass::Transient);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }
}
