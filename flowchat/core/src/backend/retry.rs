//! Retry Policy
//!
//! One policy object for reopening a turn's stream. It is consulted only
//! while opening: a stream that already delivered bytes is never replayed,
//! and in-band `error` records are never retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::traits::TransportError;

/// Retry configuration for opening streams
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial backoff delay
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add jitter to backoff
    pub use_jitter: bool,

    /// Retry on these status codes
    pub retry_status_codes: Vec<u16>,

    /// Retry on connection errors and timeouts
    pub retry_on_connection_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
            retry_status_codes: vec![429, 500, 502, 503, 504],
            retry_on_connection_error: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            // Up to 25% extra
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }

    /// Check if a status code should trigger a retry
    #[must_use]
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    /// Whether `error` on attempt `attempt` (0-indexed) should be retried
    #[must_use]
    pub fn should_retry(&self, error: &TransportError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        match error {
            TransportError::Status { status, .. } => self.should_retry_status(*status),
            TransportError::Network(_) | TransportError::Timeout => self.retry_on_connection_error,
            TransportError::Credentials(_)
            | TransportError::Closed
            | TransportError::InvalidResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            use_jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(1000)); // Capped
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let backoff = policy.backoff_for_attempt(1);
            assert!(backoff >= Duration::from_millis(200));
            assert!(backoff <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        let unavailable = TransportError::Status {
            status: 503,
            body: String::new(),
        };
        let bad_request = TransportError::Status {
            status: 400,
            body: String::new(),
        };

        assert!(policy.should_retry(&unavailable, 0));
        assert!(policy.should_retry(&TransportError::Network("reset".into()), 2));
        assert!(!policy.should_retry(&unavailable, 3));
        assert!(!policy.should_retry(&bad_request, 0));
        assert!(!policy.should_retry(&TransportError::Credentials("x".into()), 0));
        assert!(!RetryPolicy::none().should_retry(&unavailable, 0));
    }
}
