//! Retry policy with exponential backoff.
//!
//! Only transient failures (transport drops, idle kicks, lock
//! contention, rate limiting) are retried; permanent failures propagate
//! immediately. Each retry re-opens the connection and relies on resume
//! offsets, so no completed bytes are transferred twice.

use std::time::Duration;

use crate::error::ClientError;

/// Backoff schedule for retried operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0 = after the first failure).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// Whether another attempt should follow this failure.
    pub fn should_retry(&self, err: &ClientError, attempts_used: u32) -> bool {
        attempts_used < self.attempts && err.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_types::ErrorKind;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn transient_errors_retry_until_attempts_exhausted() {
        let policy = RetryPolicy::with_attempts(3);
        let err = ClientError::Server {
            kind: ErrorKind::Locked,
            message: "busy".into(),
        };
        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
    }

    #[test]
    fn permanent_errors_never_retry() {
        let policy = RetryPolicy::with_attempts(5);
        let err = ClientError::Server {
            kind: ErrorKind::ChecksumMismatch,
            message: "bad digest".into(),
        };
        assert!(!policy.should_retry(&err, 1));
    }
}
