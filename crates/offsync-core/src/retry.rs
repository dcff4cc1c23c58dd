//! Retry with exponential backoff.
//!
//! [`RetryPolicy`] computes jittered delays. The sync scheduler uses it to
//! back off periodic drains after a pass stops on a network failure, and
//! [`with_retry`] wraps short local operations (opening the store while
//! another process holds the write lock) that fail transiently.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{BackendError, Error, Result, StorageError};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Random jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum attempts. `None` means unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Opening the record store: 5 attempts, 50ms initial.
    #[must_use]
    pub fn store_open() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(5),
        }
    }

    /// Delay for a 0-indexed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // powi overflows long before attempt 31 matters
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let range = base_ms * self.jitter_percent;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

/// Whether an error is worth retrying.
///
/// Lock contention and network failures are; anything that reflects bad data,
/// bad configuration or a damaged database is not.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Io(_) | Error::Runtime(_) => true,
        Error::Storage(e) => is_retryable_storage(e),
        Error::Backend(e) => match e {
            BackendError::Network(_) => true,
            BackendError::Application(_) => false,
            BackendError::Storage(e) => is_retryable_storage(e),
        },
        Error::Write(_) | Error::Config(_) | Error::Json(_) => false,
    }
}

fn is_retryable_storage(error: &StorageError) -> bool {
    match error {
        // Lock conflicts surface as generic database errors
        StorageError::Database(_) => true,
        StorageError::NotOpen
        | StorageError::Corruption { .. }
        | StorageError::SchemaTooNew { .. }
        | StorageError::MigrationFailed(_)
        | StorageError::QueueFull { .. }
        | StorageError::InvalidRecord(_)
        | StorageError::Serialization(_) => false,
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return Err(e);
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            attempt,
                            max_attempts = max,
                            error = %e,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Operation failed after all retry attempts"
                        );
                        return Err(e);
                    }
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after retryable failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApplicationFailure, NetworkFailure, NetworkFailureKind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(max_attempts),
        }
    }

    #[test]
    fn delay_doubles_then_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: None,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn jitter_within_range() {
        let policy = RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            1.0,
            0.1,
            Some(5),
        );
        for _ in 0..100 {
            let ms = policy.delay_for_attempt(0).as_millis();
            assert!((900..=1100).contains(&ms), "delay out of range: {ms}");
        }
    }

    #[test]
    fn new_clamps_factor_and_jitter() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO, 0.5, 3.0, None);
        assert!((policy.backoff_factor - 1.0).abs() < f64::EPSILON);
        assert!((policy.jitter_percent - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retryability_by_class() {
        assert!(is_retryable(&Error::Storage(StorageError::Database(
            "database is locked".into()
        ))));
        assert!(is_retryable(&Error::Backend(BackendError::Network(
            NetworkFailure::new("create", NetworkFailureKind::Timeout, "slow")
        ))));
        assert!(!is_retryable(&Error::Backend(BackendError::Application(
            ApplicationFailure::new("create", "bad")
        ))));
        assert!(!is_retryable(&Error::Storage(StorageError::Corruption {
            details: "x".into()
        })));
        assert!(!is_retryable(&Error::Storage(StorageError::QueueFull {
            limit: 1
        })));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&fast_policy(5), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Storage(StorageError::Database("locked".into())))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = with_retry(&fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Runtime("still failing".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = with_retry(&fast_policy(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Storage(StorageError::SchemaTooNew {
                    current: 2,
                    supported: 1,
                }))
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::SchemaTooNew { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
