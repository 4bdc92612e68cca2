//! Retry and backoff logic shared by alibackup components
//!
//! Provider SDK calls carry their own retry policy. This crate covers the
//! calls alibackup issues itself, chiefly the instance-metadata service, where
//! a short bounded retry hides the occasional dropped connection without
//! letting a missing endpoint stall plugin initialization.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Outcome of a single attempt, as classified by the caller.
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The attempt failed but may succeed if repeated.
    #[error("Transient error in '{operation}': {source}")]
    Transient { operation: &'static str, source: E },
    /// The attempt failed in a way repeating cannot fix.
    #[error("Permanent error in '{operation}': {source}")]
    Permanent { operation: &'static str, source: E },
    /// Every allowed attempt failed transiently.
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Unwrap the underlying error regardless of classification.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. }
            | RetryError::MaxRetriesExceeded { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T, E> = Pin<Box<dyn Future<Output = RetryResult<T, E>> + Send + 'a>>;

/// Retry policy: a backoff schedule plus a cap on retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: ExponentialBackoff,
    pub max_retries: usize,
}

impl RetryPolicy {
    /// Policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            backoff: metadata_backoff_policy(),
            max_retries: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: metadata_backoff_policy(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Execute an operation, retrying transient failures per `policy`.
///
/// The closure receives the 1-based attempt number. A `Permanent` error stops
/// immediately and is returned as-is; once the retries are used up the last
/// transient error is wrapped in `MaxRetriesExceeded`.
pub async fn with_backoff<F, T, E>(
    op_name: &'static str,
    policy: RetryPolicy,
    mut f: F,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> BoxFuture<'static, T, E>,
    E: std::error::Error + 'static,
{
    let mut backoff = policy.backoff;
    backoff.reset();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(RetryError::Transient { source, .. }) => {
                if attempt > policy.max_retries {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source,
                    });
                }

                let Some(delay) = backoff.next_backoff() else {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source,
                    });
                };

                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

/// Backoff schedule for instance-metadata lookups: 1s, 2s, 4s.
pub fn metadata_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_randomization_factor(0.0)
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(4))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .build()
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Classify an error through [`RetryableError`].
pub fn classify<E>(operation: &'static str, err: E) -> RetryError<E>
where
    E: std::error::Error + RetryableError + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: err,
        }
    } else {
        RetryError::Permanent {
            operation,
            source: err,
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: $err,
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: $err,
        }
    };
}
