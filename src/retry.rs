//! Retry operations with a fixed backoff and per-attempt deadlines
//!
//! Upstream calls are retried a bounded number of times. Every attempt
//! runs under its own timeout; when it expires only that attempt's future
//! is dropped, and the loop moves on to the next attempt. Between attempts
//! the caller sleeps for a constant backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::ProxyError;

/// Configuration for the fixed-backoff retry strategy
///
/// # Examples
///
/// ```
/// use dnsveil::retry::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig {
///     max_attempts: 5,
///     attempt_timeout: Duration::from_secs(2),
///     backoff: Duration::from_millis(250),
/// };
/// assert_eq!(RetryConfig::default().max_attempts, 3);
/// # let _ = config;
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: u32,

    /// Deadline for a single attempt
    pub attempt_timeout: Duration,

    /// Wait between a failed attempt and the next one
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(500),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            attempt_timeout: Duration::from_millis(settings.attempt_timeout_ms),
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }
}

/// Executes an operation with fixed-backoff retries
///
/// `operation` receives the 1-based attempt number. An attempt that
/// exceeds `attempt_timeout` fails with [`ProxyError::Timeout`].
/// Errors for which `is_retriable` returns `false` are returned at once;
/// once `max_attempts` attempts have failed the last error is wrapped in
/// [`ProxyError::Exhausted`].
///
/// # Examples
///
/// ```
/// use dnsveil::error::ProxyError;
/// use dnsveil::retry::{with_fixed_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), ProxyError> {
/// let config = RetryConfig::default();
/// let answer = with_fixed_backoff(
///     |_attempt| async { Ok::<_, ProxyError>(42) },
///     ProxyError::is_retriable,
///     &config,
/// )
/// .await?;
/// assert_eq!(answer, 42);
/// # Ok(())
/// # }
/// ```
pub async fn with_fixed_backoff<F, Fut, T, R>(
    mut operation: F,
    is_retriable: R,
    config: &RetryConfig,
) -> Result<T, ProxyError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProxyError>>,
    R: Fn(&ProxyError) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match timeout(config.attempt_timeout, operation(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => ProxyError::Timeout(config.attempt_timeout),
        };

        warn!("Attempt {}/{} failed: {}", attempt, max_attempts, err);

        if !is_retriable(&err) {
            return Err(err);
        }

        if attempt >= max_attempts {
            return Err(ProxyError::Exhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        debug!(
            "Retry attempt {}/{} after {:?} delay",
            attempt + 1,
            max_attempts,
            config.backoff
        );
        sleep(config.backoff).await;
    }
}
