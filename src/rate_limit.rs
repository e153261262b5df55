use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::ProxyError;

/// Admission gate for outbound upstream calls
///
/// Enforces two limits across every caller sharing the gate:
/// - at most `max_concurrent` calls in flight
/// - at least `min_spacing` between the starts of successive calls
///
/// The gate is global rather than per endpoint, so calls to distinct
/// upstream URLs are spaced against each other as well.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum time between two admissions
    min_spacing: Duration,
    /// When the most recent call was admitted
    last_start: Mutex<Option<Instant>>,
    /// Semaphore to limit concurrent requests
    concurrency_limit: Arc<Semaphore>,
}

impl RateLimiter {
    /// Creates a new rate limiter
    ///
    /// # Arguments
    ///
    /// * `max_concurrent` - Maximum number of calls allowed in flight
    /// * `min_spacing` - Minimum delay between the starts of two calls
    pub fn new(max_concurrent: usize, min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_start: Mutex::new(None),
            concurrency_limit: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_concurrent,
            Duration::from_millis(config.min_spacing_ms),
        )
    }

    /// Waits until the caller may start a call
    ///
    /// A concurrency permit is taken first, then the spacing clock is
    /// consulted under a lock so that two waiters can never be admitted
    /// inside the same spacing window.
    ///
    /// Returns a guard that will release the concurrency permit when dropped.
    pub async fn acquire(&self) -> Result<RateLimitGuard, ProxyError> {
        debug!("Attempting to acquire rate limit permit");

        let permit = self
            .concurrency_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Transport("admission gate closed".to_string()))?;

        // Held across the sleep: admissions are decided one at a time
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            let earliest = previous + self.min_spacing;
            if Instant::now() < earliest {
                debug!("Spacing calls, waiting until {:?}", earliest);
                sleep_until(earliest).await;
            }
        }
        *last_start = Some(Instant::now());

        debug!("Rate limit permit acquired");

        Ok(RateLimitGuard { _permit: permit })
    }

    /// Number of calls that could be admitted right now without waiting on concurrency
    pub fn available_permits(&self) -> usize {
        self.concurrency_limit.available_permits()
    }
}

/// A guard that releases the concurrency permit when dropped
#[derive(Debug)]
pub struct RateLimitGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_admitted_immediately() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        let start = Instant::now();

        let _guard = limiter.acquire().await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_drop_releases_permit() {
        let limiter = RateLimiter::new(2, Duration::ZERO);

        let guard = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available_permits(), 1);
        drop(guard);
        assert_eq!(limiter.available_permits(), 2);
    }
}
