//! Common utilities for source adapters and their callers

use std::time::Duration;

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    SourceError,
    SourceResult,
};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: usize,
    /// Delay before the first retry
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings
    pub fn new(max_attempts: usize, initial_delay: Duration, exponential_backoff: bool) -> Self {
        Self {
            max_attempts,
            initial_delay,
            exponential_backoff,
            ..Self::default()
        }
    }

    /// A policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, false)
    }

    /// Delay to wait after the given failed attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay = if self.exponential_backoff {
            let factor = 1u32.checked_shl(attempt.min(31) as u32).unwrap_or(u32::MAX);
            self.initial_delay.saturating_mul(factor)
        } else {
            self.initial_delay
        };
        delay.min(self.max_delay)
    }

    /// Executes an operation, retrying failures for which `should_retry`
    /// returns true
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tidemark_source_api::utils::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default();
    /// let result = policy
    ///     .retry_if(|| async { Ok::<_, MyError>(()) }, |e| e.is_transient())
    ///     .await?;
    /// ```
    pub async fn retry_if<F, Fut, T, E, P>(&self, operation: F, should_retry: P) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt + 1 < attempts && should_retry(&e) => {
                    tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Executes a source operation, retrying only transient errors
    pub async fn retry<F, Fut, T>(&self, operation: F) -> SourceResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SourceResult<T>>,
    {
        self.retry_if(operation, SourceError::is_transient).await
    }
}

mod millis {
    use std::time::Duration;

    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
