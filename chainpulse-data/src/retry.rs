use crate::error::DataError;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry; doubled for each subsequent retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// How many times, and how patiently, an operation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Policy that never retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to wait before attempt number `attempt` (zero based): `base_delay * 2^(attempt - 1)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            n => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(n - 1)),
        }
    }
}

/// Runs an async operation under a [`RetryPolicy`], checking a [`CancellationToken`] before
/// every attempt.
///
/// Once the token is cancelled nothing further is scheduled and the controller resolves to
/// [`DataError::Aborted`], which callers discard rather than surface.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Invoke `operation` until it succeeds, fails with a non-retryable error, runs out of
    /// attempts, or is cancelled.
    ///
    /// `operation` receives the zero based attempt number.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, DataError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(DataError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if self.cancel.is_cancelled() {
                return Err(DataError::Aborted);
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DataError::Aborted),
                result = operation(attempt) => result,
            };

            match result {
                Ok(output) => return Ok(output),
                Err(error) if error.is_aborted() => return Err(DataError::Aborted),
                Err(error) if !error.is_retryable() => {
                    debug!(attempt, %error, "non-retryable failure");
                    return Err(error);
                }
                Err(error) => {
                    warn!(attempt, max_attempts, %error, "attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(DataError::ExhaustedRetry {
            attempts: max_attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| DataError::Network("no attempt completed".into())),
            ),
        })
    }
}
