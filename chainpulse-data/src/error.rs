use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `chainpulse-data`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("network error: {0}")]
    Network(String),

    #[error("payload validation failed: {0}")]
    Validation(String),

    #[error("operation aborted")]
    Aborted,

    #[error("retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetry {
        attempts: u32,
        last: Box<DataError>,
    },

    #[error("cache error: {0}")]
    Cache(String),
}

impl DataError {
    /// Determine if an error is worth another attempt by the
    /// [`RetryController`](crate::retry::RetryController).
    ///
    /// Only transport failures are retried: a malformed upstream payload will not fix itself.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::Network(_) => true,
            _ => false,
        }
    }

    /// Determine if an error is a cancellation that must never be surfaced to a consumer.
    pub fn is_aborted(&self) -> bool {
        matches!(self, DataError::Aborted)
    }

    /// Unwraps [`DataError::ExhaustedRetry`] to the error of the final attempt.
    pub fn root_cause(&self) -> &DataError {
        match self {
            DataError::ExhaustedRetry { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for DataError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Validation(value.to_string())
        } else {
            Self::Network(value.to_string())
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(value: serde_json::Error) -> Self {
        Self::Validation(value.to_string())
    }
}
