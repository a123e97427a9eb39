//! Error types for the Gatekeeper service.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::Decision;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a counter store to complete an operation.
///
/// A store that returns one of these has not advanced the counter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend rejected the command or the connection failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The backend answered with something the store could not interpret.
    #[error("storage protocol error: {0}")]
    Protocol(String),

    /// The operation did not finish before its deadline. `after` is the
    /// deadline that expired when the caller set it, `None` when the
    /// backend's own client gave up.
    #[error(
        "storage operation timed out{}",
        .after.map(|d| format!(" after {:?}", d)).unwrap_or_default()
    )]
    Timeout { after: Option<Duration> },
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            return StorageError::Timeout { after: None };
        }
        match err.kind() {
            redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
                StorageError::Protocol(err.to_string())
            }
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

/// Errors returned by [`RateLimiter::allow`](crate::ratelimit::RateLimiter::allow).
#[derive(Error, Debug, Clone)]
pub enum LimiterError {
    /// The effective limit for the client is not usable.
    #[error("invalid limit configuration for client {client_id}: {reason}")]
    Configuration { client_id: String, reason: String },

    /// The counter store failed. `fallback` is the decision dictated by the
    /// configured failure policy.
    #[error("counter storage failed for client {client_id}: {source}")]
    Storage {
        client_id: String,
        source: StorageError,
        fallback: Decision,
    },
}

impl LimiterError {
    /// The policy decision to apply when the store was unavailable.
    pub fn fallback(&self) -> Option<&Decision> {
        match self {
            LimiterError::Storage { fallback, .. } => Some(fallback),
            LimiterError::Configuration { .. } => None,
        }
    }

    /// The client the failed decision was for.
    pub fn client_id(&self) -> &str {
        match self {
            LimiterError::Configuration { client_id, .. } => client_id,
            LimiterError::Storage { client_id, .. } => client_id,
        }
    }
}
