//! Error types for the Tollgate crate.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`KeyedStore`](crate::store::KeyedStore) backend.
///
/// Callers in this crate never let these reach the end user: the cache
/// degrades to a miss or a failed write, and the limiter fails open.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or refused the command.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured response timeout.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with something the caller did not expect.
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// A value could be represented in neither the structured nor the binary form.
#[derive(Error, Debug)]
#[error("Encoding failure: structured: {structured}; binary: {binary}")]
pub struct EncodingError {
    /// Why the structured text encoding was rejected.
    pub structured: String,
    /// Why the binary-safe encoding was rejected.
    pub binary: String,
}

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Value encoding errors
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
