//! Error types for checkpoint and store operations
//!
//! Absence of a checkpoint, write or store item is never an error: lookups return
//! `Ok(None)` and listings return empty collections.

use thiserror::Error;

/// Result type for warehouse-backed persistence operations
pub type Result<T> = std::result::Result<T, WarehouseError>;

/// Errors that can occur while persisting or reading checkpoints and store items
#[derive(Error, Debug)]
pub enum WarehouseError {
    /// The statement failed on the warehouse or returned malformed rows
    #[error("Backend error: {0}")]
    Backend(String),

    /// Transient backend failure (throttling, unavailable warehouse, poll budget exhausted)
    #[error("Warehouse unavailable: {0}")]
    Unavailable(String),

    /// A checkpoint with the same identity already exists
    #[error("Checkpoint already exists: thread_id={thread_id}, checkpoint_ns={checkpoint_ns:?}, checkpoint_id={checkpoint_id}")]
    Conflict {
        thread_id: String,
        checkpoint_ns: String,
        checkpoint_id: String,
    },

    /// A stored value carries an encoding tag this build does not understand
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Base64 text could not be decoded
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Caller supplied an unusable address, namespace or argument
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WarehouseError {
    /// Whether a retry policy may resubmit the statement that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, WarehouseError::Unavailable(_))
    }

    pub(crate) fn malformed(what: impl std::fmt::Display) -> Self {
        WarehouseError::Backend(format!("malformed result: {}", what))
    }
}

impl From<reqwest::Error> for WarehouseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            WarehouseError::Unavailable(err.to_string())
        } else {
            WarehouseError::Backend(err.to_string())
        }
    }
}

impl From<sqlx::Error> for WarehouseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                WarehouseError::Unavailable(err.to_string())
            }
            other => WarehouseError::Backend(other.to_string()),
        }
    }
}
