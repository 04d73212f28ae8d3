//! Error types for offsync

use thiserror::Error;

/// Result type alias for offsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for offsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation {0} is currently being dispatched")]
    InFlight(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Sync(_))
    }

    /// Whether the durable log itself is unusable. These are never retried by
    /// the engine and always reach the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Database(_) | SyncError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::Network("timeout".into()).is_retryable());
        assert!(!SyncError::Network("timeout".into()).is_fatal());
        assert!(SyncError::Database(rusqlite::Error::InvalidQuery).is_fatal());
        assert!(!SyncError::NotFound("x".into()).is_retryable());
    }
}
