//! Error types for chatstate.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage errors, classified by how the caller should react to them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DatabaseError {
    /// Connection reset/refused, pool exhaustion, serialization conflicts.
    /// Retried internally.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Failed to encode value for {key}: {reason}")]
    Encoding { key: String, reason: String },

    #[error("Corrupt value for {key}: {reason}")]
    Decoding { key: String, reason: String },

    /// The operation did not finish in time. A write may or may not have been
    /// committed.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<DatabaseError> },
}

impl DatabaseError {
    /// Whether the retry loop should try the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Connection(_))
    }

    /// Whether re-submitting the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DatabaseError::Connection(_)
                | DatabaseError::Timeout(_)
                | DatabaseError::RetriesExhausted { .. }
        )
    }
}

/// Migration tool errors that stop the whole run.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Failed to read snapshot: {0}")]
    SnapshotRead(#[from] std::io::Error),

    #[error("Snapshot is not valid: {0}")]
    SnapshotFormat(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_transient() {
        assert!(DatabaseError::Connection("reset".into()).is_transient());
        assert!(!DatabaseError::Constraint("dup".into()).is_transient());
        assert!(!DatabaseError::Authorization("denied".into()).is_transient());
        assert!(!DatabaseError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn exhausted_retries_are_retryable() {
        let err = DatabaseError::RetriesExhausted {
            attempts: 3,
            last: Box::new(DatabaseError::Connection("reset".into())),
        };
        assert!(err.is_retryable());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("3 attempts"));
    }
}
