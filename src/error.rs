//! Error types for Place Core.
//!
//! This module defines all error types used throughout the library.
//! The split between transient and fatal variants drives the retry
//! policy: only `is_transient()` errors are ever retried.

use thiserror::Error;

/// Result type alias for Place operations
pub type PlaceResult<T> = Result<T, PlaceError>;

/// Main error type for Place operations
#[derive(Error, Debug)]
pub enum PlaceError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Remote unavailable (HTTP {status}): {body}")]
    RemoteUnavailable { status: u16, body: String },

    #[error("Version conflict on {id}: sent version {expected}, remote is at {remote}")]
    VersionConflict { id: String, expected: i64, remote: i64 },

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),
}

impl PlaceError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        PlaceError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new mapping error
    pub fn mapping(message: impl Into<String>) -> Self {
        PlaceError::Mapping(message.into())
    }

    /// Create a new sync error
    pub fn sync(message: impl Into<String>) -> Self {
        PlaceError::Sync(message.into())
    }

    /// Whether this error is worth retrying.
    ///
    /// Network failures, timeouts and 5xx responses are transient;
    /// everything else (validation, mapping, conflicts, 4xx) fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlaceError::Network(_)
                | PlaceError::Timeout(_)
                | PlaceError::RemoteUnavailable { .. }
        )
    }
}

impl From<reqwest::Error> for PlaceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PlaceError::Timeout(err.to_string())
        } else {
            PlaceError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = PlaceError::validation("name", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Validation error in name: must not be empty"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PlaceError::Network("connection refused".into()).is_transient());
        assert!(PlaceError::Timeout("30s elapsed".into()).is_transient());
        assert!(PlaceError::RemoteUnavailable {
            status: 503,
            body: String::new()
        }
        .is_transient());

        assert!(!PlaceError::validation("f", "m").is_transient());
        assert!(!PlaceError::NotFound("x".into()).is_transient());
        assert!(!PlaceError::VersionConflict {
            id: "e1".into(),
            expected: 1,
            remote: 2
        }
        .is_transient());
    }
}
