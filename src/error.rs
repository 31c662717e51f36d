//! Error types for the finance companion core

use thiserror::Error;

/// Result type alias for companion operations
pub type Result<T> = std::result::Result<T, CompanionError>;

#[derive(Error, Debug)]
pub enum CompanionError {

    // =============================
    // Domain Errors
    // =============================

    /// Malformed or out-of-range input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown transaction, lesson, or user resource. Not retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted against a resource in a terminal state,
    /// e.g. justifying a transaction that is not pending.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Classifier/evaluator timeout or malformed response. Retryable:
    /// no state was mutated before the error surfaced.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Store read/write failure. Fatal for the operation that failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("UUID parse error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompanionError {
    /// Collapse library-level failures into the domain taxonomy so
    /// callers can branch on the five canonical variants.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompanionError::Validation(_) => ErrorKind::Validation,
            CompanionError::NotFound(_) => ErrorKind::NotFound,
            CompanionError::Conflict(_) => ErrorKind::Conflict,
            CompanionError::Upstream(_) | CompanionError::Http(_) => ErrorKind::Upstream,
            CompanionError::Persistence(_) | CompanionError::Database(_) => {
                ErrorKind::Persistence
            }
            CompanionError::Serialization(_)
            | CompanionError::Uuid(_)
            | CompanionError::Io(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Upstream,
    Persistence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            CompanionError::Validation("bad amount".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CompanionError::Conflict("already resolved".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CompanionError::Upstream("classifier timeout".into()).kind(),
            ErrorKind::Upstream
        );
        assert_eq!(
            CompanionError::Persistence("write failed".into()).kind(),
            ErrorKind::Persistence
        );
    }
}
