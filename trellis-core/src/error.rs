//! Error types for trellis.
//!
//! The taxonomy mirrors how failures propagate through the feed:
//! absent records become negative cache entries, invariant violations are
//! never retried, and races between a publish and cache catch-up surface as
//! `Inconsistent` so the caller retries the whole operation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failures raised by a durable store or cache backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend operation {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Storage lock poisoned: {resource}")]
    LockPoisoned { resource: String },

    #[error("Codec failure for {what}: {reason}")]
    Codec { what: String, reason: String },
}

/// Master error type for all trellis operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrellisError {
    /// The record is absent in the source of record.
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// The request is malformed.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An invariant was violated. Never retried.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// A publish raced with cache catch-up; retry the whole operation.
    #[error("Inconsistent: {0}")]
    Inconsistent(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// No strategy selects a release for the instance.
    #[error("No release matched: {0}")]
    NoReleaseMatched(String),

    /// A rate limiter budget was exceeded.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type alias for trellis operations.
pub type TrellisResult<T> = Result<T, TrellisError>;

/// Stable error codes used in logs, metric labels and stream messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RecordNotFound,
    InvalidParameter,
    Aborted,
    Inconsistent,
    Timeout,
    Cancelled,
    NoReleaseMatched,
    ResourceExhausted,
    Unavailable,
    StorageFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RecordNotFound => "RECORD_NOT_FOUND",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Inconsistent => "INCONSISTENT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::NoReleaseMatched => "NO_RELEASE_MATCHED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::StorageFailure => "STORAGE_FAILURE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TrellisError {
    /// Get the stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            TrellisError::RecordNotFound(_) => ErrorCode::RecordNotFound,
            TrellisError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            TrellisError::Aborted(_) => ErrorCode::Aborted,
            TrellisError::Inconsistent(_) => ErrorCode::Inconsistent,
            TrellisError::Timeout(_) => ErrorCode::Timeout,
            TrellisError::Cancelled(_) => ErrorCode::Cancelled,
            TrellisError::NoReleaseMatched(_) => ErrorCode::NoReleaseMatched,
            TrellisError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            TrellisError::Unavailable(_) => ErrorCode::Unavailable,
            TrellisError::Storage(_) => ErrorCode::StorageFailure,
        }
    }

    /// Whether retrying the same operation later can succeed.
    ///
    /// Invariant violations, malformed requests and definitive "absent" or
    /// "no match" answers are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrellisError::Inconsistent(_)
            | TrellisError::Timeout(_)
            | TrellisError::Unavailable(_)
            | TrellisError::ResourceExhausted(_) => true,
            TrellisError::Storage(StorageError::Backend { .. }) => true,
            TrellisError::Storage(_) => false,
            TrellisError::RecordNotFound(_)
            | TrellisError::InvalidParameter(_)
            | TrellisError::Aborted(_)
            | TrellisError::Cancelled(_)
            | TrellisError::NoReleaseMatched(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TrellisError::RecordNotFound(_))
    }

    pub fn backend(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        TrellisError::Storage(StorageError::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        })
    }

    pub fn codec(what: impl Into<String>, reason: impl fmt::Display) -> Self {
        TrellisError::Storage(StorageError::Codec {
            what: what.into(),
            reason: reason.to_string(),
        })
    }

    pub fn poisoned(resource: impl Into<String>) -> Self {
        TrellisError::Storage(StorageError::LockPoisoned {
            resource: resource.into(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            TrellisError::Inconsistent("x".into()).code().as_str(),
            "INCONSISTENT"
        );
        assert_eq!(
            TrellisError::codec("app-meta", "eof").code(),
            ErrorCode::StorageFailure
        );
        let json = serde_json::to_string(&ErrorCode::NoReleaseMatched).unwrap();
        assert_eq!(json, "\"NO_RELEASE_MATCHED\"");
    }

    #[test]
    fn test_retry_classification() {
        assert!(TrellisError::Inconsistent("race".into()).is_retryable());
        assert!(TrellisError::backend("get", "connection reset").is_retryable());
        assert!(!TrellisError::Aborted("two defaults".into()).is_retryable());
        assert!(!TrellisError::NoReleaseMatched("app 7".into()).is_retryable());
        assert!(!TrellisError::poisoned("actors").is_retryable());
    }

    #[test]
    fn test_display_contains_context() {
        let err = TrellisError::backend("mget", "broken pipe");
        let msg = err.to_string();
        assert!(msg.contains("mget"));
        assert!(msg.contains("broken pipe"));
    }
}
