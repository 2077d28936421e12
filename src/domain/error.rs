//! Domain-level error types for the offline engine.
//!
//! `AppError` carries the engine's failure taxonomy. `RemoteError` is the
//! tagged error a remote backend must return so the sync coordinator can
//! tell retryable outages apart from terminal rejections.

use std::path::PathBuf;
use thiserror::Error;

/// Why the remote backend refused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionKind {
    /// The payload failed server-side validation.
    Validation,
    /// The mutation conflicts with current server state.
    Conflict,
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// Errors returned by a remote backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Backend unreachable (DNS, refused connection, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The server rejected the payload.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The server state conflicts with the mutation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials were expired or refused; the mutation stays queued.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RemoteError {
    /// Returns true if the operation can be retried later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Unauthorized(_))
    }

    /// Rejection class of a non-retryable error.
    #[must_use]
    pub const fn rejection_kind(&self) -> Option<RejectionKind> {
        match self {
            Self::Validation(_) => Some(RejectionKind::Validation),
            Self::Conflict(_) => Some(RejectionKind::Conflict),
            Self::Network(_) | Self::Timeout | Self::Unauthorized(_) => None,
        }
    }
}

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    /// The remote backend cannot be reached; work stays queued.
    #[error("Network unavailable: {message}")]
    NetworkUnavailable { message: String },

    /// The remote backend refused a mutation.
    #[error("Remote rejected mutation ({kind}): {message}")]
    RemoteRejected { kind: RejectionKind, message: String },

    /// Durable storage could not be opened or written.
    #[error("Storage unavailable at {path}: {message}")]
    StorageUnavailable { path: PathBuf, message: String },

    /// The platform lacks a capability (service worker, install prompt).
    #[error("Unsupported on this platform: {capability}")]
    Unsupported { capability: &'static str },

    /// A platform call (worker registration, messaging) failed.
    #[error("Platform error: {message}")]
    Platform { message: String },

    /// Failed to query the database.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A persisted record was written by a newer client.
    #[error("Unsupported schema version {found} for {key} (max {supported})")]
    SchemaVersion {
        key: String,
        found: u32,
        supported: u32,
    },

    /// JSON parsing failed.
    #[error("JSON parse error: {message}")]
    JsonParse {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// Lookup of a queued mutation or collection failed.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Configuration or environment error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO operation failed.
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl AppError {
    /// Create a database error from rusqlite error.
    pub fn database(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    /// Create a JSON parse error.
    pub fn json_parse(err: serde_json::Error) -> Self {
        Self::JsonParse {
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Create an IO error with context.
    pub fn io(message: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(err),
        }
    }

    /// Returns true for errors that leave work queued for a later attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable { .. })
    }
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        match err.rejection_kind() {
            Some(kind) => Self::RemoteRejected {
                kind,
                message: err.to_string(),
            },
            None => Self::NetworkUnavailable {
                message: err.to_string(),
            },
        }
    }
}

/// Result type alias using `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_remote_errors() {
        assert!(RemoteError::Network("connection refused".into()).is_retryable());
        assert!(RemoteError::Timeout.is_retryable());
        assert!(!RemoteError::Validation("missing name".into()).is_retryable());
        assert!(!RemoteError::Conflict("deleted".into()).is_retryable());
    }

    #[test]
    fn remote_error_maps_to_taxonomy() {
        let err: AppError = RemoteError::Timeout.into();
        assert!(matches!(err, AppError::NetworkUnavailable { .. }));
        assert!(err.is_retryable());

        let err: AppError = RemoteError::Conflict("record deleted".into()).into();
        assert!(matches!(
            err,
            AppError::RemoteRejected {
                kind: RejectionKind::Conflict,
                ..
            }
        ));
        assert!(!err.is_retryable());
    }
}
