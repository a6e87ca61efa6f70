//! Sync error handling
//!
//! Provides typed errors for engine operations. None of these are fatal to
//! the process: per-file failures are reported and the batch continues,
//! persistent failures surface as an out-of-sync state.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while synchronizing a library
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transient connection or timeout failure
    #[error("Network error during {operation}: {message}")]
    Network { operation: String, message: String },

    /// The server answered with something we could not understand
    #[error("Protocol error during {operation}: {message}")]
    Protocol { operation: String, message: String },

    /// Local filesystem access failed
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The decision-maker did not answer a conflict
    #[error("Conflict on '{path}' was not resolved")]
    ConflictUnresolved { path: String },

    /// Relative path is empty, absolute, or escapes the library root
    #[error("Invalid library path '{0}'")]
    InvalidPath(String),

    /// Library root or server is not configured
    #[error("Sync is not configured: {0}")]
    NotConfigured(String),

    /// Operation stopped because sync is shutting down
    #[error("Sync was cancelled")]
    Cancelled,
}

/// Coarse classification used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Protocol,
    Io,
    ConflictUnresolved,
    Configuration,
    Cancelled,
}

impl SyncError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn network(operation: &str, message: impl Into<String>) -> Self {
        SyncError::Network {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn protocol(operation: &str, message: impl Into<String>) -> Self {
        SyncError::Protocol {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Classify a reqwest error
    ///
    /// Body decoding failures and client-side (4xx) statuses are protocol
    /// errors; everything else (transport, timeouts, 5xx, 408, 429) is a
    /// network error and may be retried.
    pub fn from_reqwest(operation: &str, error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::protocol(operation, error.to_string());
        }
        match error.status() {
            Some(status) => Self::from_status(operation, status.as_u16(), error.to_string()),
            None => Self::network(operation, error.to_string()),
        }
    }

    /// Classify an HTTP status code
    pub fn from_status(operation: &str, status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::network(operation, message),
            _ => Self::protocol(operation, message),
        }
    }

    /// Get the reporting kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network { .. } => ErrorKind::Network,
            SyncError::Protocol { .. } => ErrorKind::Protocol,
            SyncError::Io { .. } | SyncError::InvalidPath(_) => ErrorKind::Io,
            SyncError::ConflictUnresolved { .. } => ErrorKind::ConflictUnresolved,
            SyncError::NotConfigured(_) => ErrorKind::Configuration,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }

    /// Check if the error concerns a file that is simply not there
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            SyncError::from_status("upload", 503, "unavailable").kind(),
            ErrorKind::Network
        );
        assert_eq!(
            SyncError::from_status("upload", 429, "slow down").kind(),
            ErrorKind::Network
        );
        assert_eq!(
            SyncError::from_status("upload", 400, "bad request").kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            SyncError::from_status("catalog", 401, "unauthorized").kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_transient() {
        assert!(SyncError::network("download", "timed out").is_transient());
        assert!(!SyncError::protocol("download", "garbage").is_transient());
        assert!(!SyncError::Cancelled.is_transient());
    }

    #[test]
    fn test_not_found() {
        let err = SyncError::io(
            "/lib/a.md",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::Io);

        let err = SyncError::io(
            "/lib/a.md",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::ConflictUnresolved {
            path: "notes/a.md".to_string(),
        };
        assert!(err.to_string().contains("notes/a.md"));

        let err = SyncError::io(
            "/lib/b.md",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/lib/b.md"));
        assert!(msg.contains("denied"));
    }
}
