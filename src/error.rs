//! Error taxonomy shared by every stage of a sync run
//!
//! Provider listing failures abort a run. Failures while processing a single
//! repository are folded into that repository's outcome instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Connection,
    RepositoryOperation,
    ProjectNotFound,
    Validation,
    FileSystem,
    Provider,
    RetryExhausted,
    /// Work abandoned because the run was cancelled before it started
    Cancelled,
    /// Repository left untouched because it has local changes
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Connection => "connection",
            ErrorKind::RepositoryOperation => "repository_operation",
            ErrorKind::ProjectNotFound => "project_not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::FileSystem => "file_system",
            ErrorKind::Provider => "provider",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by providers, the git collaborator and the sync engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transient network failure; the only retryable kind
    #[error("connection error: {0}")]
    Connection(String),

    #[error("repository operation failed: {0}")]
    RepositoryOperation(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("filesystem error: {0}")]
    FileSystem(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<SyncError> },

    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Connection(_) => ErrorKind::Connection,
            SyncError::RepositoryOperation(_) => ErrorKind::RepositoryOperation,
            SyncError::ProjectNotFound(_) => ErrorKind::ProjectNotFound,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::FileSystem(_) => ErrorKind::FileSystem,
            SyncError::Provider(_) => ErrorKind::Provider,
            SyncError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether another attempt could succeed without intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connection(_))
    }

    pub(crate) fn fs(context: impl fmt::Display, err: std::io::Error) -> Self {
        SyncError::FileSystem(format!("{}: {}", context, err))
    }
}

/// Classify an HTTP status code returned by a provider API
pub fn classify_status(status: u16, detail: impl Into<String>) -> SyncError {
    let detail = detail.into();
    match status {
        401 | 403 => SyncError::Authentication(format!("HTTP {}: {}", status, detail)),
        404 => SyncError::ProjectNotFound(format!("HTTP {}: {}", status, detail)),
        408 | 429 => SyncError::Connection(format!("HTTP {}: {}", status, detail)),
        s if s >= 500 => SyncError::Connection(format!("HTTP {}: {}", status, detail)),
        _ => SyncError::Provider(format!("HTTP {}: {}", status, detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_retryable() {
        assert!(SyncError::Connection("timeout".into()).is_retryable());

        let fatal = [
            SyncError::Authentication("bad token".into()),
            SyncError::ProjectNotFound("nope".into()),
            SyncError::Validation("bad name".into()),
            SyncError::FileSystem("disk full".into()),
            SyncError::RepositoryOperation("merge conflict".into()),
            SyncError::Provider("garbage".into()),
            SyncError::Cancelled,
        ];
        for err in fatal {
            assert!(!err.is_retryable(), "{} should be fatal", err);
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(401, "").kind(), ErrorKind::Authentication);
        assert_eq!(classify_status(403, "").kind(), ErrorKind::Authentication);
        assert_eq!(classify_status(404, "").kind(), ErrorKind::ProjectNotFound);
        assert_eq!(classify_status(429, "").kind(), ErrorKind::Connection);
        assert_eq!(classify_status(503, "").kind(), ErrorKind::Connection);
        assert_eq!(classify_status(400, "").kind(), ErrorKind::Provider);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RetryExhausted).unwrap();
        assert_eq!(json, "\"retry_exhausted\"");
        assert_eq!(ErrorKind::ProjectNotFound.to_string(), "project_not_found");
    }
}
