//! Herdlock Error Types

use thiserror::Error;

/// Result type alias for herdlock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Herdlock error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Unable to resolve host identity: {0}")]
    Identity(String),

    // Coordination store connectivity
    #[error("Connection to coordination store lost: {0}")]
    ConnectionLost(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination session already closed")]
    SessionClosed,

    // Coordination store protocol errors
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parent node does not exist for: {0}")]
    NoParent(String),

    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    VersionMismatch {
        path: String,
        expected: i64,
        actual: i64,
    },

    #[error("Malformed node path: {0}")]
    BadPath(String),

    #[error("Not authorized for {0}")]
    Unauthorized(String),

    // Election errors
    #[error("Election failed: {0}")]
    Election(String),

    #[error("Retries exhausted after {attempts} attempts during {operation}: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Leadership lost unexpectedly")]
    LeadershipLost,

    #[error("Leadership record is not valid UTF-8")]
    CorruptLeadershipRecord,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient connectivity failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::ConnectionTimeout(_)
        )
    }

    /// Check if this error means the session (and with it any candidacy) is gone
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Error::SessionExpired | Error::SessionClosed)
    }

    /// Process exit code for this failure.
    ///
    /// Callers get a distinguishable status per failure class: 2 for election
    /// or store failures, 3 when the host identity cannot be resolved, 4 when
    /// leadership was held and then lost.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Identity(_) => 3,
            Error::LeadershipLost => 4,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionLost("node-1".into()).is_retryable());
        assert!(Error::ConnectionTimeout("node-1".into()).is_retryable());
        assert!(!Error::SessionExpired.is_retryable());
        assert!(!Error::Unauthorized("/locks".into()).is_retryable());
        assert!(!Error::NodeExists("/masters/web".into()).is_retryable());
    }

    #[test]
    fn test_session_loss_classification() {
        assert!(Error::SessionExpired.is_session_loss());
        assert!(Error::SessionClosed.is_session_loss());
        assert!(!Error::ConnectionLost("x".into()).is_session_loss());
    }

    #[test]
    fn test_exit_codes_are_distinguishable() {
        assert_eq!(Error::Identity("no hostname".into()).exit_code(), 3);
        assert_eq!(Error::LeadershipLost.exit_code(), 4);
        assert_eq!(Error::Election("boom".into()).exit_code(), 2);
        assert_eq!(Error::SessionExpired.exit_code(), 2);
    }
}
