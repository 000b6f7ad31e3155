//! Error types for coordination-service operations.
//!
//! Variants mirror the failure classes a session-based key tree reports, so
//! registries can tell an absent node from a lost connection without knowing
//! which backend is in use.

use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The node at the given path does not exist.
    #[error("node not found: {0}")]
    NotFound(String),

    /// A create targeted a path that already holds a node.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// A delete targeted a node that still has children.
    #[error("node has children: {0}")]
    NotEmpty(String),

    /// A path or path component is not a valid node name.
    #[error("invalid node name: {0}")]
    InvalidName(String),

    /// The session is temporarily disconnected from the service.
    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    /// The session ended; its ephemeral nodes are gone.
    #[error("session expired")]
    SessionExpired,

    /// The session was closed by its owner.
    #[error("session closed")]
    SessionClosed,

    /// Operation timed out waiting for the service.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A `Check` op found the node holding different data.
    #[error("check failed: {0}")]
    CheckFailed(String),

    /// The initial connection could not be established.
    #[error("unable to reach coordination service: {0}")]
    ConnectionFatal(String),

    /// Node data could not be decoded.
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// Transport-level failure reported by the backend.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::ConnectionLoss(_)
                | CoordinationError::Timeout(_)
                | CoordinationError::Transport(_)
        )
    }

    /// Returns true if the node was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordinationError::NotFound(_))
    }

    /// Returns true if the node was already present.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordinationError::NodeExists(_))
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let loss = CoordinationError::ConnectionLoss("socket closed".into());
        assert!(loss.is_retryable());
        assert!(!loss.is_not_found());

        let timeout = CoordinationError::Timeout("read".into());
        assert!(timeout.is_retryable());

        let missing = CoordinationError::NotFound("/Channels/c1".into());
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());

        let exists = CoordinationError::NodeExists("/Channels/c1".into());
        assert!(exists.is_node_exists());
        assert!(!exists.is_retryable());

        assert!(!CoordinationError::SessionExpired.is_retryable());
        assert!(!CoordinationError::SessionClosed.is_retryable());
        assert!(!CoordinationError::ConnectionFatal("refused".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CoordinationError::Corrupt {
            path: "/AvailableServers/a/CurrentTotalConnections".into(),
            reason: "not an integer".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("CurrentTotalConnections"));
        assert!(msg.contains("not an integer"));
    }
}
