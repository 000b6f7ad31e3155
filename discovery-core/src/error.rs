//! Errors returned by the registries and the discovery selector.

use coordination::CoordinationError;
use thiserror::Error;

/// Result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors surfaced to discovery and registration callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// No server is currently registered.
    #[error("no servers available")]
    NoServersAvailable,

    /// The channel's owner is alive but at or above the load ceiling.
    #[error("server {host} is at load {load} (ceiling {ceiling}), retry later")]
    RetryLater { host: String, load: u64, ceiling: u64 },

    /// The channel's owner is no longer registered.
    #[error("owner {host} of channel {channel_id} is unavailable")]
    OwnerUnavailable { channel_id: String, host: String },

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// This host already has a live registration.
    #[error("server {0} is already registered")]
    AlreadyRegistered(String),

    /// A channel with this id already exists.
    #[error("channel {0} already exists")]
    AlreadyExists(String),

    /// The channel is owned by another server.
    #[error("channel {channel_id} is owned by {owner}")]
    NotOwner { channel_id: String, owner: String },

    /// A stored record could not be decoded.
    #[error("corrupt record at {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    /// The coordination session expired; the registry must be reopened.
    #[error("coordination session expired")]
    Expired,

    #[error(transparent)]
    Coordination(CoordinationError),
}

impl DiscoveryError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            DiscoveryError::RetryLater { .. } => true,
            DiscoveryError::Coordination(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error comes from an invalid channel id or host.
    pub fn is_invalid_name(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Coordination(CoordinationError::InvalidName(_))
        )
    }
}

impl From<CoordinationError> for DiscoveryError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Corrupt { path, reason } => {
                DiscoveryError::CorruptRecord { path, reason }
            }
            CoordinationError::SessionExpired => DiscoveryError::Expired,
            other => DiscoveryError::Coordination(other),
        }
    }
}
