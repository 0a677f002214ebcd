//! Common error types for Taask components.

use thiserror::Error;

/// Result alias used throughout the Taask crates
pub type Result<T> = std::result::Result<T, TaaskError>;

/// Common errors across Taask components
#[derive(Debug, Error)]
pub enum TaaskError {
    /// Handshake, signature, freshness or session failure
    #[error("Auth error: {0}")]
    Auth(String),

    /// Encrypt/decrypt/verify or key parsing failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Update version is not the task's current version + 1
    #[error("Version conflict on task {task}: expected version {expected}, got {got}")]
    VersionConflict { task: String, expected: u64, got: u64 },

    /// Status transition not allowed by the task state machine
    #[error("Illegal transition on task {task}: {from} -> {to}")]
    IllegalTransition {
        task: String,
        from: String,
        to: String,
    },

    /// Network/stream failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unrecoverable configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown task, member or group
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// JSON encoding/decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TaaskError {
    /// Returns true if the partner connection lifecycle should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Transport(_) | Self::Timeout(_))
    }

    /// Returns true for state-machine rejections (the update was discarded)
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::IllegalTransition { .. }
        )
    }
}

impl From<serde_json::Error> for TaaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(TaaskError::Transport("reset".into()).is_retryable());
        assert!(TaaskError::Auth("stale".into()).is_retryable());
        assert!(!TaaskError::Crypto("bad tag".into()).is_retryable());
        assert!(!TaaskError::Config("missing host".into()).is_retryable());

        let conflict = TaaskError::VersionConflict {
            task: "t".into(),
            expected: 2,
            got: 4,
        };
        assert!(conflict.is_rejection());
        assert!(!conflict.is_retryable());
    }
}
