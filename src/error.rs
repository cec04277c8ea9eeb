//! Error types for Chatlink
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Chatlink operations
///
/// Transport-level failures are normally absorbed by the connection manager's
/// reconnect loop; the variants below are what reaches callers once a failure
/// has to be surfaced.
#[derive(Error, Debug)]
pub enum ChatlinkError {
    /// Invalid options at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No response arrived for a correlated request within its deadline
    #[error("Request timeout: type={request_type}, timeout_ms={timeout_ms}")]
    RequestTimeout {
        /// Request type that timed out
        request_type: String,
        /// Deadline that elapsed
        timeout_ms: u64,
    },

    /// Operation cancelled by a deliberate disconnect or reset
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Outbound queue is full and the overflow policy rejects new frames
    #[error("Outbound queue full: capacity={capacity}")]
    QueueFull {
        /// Configured maximum queue size
        capacity: usize,
    },

    /// The remote side answered a request with an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// A remote push was rejected because every differing field is newer locally
    #[error("Sync conflict: locally pending fields {}", fields.join(", "))]
    SyncConflict {
        /// Fields the remote push tried to overwrite
        fields: Vec<String>,
    },

    /// A reset was requested while unsynced changes exist
    #[error("Session has {count} unsynced change(s); confirm discard to reset")]
    UnsyncedChanges {
        /// Number of pending changes that would be lost
        count: usize,
    },

    /// No session has been initialised
    #[error("No active session")]
    NoSession,

    /// Backend-reported task failure
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Persisted client state errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors from the fallback transport
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint URL errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ChatlinkError {
    /// Returns true when the error came from the transport rather than the
    /// remote side, meaning the operation may succeed after a reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatlinkError::Transport(_)
                | ChatlinkError::RequestTimeout { .. }
                | ChatlinkError::Http(_)
        )
    }
}

/// Result type alias for Chatlink operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Find the [`ChatlinkError`] carried by an `anyhow::Error`, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<&ChatlinkError> {
    err.downcast_ref::<ChatlinkError>()
}
