//! Error types for the workspace cache.

use thiserror::Error;

use crate::types::ClientServerId;

/// Errors reported by a [`ServerConnector`](crate::connector::ServerConnector).
///
/// The cache only needs to tell three failure kinds apart: the link to the
/// server went away, the server refused our credentials, or the server
/// rejected the command itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// The server could not be reached or the session dropped.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The server rejected the configured credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server processed the command and refused it.
    #[error("command rejected: {0}")]
    Command(String),
}

/// Errors that can occur while reading or synchronizing the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Connectivity was lost during a server operation.
    #[error("disconnected from server: {0}")]
    Disconnected(String),

    /// The server rejected the configured credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server rejected a command.
    #[error("server rejected command: {0}")]
    Validation(String),

    /// An internal invariant did not hold.
    #[error("internal cache error: {0}")]
    Internal(String),

    /// The client identity has no client name.
    #[error("invalid client: {0}")]
    InvalidClient(ClientServerId),

    /// The server configuration was marked invalid.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    /// The server is working offline.
    #[error("server {0} is offline")]
    Offline(String),

    /// A server command did not finish in time.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// The cache manager was shut down.
    #[error("cache has been disposed")]
    Disposed,

    /// Filesystem failure while persisting state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted state document could not be interpreted.
    #[error("invalid state document: {0}")]
    Document(String),
}

impl CacheError {
    /// Whether the failing operation may succeed if retried after reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Disconnected(_) | CacheError::Offline(_) | CacheError::Timeout { .. }
        )
    }
}

impl From<ConnectorError> for CacheError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Disconnected(msg) => CacheError::Disconnected(msg),
            ConnectorError::Authentication(msg) => CacheError::Authentication(msg),
            ConnectorError::Command(msg) => CacheError::Validation(msg),
        }
    }
}

/// Convenience alias for cache results.
pub type Result<T> = std::result::Result<T, CacheError>;
