//! Error types for elohim-connect

use thiserror::Error;

/// Result type for connection and sync operations
pub type Result<T> = std::result::Result<T, ConnectError>;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Not connected to conductor")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel-level failure: socket closed, send failed, token rejected.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The conductor rejected the call for domain reasons.
    #[error("Zome call failed: {0}")]
    Zome(String),

    #[error("No cell for role '{role}', available: [{}]", .available.join(", "))]
    NoCellForRole { role: String, available: Vec<String> },

    #[error("Circuit '{0}' is open")]
    CircuitOpen(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectError {
    /// Whether this error means the channel itself is unusable.
    ///
    /// Transport errors are reconnect triggers and get log-suppressed;
    /// everything else is treated as a business or local failure.
    pub fn is_transport(&self) -> bool {
        match self {
            ConnectError::Transport(_) | ConnectError::Connection(_) | ConnectError::NotConnected => {
                true
            }
            ConnectError::Timeout(_) => false,
            ConnectError::Zome(msg) | ConnectError::Protocol(msg) => looks_like_transport(msg),
            _ => false,
        }
    }
}

/// Conductor error strings that actually describe a dead channel.
fn looks_like_transport(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    [
        "not open",
        "invalid token",
        "connection refused",
        "connection closed",
        "websocket closed",
        "socket is closed",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}
