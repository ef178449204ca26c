//! Error types for the Godot bridge

use std::time::Duration;
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Peer unreachable within the connect deadline
    #[error("Connection timeout to {addr} after {after:?}")]
    ConnectionTimeout { addr: String, after: Duration },

    /// Peer refused the connection or the socket failed while connecting
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Write attempted while no transport is connected
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No response arrived before the request deadline
    #[error("Request '{operation}' (id {id}) timed out after {after:?}")]
    RequestTimeout {
        operation: String,
        id: u64,
        after: Duration,
    },

    /// Peer answered with an unsuccessful response
    #[error("Remote failure in '{operation}': {message}")]
    RemoteFailure { operation: String, message: String },

    /// Peer disconnected while the request was outstanding
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Caller supplied malformed arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl BridgeError {
    /// True for failures caused by the transport rather than the remote operation
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionTimeout { .. }
                | BridgeError::ConnectFailed { .. }
                | BridgeError::TransportUnavailable(_)
                | BridgeError::TransportClosed(_)
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

/// JSON-RPC error codes reported to MCP clients
pub mod error_codes {
    pub const REMOTE_FAILURE: i32 = -32000;
    pub const REQUEST_TIMEOUT: i32 = -32001;
    pub const NOT_CONNECTED: i32 = -32002;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const METHOD_NOT_FOUND: i32 = -32601;
}
