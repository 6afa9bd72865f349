//! Error types shared across the protocol layer, transports, and the
//! client/server surfaces.

use std::time::Duration;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// Peer-visible failures travel as JSON-RPC error envelopes and surface
/// locally as [`Error::Rpc`]; everything else is a caller-visible condition
/// that never reaches the wire.
#[derive(Error, Debug)]
pub enum Error {
    /// The peer answered a request with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The transport shut down while the operation was in flight, or an
    /// operation was attempted after close.
    #[error("transport closed")]
    TransportClosed,

    /// No transport has been connected yet.
    #[error("protocol is not connected to a transport")]
    NotConnected,

    /// The pending response did not arrive within the request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller abandoned the request before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    // ===== Push-stream transport =====
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("session buffer full: {0}")]
    SessionBufferFull(String),

    // ===== Client =====
    #[error("client not initialized")]
    NotInitialized,

    #[error("client already initialized")]
    AlreadyInitialized,

    // ===== Registry =====
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("prompt not found: {0}")]
    PromptNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    // ===== Transport plumbing =====
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP server error: {0}")]
    HttpServer(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure bubbled out of a user-supplied handler.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl Error {
    /// Builds an [`Error::Rpc`] from the pieces of a wire error object.
    ///
    /// # Arguments
    ///
    /// * `code` - The error code reported by the peer
    /// * `message` - The error message reported by the peer
    ///
    /// # Returns
    ///
    /// A new [`Error::Rpc`] with no attached data
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }
}
