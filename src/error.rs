//! Error types for hmq

use thiserror::Error;

/// Errors that can occur in the broker or client
#[derive(Debug, Error)]
pub enum HmqError {
    /// Handshake or frame-level protocol violation; the connection is closed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame encode/decode failure
    #[error("Frame error: {0}")]
    Frame(String),

    /// Connection failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Connection closed by the peer
    #[error("Connection closed")]
    Closed,

    /// Peer is unreachable; a write to its socket failed
    #[error("Client unreachable: {0}")]
    Unreachable(String),

    /// A delivery handler voted to deny the operation
    #[error("Denied by delivery handler: {0}")]
    PolicyDenied(String),

    /// Queue reached its configured message limit
    #[error("Queue '{0}' is full")]
    QueueFull(String),

    /// Queue, router, or client not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Queue journal read or write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket read or write failure
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type alias for broker and client operations
pub type Result<T> = std::result::Result<T, HmqError>;
