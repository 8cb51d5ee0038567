//! Error types for the swarm.

use thiserror::Error;

/// Result type for swarm operations.
pub type Result<T> = std::result::Result<T, SwarmError>;

/// Errors that can occur while joining or running a swarm.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Hello exchange failed or the peer is on another topic
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Invalid topic or address
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
