//! Error types for the node.

use lista_engine::EngineError;
use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the node.
#[derive(Debug, Error)]
pub enum Error {
    /// Engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
