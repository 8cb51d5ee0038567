//! Error types for the engine.

use crate::lifecycle::Phase;
use lista_log::LogError;
use lista_swarm::SwarmError;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Log error
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// Swarm error
    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    /// The local writer has not been authorized yet
    #[error("Not authorized yet: waiting to be added as a writer")]
    NotAuthorized,

    /// The write was queued against a group that is being torn down
    #[error("Superseded by a group switch or reset")]
    Superseded,

    /// The log did not grow after a flush
    #[error("Write not persisted: local length {actual}, expected {expected}")]
    Unconfirmed { expected: u64, actual: u64 },

    /// Another lifecycle operation is in progress
    #[error("Busy: engine is {0:?}")]
    Busy(Phase),

    /// Rejected lifecycle transition
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: Phase, to: Phase },

    /// Engine has not been started
    #[error("Engine is not ready")]
    NotReady,

    /// Storage lock held by another process
    #[error("Storage is locked by another instance: {0}")]
    Locked(String),

    /// Malformed key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The underlying log error, if any.
    pub fn as_log(&self) -> Option<&LogError> {
        match self {
            EngineError::Log(e) => Some(e),
            _ => None,
        }
    }
}
