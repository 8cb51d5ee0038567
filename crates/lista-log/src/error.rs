//! Error types for the log.
//!
//! Backend failures are classified into an [`ErrorKind`] here, where the
//! error is raised, so callers never need to inspect error text.

use crate::key::GroupKey;
use thiserror::Error;

/// Result type for log operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// Coarse classification used by recovery code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A dependency has not fully replicated yet; retrying can succeed
    Transient,
    /// On-disk state failed an integrity check
    Corruption,
    /// Another process holds the storage
    Locked,
    /// The log was closed underneath the caller
    Closed,
    /// The local writer is not a member of the group
    NotWritable,
    /// Anything else
    Other,
}

/// Errors that can occur in log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Read past the end of a log that has not fully replicated
    #[error("Invalid checkout {checkout}, length is {length}")]
    Checkout { checkout: u64, length: u64 },

    /// Integrity failure
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Storage held by another process
    #[error("Storage locked: {0}")]
    Locked(String),

    /// Log closed
    #[error("Log is closed")]
    Closed,

    /// Append without write access
    #[error("Local writer is not a member of the group")]
    NotWritable,

    /// Opened storage belongs to another group
    #[error("Group mismatch: expected {expected}, found {found}")]
    GroupMismatch { expected: GroupKey, found: GroupKey },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LogError::Checkout { .. } => ErrorKind::Transient,
            LogError::Corruption(_) => ErrorKind::Corruption,
            LogError::Locked(_) => ErrorKind::Locked,
            LogError::Closed => ErrorKind::Closed,
            LogError::NotWritable => ErrorKind::NotWritable,
            _ => ErrorKind::Other,
        }
    }
}

impl From<rocksdb::Error> for LogError {
    fn from(e: rocksdb::Error) -> Self {
        let message = e.to_string();
        match e.kind() {
            rocksdb::ErrorKind::Corruption => LogError::Corruption(message),
            rocksdb::ErrorKind::IOError if message.to_ascii_lowercase().contains("lock") => {
                LogError::Locked(message)
            }
            rocksdb::ErrorKind::ShutdownInProgress => LogError::Closed,
            _ => LogError::Storage(message),
        }
    }
}

impl From<ed25519_dalek::SignatureError> for LogError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        LogError::Corruption(format!("signature: {}", e))
    }
}
