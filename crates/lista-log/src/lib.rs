//! Lista log: the multi-writer append-only log under the list engine.
//!
//! - [`key`]: writer and group keys
//! - [`node`]: signed log entries and their merge order
//! - [`store`]: RocksDB storage for writer logs and merge state
//! - [`base`]: the group log with its causal merge and apply hook
//! - [`replicate`]: the peer replication session
//! - [`group`]: traits the engine programs against

pub mod base;
pub mod error;
pub mod group;
pub mod key;
pub mod node;
pub mod replicate;
pub mod store;

pub use base::{Base, RocksBackend};
pub use error::{ErrorKind, LogError, Result};
pub use group::{
    ApplyHook, ApplyHost, GroupLog, LogBackend, LogEvent, MergeBatch, MergedNode,
};
pub use key::{GroupKey, WriterKey};
pub use node::{Node, OrderKey};
