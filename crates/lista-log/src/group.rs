//! Traits between the log and its consumer.
//!
//! [`GroupLog`] is what the sync engine drives; [`ApplyHook`] is what the
//! log calls back into with newly merged entries.

use crate::error::Result;
use crate::key::{GroupKey, WriterKey};
use async_trait::async_trait;
use lista_swarm::PeerStream;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One entry at its position in the merged order.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedNode {
    /// Position in the merged order
    pub index: u64,
    /// Author
    pub writer: WriterKey,
    /// Position in the author's log
    pub seq: u64,
    /// Operation payload
    pub value: Value,
}

/// A batch of merged entries handed to the apply hook.
#[derive(Debug, Clone, Default)]
pub struct MergeBatch {
    /// Set when entries from this index on were reordered. The hook must
    /// discard whatever it derived from them before folding `nodes`.
    pub truncated_from: Option<u64>,
    /// Entries in merged order, starting at `truncated_from` or the previous length
    pub nodes: Vec<MergedNode>,
}

/// What the apply hook may do to the log while folding.
pub trait ApplyHost {
    /// Authorize a writer. Returns true if it was not a member before.
    fn add_writer(&mut self, key: WriterKey) -> Result<bool>;

    /// Check whether a writer is authorized.
    fn is_writer(&self, key: &WriterKey) -> bool;

    /// The local writer.
    fn local_key(&self) -> WriterKey;

    /// Record a value in the durable view at a merged position.
    fn view_append(&mut self, index: u64, value: &Value) -> Result<()>;

    /// Read an already merged entry (used to rebuild after a reorder).
    fn merged_get(&self, index: u64) -> Result<MergedNode>;
}

/// Deterministic fold over merged entries.
pub trait ApplyHook: Send {
    /// Fold a batch. Must not fail; malformed entries are skipped.
    fn apply(&mut self, batch: &MergeBatch, host: &mut dyn ApplyHost);
}

/// Notifications from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A writer log grew, locally or by replication
    Appended { writer: WriterKey, length: u64 },
    /// A range of a writer log was explicitly requested from peers
    Wanted { writer: WriterKey, start: u64, end: u64 },
}

/// A multi-writer group log.
#[async_trait]
pub trait GroupLog: Send + Sync {
    /// Key of the group.
    fn group_key(&self) -> GroupKey;

    /// Key of the local writer.
    fn local_key(&self) -> WriterKey;

    /// Whether the local writer is authorized.
    fn is_writable(&self) -> bool;

    /// Whether a writer is authorized.
    fn is_writer(&self, key: &WriterKey) -> bool;

    /// Whether the log has been closed.
    fn is_closed(&self) -> bool;

    /// Length of the local writer's log.
    fn local_len(&self) -> Result<u64>;

    /// Length of any writer's log held locally.
    fn writer_len(&self, writer: &WriterKey) -> Result<u64>;

    /// Append to the local writer's log. Returns the new length.
    async fn append(&self, value: Value) -> Result<u64>;

    /// Flush to stable storage.
    async fn flush(&self) -> Result<()>;

    /// Merge every entry whose dependencies are available and hand them to `hook`.
    /// Returns the number of entries delivered.
    async fn update(&self, hook: &mut dyn ApplyHook) -> Result<usize>;

    /// Length of the merged order.
    fn merged_len(&self) -> Result<u64>;

    /// Read an entry of the merged order.
    fn merged_get(&self, index: u64) -> Result<MergedNode>;

    /// Ask connected peers for a range of a writer's log. `end` may be `u64::MAX`.
    fn request_range(&self, writer: WriterKey, start: u64, end: u64);

    /// Subscribe to log events.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Replicate every writer log with a peer until the stream closes.
    async fn replicate(&self, stream: PeerStream) -> Result<()>;

    /// Close the log and release its storage.
    async fn close(&self) -> Result<()>;
}

/// Opens group logs from a directory.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Open (or create) the log stored in `dir`.
    ///
    /// With `group = None` a new group is created whose key is the local
    /// writer's key, unless the directory already belongs to a group.
    async fn open(&self, dir: &Path, group: Option<GroupKey>) -> Result<Arc<dyn GroupLog>>;
}
