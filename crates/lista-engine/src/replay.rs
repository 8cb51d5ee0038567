//! Startup replay.
//!
//! Rebuilds the list from the persisted merged order before the engine
//! takes live traffic. Entries are folded with the same rules as the live
//! merge, so a restart reproduces exactly what live folding produced.

use crate::error::Result;
use crate::list::MaterializedList;
use crate::notify::{Notification, Notifier};
use crate::ops::{ListItem, Operation};
use crate::writer::WriteSerializer;
use lista_log::{ErrorKind, GroupLog, LogError};
use serde_json::Value;
use tracing::{debug, info, warn};

/// First-run items, in display order.
pub const DEFAULT_LIST: [&str; 3] = [
    "Tap to mark as done",
    "Double tap to add new",
    "Slide right slowly to delete",
];

/// Result of folding a prefix of the merged order.
#[derive(Debug, Default)]
pub struct Replay {
    pub list: MaterializedList,
    /// Entries read
    pub entries: u64,
    /// Entries that could not be read or parsed
    pub skipped: u64,
    /// Set if any read failed with a corruption error
    pub corrupted: bool,
}

/// Fold merged entries `0..len`. Never fails; bad entries are skipped.
pub fn rebuild<F>(len: u64, mut read: F) -> Replay
where
    F: FnMut(u64) -> std::result::Result<Value, LogError>,
{
    let mut replay = Replay::default();
    for index in 0..len {
        replay.entries += 1;
        let value = match read(index) {
            Ok(v) => v,
            Err(e) => {
                warn!("Replay could not read entry {}: {}", index, e);
                replay.corrupted |= e.kind() == ErrorKind::Corruption;
                replay.skipped += 1;
                continue;
            }
        };
        match Operation::parse(&value) {
            Ok(Operation::AddWriter(key)) => debug!("Replay entry {}: skipped add-writer {}", index, key),
            Ok(op) => {
                replay.list.fold(&op);
            }
            Err(e) => {
                warn!("Replay entry {}: skipped malformed operation: {}", index, e);
                replay.skipped += 1;
            }
        }
    }
    replay
}

/// Rebuild the list for a freshly opened log, seed first-run defaults and
/// push the snapshot.
pub async fn materialize(
    log: &dyn GroupLog,
    writer: &WriteSerializer,
    notifier: &Notifier,
    seed_defaults: bool,
) -> Result<Replay> {
    let merged_len = log.merged_len()?;
    let replay = rebuild(merged_len, |index| log.merged_get(index).map(|n| n.value));
    info!(
        "Replayed {} entries into {} items ({} skipped)",
        replay.entries,
        replay.list.len(),
        replay.skipped
    );

    if seed_defaults && replay.list.is_empty() && log.local_len()? == 0 && log.is_writable() {
        info!("First run: seeding {} default items", DEFAULT_LIST.len());
        for text in DEFAULT_LIST.iter().rev() {
            writer
                .submit(Operation::Add(ListItem::new(*text, None)))
                .await?;
        }
    }

    notifier.notify(Notification::ListSnapshot {
        items: replay.list.items().to_vec(),
    });
    Ok(replay)
}
