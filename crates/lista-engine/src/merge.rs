//! The merge engine: the log's apply hook.
//!
//! Folds merged entries into the [`MaterializedList`] exactly once, in
//! order, and is the only origin of per-item notifications.

use crate::list::{FoldOutcome, MaterializedList};
use crate::notify::{Notification, Notifier};
use crate::ops::{ListItem, Operation};
use crate::replay;
use lista_log::{ApplyHook, ApplyHost, MergeBatch, MergedNode};
use tracing::{debug, info, warn};

/// Owner of the materialized list.
pub struct MergeEngine {
    list: MaterializedList,
    notifier: Notifier,
    gained_write: bool,
}

impl MergeEngine {
    /// Create an engine with an empty list.
    pub fn new(notifier: Notifier) -> Self {
        Self {
            list: MaterializedList::new(),
            notifier,
            gained_write: false,
        }
    }

    /// Current list.
    pub fn list(&self) -> &MaterializedList {
        &self.list
    }

    /// Snapshot of the current items.
    pub fn snapshot(&self) -> Vec<ListItem> {
        self.list.items().to_vec()
    }

    /// Install a replayed list.
    pub fn set_list(&mut self, list: MaterializedList) {
        self.list = list;
        self.gained_write = false;
    }

    /// Drop all state (group switch or reset).
    pub fn clear(&mut self) {
        self.list.clear();
        self.gained_write = false;
    }

    /// True once after an add-writer entry authorized the local writer.
    pub fn take_gained_write(&mut self) -> bool {
        std::mem::take(&mut self.gained_write)
    }

    fn fold_node(&mut self, node: &MergedNode, host: &mut dyn ApplyHost, quiet: bool) {
        let op = match Operation::parse(&node.value) {
            Ok(op) => op,
            Err(e) => {
                warn!(
                    "Skipping malformed operation at merged index {}: {}",
                    node.index, e
                );
                return;
            }
        };

        match &op {
            Operation::AddWriter(key) => match host.add_writer(*key) {
                Ok(true) => {
                    info!(
                        "Authorized writer {} (entry {} of {})",
                        key, node.seq, node.writer
                    );
                    if *key == host.local_key() {
                        info!("Local writer gained write access");
                        self.gained_write = true;
                    }
                }
                Ok(false) => debug!("Writer {} already authorized", key),
                Err(e) => warn!("Failed to authorize writer {}: {}", key, e),
            },
            Operation::Unknown(_) => {
                debug!("Carrying unknown operation at merged index {}", node.index)
            }
            _ => {
                debug!("Applying {} at merged index {}", op.kind(), node.index);
                let outcome = self.list.fold(&op);
                if !quiet {
                    self.emit(outcome);
                }
            }
        }

        if let Err(e) = host.view_append(node.index, &node.value) {
            warn!("Failed to record merged index {} in view: {}", node.index, e);
        }
    }

    fn emit(&self, outcome: FoldOutcome) {
        let notification = match outcome {
            FoldOutcome::Added(item) => Notification::ItemAdded { item },
            FoldOutcome::Updated(item) => Notification::ItemUpdated { item },
            FoldOutcome::Deleted(item) => Notification::ItemDeleted { item },
            FoldOutcome::Replaced(items) => Notification::ListSnapshot { items },
            FoldOutcome::Skipped => return,
        };
        self.notifier.notify(notification);
    }
}

impl ApplyHook for MergeEngine {
    fn apply(&mut self, batch: &MergeBatch, host: &mut dyn ApplyHost) {
        let reordered = batch.truncated_from.is_some();
        if let Some(from) = batch.truncated_from {
            info!("Merged order changed from index {}, rebuilding list", from);
            let replay = replay::rebuild(from, |index| host.merged_get(index).map(|n| n.value));
            self.list = replay.list;
        }

        for node in &batch.nodes {
            self.fold_node(node, host, reordered);
        }

        if reordered {
            self.notifier.notify(Notification::ListSnapshot {
                items: self.snapshot(),
            });
        }
    }
}
