//! Push notifications to the UI.

use crate::ops::ListItem;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// A notification for the UI process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    ItemAdded { item: ListItem },
    ItemUpdated { item: ListItem },
    ItemDeleted { item: ListItem },
    ListSnapshot { items: Vec<ListItem> },
    PeerCountChanged { count: usize },
    NotAuthorizedYet { message: String },
    ErrorNotification { title: String, message: String },
    ResetOccurred,
    /// Current group key, sent after every initialization
    GroupKey { key: String },
    /// The log was reopened under the same group
    Reinitialized { reason: String },
}

impl Notification {
    /// Shorthand for an error notification.
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Notification::ErrorNotification {
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Broadcast fan-out of notifications.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    /// Create a notifier with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Send to every subscriber. Having none is not an error.
    pub fn notify(&self, notification: Notification) {
        debug!("Notify: {:?}", notification);
        let _ = self.tx.send(notification);
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}
