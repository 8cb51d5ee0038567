//! Command surface for the UI process.
//!
//! Requests and responses are single JSON lines:
//!
//! ```text
//! {"cmd":"add_item","text":"Milk"}
//! {"cmd":"update_item","item":{"text":"Milk","isDone":true,"timeOfCompletion":1700000000000}}
//! {"cmd":"delete_item","item":{"text":"Milk"}}
//! {"cmd":"join_group","key":"<64 hex>"}
//! ```

use crate::engine::Engine;
use crate::error::EngineError;
use crate::lifecycle::Phase;
use crate::ops::ListItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Request from the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Add an item
    AddItem {
        text: String,
        #[serde(default, rename = "listId")]
        list_id: Option<String>,
    },
    /// Replace the item with the same text
    UpdateItem { item: Value },
    /// Delete the item with the same text
    DeleteItem { item: Value },
    /// Writer key of this device
    GetLocalIdentityKey,
    /// Key of the current group
    GetGroupKey,
    /// Current items
    ListItems,
    /// Switch to another group
    JoinGroup { key: String },
    /// Pull and merge again
    RequestResync,
    /// Health check
    Ping,
}

/// Reply to a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { message: String },
    Key { key: String },
    Items { items: Vec<ListItem> },
    NotAuthorized { message: String },
    Error { error: String },
    Pong { phase: Phase, peers: usize },
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotAuthorized => Response::NotAuthorized {
                message: e.to_string(),
            },
            other => Response::Error {
                error: other.to_string(),
            },
        }
    }
}

/// Run one command against the engine.
pub async fn execute(engine: &Engine, cmd: Command) -> Response {
    match cmd {
        Command::AddItem { text, list_id } => match engine.add_item(&text, list_id).await {
            Ok(()) => Response::Ok {
                message: format!("Added: {}", text.trim()),
            },
            Err(e) => e.into(),
        },

        Command::UpdateItem { item } => match ListItem::from_value(&item) {
            Ok(item) => {
                let text = item.text.clone();
                match engine.update_item(item).await {
                    Ok(()) => Response::Ok {
                        message: format!("Updated: {}", text),
                    },
                    Err(e) => e.into(),
                }
            }
            Err(e) => Response::Error {
                error: format!("Invalid item: {}", e),
            },
        },

        Command::DeleteItem { item } => match ListItem::from_value_lenient(&item) {
            Ok(item) => {
                let text = item.text.clone();
                match engine.delete_item(item).await {
                    Ok(()) => Response::Ok {
                        message: format!("Deleted: {}", text),
                    },
                    Err(e) => e.into(),
                }
            }
            Err(e) => Response::Error {
                error: format!("Invalid item: {}", e),
            },
        },

        Command::GetLocalIdentityKey => match engine.local_identity_key().await {
            Some(key) => Response::Key { key },
            None => EngineError::NotReady.into(),
        },

        Command::GetGroupKey => match engine.group_key().await {
            Some(key) => Response::Key { key: key.to_hex() },
            None => EngineError::NotReady.into(),
        },

        Command::ListItems => Response::Items {
            items: engine.items().await,
        },

        Command::JoinGroup { key } => match engine.join_group(&key).await {
            Ok(()) => {
                info!("Joined group via command");
                Response::Ok {
                    message: "Joined group".to_string(),
                }
            }
            Err(e) => e.into(),
        },

        Command::RequestResync => match engine.request_resync().await {
            Ok(()) => Response::Ok {
                message: "Resynced".to_string(),
            },
            Err(e) => e.into(),
        },

        Command::Ping => Response::Pong {
            phase: engine.phase(),
            peers: engine.peer_count(),
        },
    }
}
