//! Lista engine: a serverless replicated shared list.
//!
//! Every device appends list operations to its own writer log; the logs are
//! merged into one deterministic order and folded into the list.
//!
//! - [`ops`]: operation schema and list items
//! - [`list`]: the materialized list and its fold rules
//! - [`merge`]: the apply hook driving the fold and notifications
//! - [`replay`]: startup rebuild from the merged order
//! - [`writer`]: serialized, confirmed local writes
//! - [`membership`]: the writer-key handshake granting write access
//! - [`replication`]: swarm wiring for one group
//! - [`recovery`]: retry, soft reinit and reset escalation
//! - [`lifecycle`]: the single-flight guard over start, reset and join
//! - [`storage`] / [`lock`]: on-disk layout and process lock
//! - [`engine`]: everything above put together
//! - [`command`]: the request/response surface for the UI process

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod list;
pub mod lock;
pub mod membership;
pub mod merge;
pub mod notify;
pub mod ops;
pub mod recovery;
pub mod replay;
pub mod replication;
pub mod storage;
pub mod writer;

pub use command::{execute, Command, Response};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use lifecycle::Phase;
pub use list::MaterializedList;
pub use notify::{Notification, Notifier};
pub use ops::{ListItem, Operation};
pub use recovery::RetryPolicy;
