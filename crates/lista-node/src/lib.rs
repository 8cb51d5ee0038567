//! Lista node: runs the shared-list engine as a local daemon.
//!
//! The UI process talks to the daemon over a Unix socket with newline
//! delimited JSON; see [`ipc`].

pub mod config;
pub mod error;
pub mod ipc;
pub mod node;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use ipc::IpcServer;
pub use node::ListaNode;
