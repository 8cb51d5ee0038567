//! Lista swarm: topic-addressed peer transport.
//!
//! Peers that join the same [`Topic`] are connected pairwise and handed a
//! bidirectional byte stream. What travels over the stream is up to the
//! caller (log replication, writer handshakes).
//!
//! Two transports are provided:
//!
//! - [`TcpTransport`]: listener plus bootstrap dialing, with a one-line topic
//!   hello before the stream is handed out
//! - [`MemoryTransport`]: in-process hub over `tokio::io::duplex`, for tests
//!   and single-machine demos

pub mod error;
pub mod memory;
pub mod tcp;
pub mod topic;
pub mod transport;

pub use error::{Result, SwarmError};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;
pub use topic::Topic;
pub use transport::{AsyncStream, PeerConnection, PeerStream, Swarm, Transport};
