//! Transport abstraction shared by every swarm implementation.

use crate::error::Result;
use crate::topic::Topic;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Any bidirectional byte stream a peer connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed peer stream.
pub type PeerStream = Box<dyn AsyncStream>;

/// A connection to one peer on a topic.
pub struct PeerConnection {
    /// Human-readable peer identifier (address or node name)
    pub peer: String,
    /// True if we dialed, false if the peer dialed us
    pub initiator: bool,
    /// The stream, already past any transport-level hello
    pub stream: PeerStream,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}

/// Membership in one topic.
///
/// Yields connections as peers are found. Dropping (or destroying) the swarm
/// stops the listener and dialer tasks; streams already handed out stay with
/// their owners.
pub struct Swarm {
    topic: Topic,
    incoming: mpsc::Receiver<PeerConnection>,
    tasks: Vec<JoinHandle<()>>,
}

impl Swarm {
    /// Create a swarm from its connection channel and background tasks.
    pub fn new(
        topic: Topic,
        incoming: mpsc::Receiver<PeerConnection>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            topic,
            incoming,
            tasks,
        }
    }

    /// The topic this swarm joined.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next peer connection. Returns `None` once the swarm is shut down.
    pub async fn next_connection(&mut self) -> Option<PeerConnection> {
        self.incoming.recv().await
    }

    /// Leave the topic.
    pub fn destroy(mut self) {
        self.stop();
        debug!("Swarm for topic {} destroyed", self.topic);
    }

    fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.incoming.close();
    }
}

impl Drop for Swarm {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A way of joining topics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join a topic as both server and client.
    async fn join(&self, topic: Topic) -> Result<Swarm>;
}
