//! In-process transport.
//!
//! Every member of a topic is connected to every other member through a
//! `tokio::io::duplex` pair. Members whose swarm was dropped are pruned on
//! the next join.

use crate::error::Result;
use crate::topic::Topic;
use crate::transport::{PeerConnection, Swarm, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

const DUPLEX_BUFFER: usize = 64 * 1024;
const CONNECTION_QUEUE: usize = 64;

struct Member {
    name: String,
    tx: mpsc::Sender<PeerConnection>,
}

/// Shared hub that connects [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    topics: Arc<Mutex<HashMap<Topic, Vec<Member>>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network.
    pub fn transport(&self, name: &str) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            name: name.to_string(),
        }
    }

    /// Number of live members on a topic.
    pub fn members(&self, topic: &Topic) -> usize {
        let topics = match self.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .get(topic)
            .map(|m| m.iter().filter(|m| !m.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    name: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn join(&self, topic: Topic) -> Result<Swarm> {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);

        let existing: Vec<(String, mpsc::Sender<PeerConnection>)> = {
            let mut topics = match self.network.topics.lock() {
                Ok(t) => t,
                Err(poisoned) => poisoned.into_inner(),
            };
            let members = topics.entry(topic).or_default();
            members.retain(|m| !m.tx.is_closed());
            let existing = members
                .iter()
                .map(|m| (m.name.clone(), m.tx.clone()))
                .collect();
            members.push(Member {
                name: self.name.clone(),
                tx: tx.clone(),
            });
            existing
        };

        debug!(
            "{} joined in-memory topic {} ({} existing members)",
            self.name,
            topic,
            existing.len()
        );

        let name = self.name.clone();
        let introduce = tokio::spawn(async move {
            for (peer_name, peer_tx) in existing {
                let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
                let delivered = peer_tx
                    .send(PeerConnection {
                        peer: name.clone(),
                        initiator: false,
                        stream: Box::new(theirs),
                    })
                    .await
                    .is_ok();
                if delivered {
                    let outgoing = PeerConnection {
                        peer: peer_name,
                        initiator: true,
                        stream: Box::new(ours),
                    };
                    if tx.send(outgoing).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Swarm::new(topic, rx, vec![introduce]))
    }
}
