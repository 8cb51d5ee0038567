//! TCP transport.
//!
//! Each swarm binds its own listener and dials the configured bootstrap
//! peers. Before a stream is handed out, both sides exchange one hello line:
//!
//! ```text
//! {"type":"hello","topic":"<64 hex>","peer":"<node id>"}\n
//! ```
//!
//! Connections announcing a different topic are closed.

use crate::error::{Result, SwarmError};
use crate::topic::Topic;
use crate::transport::{PeerConnection, PeerStream, Swarm, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Longest hello line we accept.
const MAX_HELLO_LEN: usize = 1024;

const CONNECTION_QUEUE: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HelloMessage {
    Hello { topic: String, peer: String },
}

/// TCP listener plus bootstrap dialer.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    listen_addr: SocketAddr,
    bootstrap_peers: Vec<String>,
    peer_id: String,
    redial_interval: Duration,
    max_redials: u32,
}

impl TcpTransport {
    /// Create a transport listening on `listen_addr` that dials `bootstrap_peers`.
    pub fn new(listen_addr: SocketAddr, bootstrap_peers: Vec<String>) -> Self {
        Self {
            listen_addr,
            bootstrap_peers,
            peer_id: format!("lista-{}", listen_addr),
            redial_interval: Duration::from_secs(5),
            max_redials: 12,
        }
    }

    /// Set the id announced in the hello line.
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = peer_id.into();
        self
    }

    /// Set how often and how many times an unreachable bootstrap peer is redialed.
    pub fn with_redial(mut self, interval: Duration, max_redials: u32) -> Self {
        self.redial_interval = interval;
        self.max_redials = max_redials;
        self
    }

    /// The address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn join(&self, topic: Topic) -> Result<Swarm> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("Swarm listening on {} for topic {}", self.listen_addr, topic);

        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);

        let accept_tx = tx.clone();
        let peer_id = self.peer_id.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Incoming swarm connection from {}", addr);
                        let tx = accept_tx.clone();
                        let peer_id = peer_id.clone();
                        tokio::spawn(async move {
                            if let Err(e) = admit(stream, addr, topic, &peer_id, false, tx).await {
                                warn!("Rejected connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Swarm accept error: {}", e);
                    }
                }
            }
        });

        let peers = self.bootstrap_peers.clone();
        let peer_id = self.peer_id.clone();
        let interval = self.redial_interval;
        let max_redials = self.max_redials;
        let dial = tokio::spawn(async move {
            for peer_addr in peers {
                let tx = tx.clone();
                let peer_id = peer_id.clone();
                tokio::spawn(async move {
                    dial_with_retry(&peer_addr, topic, &peer_id, interval, max_redials, tx).await;
                });
            }
        });

        Ok(Swarm::new(topic, rx, vec![accept, dial]))
    }
}

async fn dial_with_retry(
    peer_addr: &str,
    topic: Topic,
    peer_id: &str,
    interval: Duration,
    max_redials: u32,
    tx: mpsc::Sender<PeerConnection>,
) {
    for attempt in 0..=max_redials {
        if tx.is_closed() {
            return;
        }
        info!("Connecting to bootstrap peer: {}", peer_addr);
        match TcpStream::connect(peer_addr).await {
            Ok(stream) => {
                let addr = match stream.peer_addr() {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("Failed to get peer addr: {}", e);
                        return;
                    }
                };
                if let Err(e) = admit(stream, addr, topic, peer_id, true, tx).await {
                    warn!("Bootstrap peer {} rejected: {}", peer_addr, e);
                }
                return;
            }
            Err(e) => {
                warn!(
                    "Failed to connect to bootstrap peer {} (attempt {}): {}",
                    peer_addr,
                    attempt + 1,
                    e
                );
            }
        }
        tokio::time::sleep(interval).await;
    }
}

async fn admit(
    mut stream: TcpStream,
    addr: SocketAddr,
    topic: Topic,
    peer_id: &str,
    initiator: bool,
    tx: mpsc::Sender<PeerConnection>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let hello = HelloMessage::Hello {
        topic: topic.to_hex(),
        peer: peer_id.to_string(),
    };
    let line = serde_json::to_string(&hello)? + "\n";
    stream.write_all(line.as_bytes()).await?;

    let remote = read_hello_line(&mut stream).await?;
    let HelloMessage::Hello {
        topic: remote_topic,
        peer,
    } = serde_json::from_str(&remote)?;

    if remote_topic != topic.to_hex() {
        return Err(SwarmError::Handshake(format!(
            "peer {} is on topic {}",
            addr,
            remote_topic.get(..8).unwrap_or(&remote_topic)
        )));
    }

    info!("Peer {} ({}) joined topic {}", peer, addr, topic);
    let stream: PeerStream = Box::new(stream);
    tx.send(PeerConnection {
        peer,
        initiator,
        stream,
    })
    .await
    .map_err(|_| SwarmError::Handshake("swarm closed".into()))
}

/// Read one newline-terminated line byte by byte so nothing past it is consumed.
async fn read_hello_line(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(128);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        buf.push(byte);
        if buf.len() > MAX_HELLO_LEN {
            return Err(SwarmError::Handshake("hello line too long".into()));
        }
    }
    String::from_utf8(buf).map_err(|e| SwarmError::Handshake(e.to_string()))
}
