//! Writer membership handshake.
//!
//! Runs on its own topic next to replication. On every connection each side
//! sends its writer key as one JSON line:
//!
//! ```text
//! {"type":"writer-key","key":"<64 hex>"}\n
//! ```
//!
//! A side with write access authorizes keys it has not seen before by
//! appending an `add-writer` operation. A side without write access only
//! remembers the key.

use crate::error::Result;
use async_trait::async_trait;
use lista_log::{GroupKey, WriterKey};
use lista_swarm::{PeerConnection, Topic};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const HANDSHAKE_TOPIC_CONTEXT: &str = "lista 2024-06 writer handshake topic v1";

/// Bytes buffered without a newline before the buffer is dropped.
const MAX_LINE: usize = 64 * 1024;

/// Topic for the handshake channel of a group.
pub fn handshake_topic(group: &GroupKey) -> Topic {
    Topic::from_bytes(blake3::derive_key(HANDSHAKE_TOPIC_CONTEXT, group.as_bytes()))
}

/// Per-connection handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connected,
    KeySent,
    KeyReceived,
    Timeout,
}

/// Handshake wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HandshakeMessage {
    WriterKey { key: String },
}

/// Splits a byte stream into lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        if self.buf.len() > MAX_LINE {
            warn!("Discarding {} bytes without a newline", self.buf.len());
            self.buf.clear();
        }
        lines
    }
}

/// Writer keys already handled for the current group.
#[derive(Debug, Default)]
pub struct KnownWriters {
    keys: Mutex<HashSet<WriterKey>>,
}

impl KnownWriters {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> std::sync::MutexGuard<'_, HashSet<WriterKey>> {
        match self.keys.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a key. Returns false if it was already known.
    pub fn insert(&self, key: WriterKey) -> bool {
        self.keys().insert(key)
    }

    /// Check whether a key is known.
    pub fn contains(&self, key: &WriterKey) -> bool {
        self.keys().contains(key)
    }

    /// Number of known keys.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// True if no keys are known.
    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Forget every key (group changed).
    pub fn clear(&self) {
        self.keys().clear();
    }
}

/// Grants write access on behalf of the handshake.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether the local writer can authorize others right now.
    fn can_authorize(&self) -> bool;

    /// Authorize a writer key.
    async fn authorize(&self, key: WriterKey) -> Result<()>;
}

/// Handshake driver for one group.
pub struct Membership {
    local: WriterKey,
    known: Arc<KnownWriters>,
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
}

impl Membership {
    /// Create a driver for the local writer.
    pub fn new(
        local: WriterKey,
        known: Arc<KnownWriters>,
        authorizer: Arc<dyn Authorizer>,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            known,
            authorizer,
            timeout,
        }
    }

    /// The line sent to every peer.
    pub fn key_message(&self) -> Result<String> {
        let msg = HandshakeMessage::WriterKey {
            key: self.local.to_hex(),
        };
        Ok(serde_json::to_string(&msg)? + "\n")
    }

    /// Handle one received line. Returns true if an `add-writer` was authored.
    pub async fn handle_line(&self, line: &str) -> Result<bool> {
        match parse_key_line(line) {
            Some(key) => self.handle_key(key).await,
            None => Ok(false),
        }
    }

    /// Handle a remote writer key. Returns true if an `add-writer` was authored.
    pub async fn handle_key(&self, key: WriterKey) -> Result<bool> {
        if key == self.local {
            return Ok(false);
        }
        if !self.known.insert(key) {
            debug!("Writer {} already handled", key);
            return Ok(false);
        }
        if !self.authorizer.can_authorize() {
            info!(
                "Received writer key {} but not writable; leaving authorization to a writer",
                key
            );
            return Ok(false);
        }
        info!("Authorizing writer {}", key);
        self.authorizer.authorize(key).await?;
        Ok(true)
    }

    /// Run the handshake on a connection until it closes or times out.
    pub async fn run(&self, conn: PeerConnection) -> HandshakeState {
        let peer = conn.peer;
        let (mut reader, mut writer) = tokio::io::split(conn.stream);
        let mut state = HandshakeState::Connected;

        let sent = match self.key_message() {
            Ok(line) => writer.write_all(line.as_bytes()).await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            warn!("Failed to send writer key to {}", peer);
            return state;
        }
        state = HandshakeState::KeySent;
        debug!("Sent writer key to {}", peer);

        let mut lines = LineBuffer::new();
        let mut chunk = [0u8; 4096];
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    for line in lines.push(&chunk[..n]) {
                        let Some(key) = parse_key_line(&line) else {
                            continue;
                        };
                        state = HandshakeState::KeyReceived;
                        if let Err(e) = self.handle_key(key).await {
                            warn!("Failed to authorize writer {} from {}: {}", key, peer, e);
                        }
                    }
                }
                _ = &mut deadline, if state != HandshakeState::KeyReceived => {
                    warn!("Handshake with {} timed out", peer);
                    return HandshakeState::Timeout;
                }
            }
        }

        debug!("Handshake connection with {} closed", peer);
        state
    }
}

/// Extract the writer key from a handshake line. Lines that do not start
/// with `{` are protocol noise.
fn parse_key_line(line: &str) -> Option<WriterKey> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<HandshakeMessage>(line) {
        Ok(HandshakeMessage::WriterKey { key }) => match WriterKey::from_hex(&key) {
            Ok(k) => Some(k),
            Err(_) => {
                warn!("Ignoring malformed writer key in handshake");
                None
            }
        },
        Err(e) => {
            debug!("Ignoring handshake line: {}", e);
            None
        }
    }
}
