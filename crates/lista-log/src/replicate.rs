//! Replication session between two peers.
//!
//! Newline-delimited JSON frames over any [`PeerStream`]. Every writer log
//! in the store is replicated, so writers authorized later are covered
//! without renegotiating the session.
//!
//! ```text
//! -> {"type":"hello","group":..,"lengths":{writer: len, ..}}
//! <- {"type":"want","writer":..,"start":s,"end":e}
//! -> {"type":"nodes","writer":..,"nodes":[..]}
//! -> {"type":"have","writer":..,"length":n}      (on every local growth)
//! ```

use crate::base::Base;
use crate::error::{LogError, Result};
use crate::group::{GroupLog, LogEvent};
use crate::key::{GroupKey, WriterKey};
use crate::node::Node;
use lista_swarm::PeerStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Nodes per `nodes` frame.
const CHUNK: u64 = 64;

/// Replication wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        group: GroupKey,
        lengths: BTreeMap<WriterKey, u64>,
    },
    Have {
        writer: WriterKey,
        length: u64,
    },
    Want {
        writer: WriterKey,
        start: u64,
        end: u64,
    },
    Nodes {
        writer: WriterKey,
        nodes: Vec<Node>,
    },
}

struct Session {
    base: Base,
    /// Lengths the peer has announced
    remote: BTreeMap<WriterKey, u64>,
    /// Highest end already requested per writer
    requested: BTreeMap<WriterKey, u64>,
}

impl Session {
    fn handle(&mut self, frame: Frame) -> Result<Vec<Frame>> {
        match frame {
            Frame::Hello { group, lengths } => {
                let ours = self.base.group_key();
                if group != ours {
                    return Err(LogError::GroupMismatch {
                        expected: ours,
                        found: group,
                    });
                }
                let mut out = Vec::new();
                for (writer, length) in lengths {
                    out.extend(self.note_remote(writer, length)?);
                }
                Ok(out)
            }
            Frame::Have { writer, length } => Ok(self.note_remote(writer, length)?.into_iter().collect()),
            Frame::Want { writer, start, end } => self.serve(writer, start, end),
            Frame::Nodes { writer, nodes } => {
                let offered = nodes.len();
                if self.base.ingest(&writer, nodes)? < offered {
                    // Ask again on the next announcement.
                    self.requested.remove(&writer);
                }
                Ok(Vec::new())
            }
        }
    }

    fn note_remote(&mut self, writer: WriterKey, length: u64) -> Result<Option<Frame>> {
        let known = self.remote.entry(writer).or_insert(0);
        *known = (*known).max(length);

        let ours = self.base.writer_len(&writer)?;
        let asked = self.requested.get(&writer).copied().unwrap_or(0).max(ours);
        if writer == self.base.local_key() || length <= asked {
            return Ok(None);
        }
        self.requested.insert(writer, length);
        Ok(Some(Frame::Want {
            writer,
            start: asked,
            end: length,
        }))
    }

    fn serve(&self, writer: WriterKey, start: u64, end: u64) -> Result<Vec<Frame>> {
        let end = end.min(self.base.writer_len(&writer)?);
        let mut frames = Vec::new();
        let mut from = start;
        while from < end {
            let to = (from + CHUNK).min(end);
            let nodes = (from..to)
                .map(|seq| self.base.get_node(&writer, seq))
                .collect::<Result<Vec<_>>>()?;
            frames.push(Frame::Nodes { writer, nodes });
            from = to;
        }
        Ok(frames)
    }

    fn on_event(&mut self, event: LogEvent) -> Result<Option<Frame>> {
        match event {
            LogEvent::Appended { writer, length } => {
                let remote = self.remote.get(&writer).copied().unwrap_or(0);
                Ok((length > remote).then_some(Frame::Have { writer, length }))
            }
            LogEvent::Wanted { writer, start, end } => {
                let start = start.max(self.base.writer_len(&writer)?);
                Ok((start < end).then_some(Frame::Want { writer, start, end }))
            }
        }
    }

    fn announce_all(&self) -> Result<Vec<Frame>> {
        Ok(self
            .base
            .lengths()?
            .into_iter()
            .map(|(writer, length)| Frame::Have { writer, length })
            .collect())
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let line = serde_json::to_string(frame)? + "\n";
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Run a replication session until the stream closes or the log is closed.
pub async fn run(base: Base, stream: PeerStream) -> Result<()> {
    let mut events = base.subscribe();
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    let hello = Frame::Hello {
        group: base.group_key(),
        lengths: base.lengths()?,
    };
    send(&mut writer, &hello).await?;

    let mut session = Session {
        base,
        remote: BTreeMap::new(),
        requested: BTreeMap::new(),
    };

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Replication peer closed the stream");
                    return Ok(());
                };
                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("Ignoring malformed replication frame: {}", e);
                        continue;
                    }
                };
                for reply in session.handle(frame)? {
                    send(&mut writer, &reply).await?;
                }
                writer.flush().await?;
            }
            event = events.recv() => {
                let replies = match event {
                    Ok(event) => session.on_event(event)?.into_iter().collect(),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Replication session lagged by {} events, re-announcing", n);
                        session.announce_all()?
                    }
                    Err(RecvError::Closed) => return Ok(()),
                };
                for reply in replies {
                    send(&mut writer, &reply).await?;
                }
                writer.flush().await?;
            }
        }
        if session.base.is_closed() {
            return Err(LogError::Closed);
        }
    }
}
