//! Persistent log storage using RocksDB.
//!
//! One database holds every writer log of a group, plus the merge state:
//!
//! | Key | Value |
//! |---|---|
//! | `meta:local` | hex key of the local writer |
//! | `meta:group` | hex group key |
//! | `meta:merged_len` | merged order length (u64 BE) |
//! | `secret:{writer}` | ed25519 secret of a local writer |
//! | `log:{writer}:{seq}` | JSON [`Node`] |
//! | `len:{writer}` | contiguous length of a writer log (u64 BE) |
//! | `member:{writer}` | present if the writer is authorized |
//! | `applied:{writer}` | entries of the writer already merged (u64 BE) |
//! | `order:{index}` | JSON [`MergedRef`] |
//! | `view:{index}` | JSON value appended by the apply hook |

use crate::error::{LogError, Result};
use crate::key::{GroupKey, WriterKey};
use crate::node::{Node, OrderKey};
use ed25519_dalek::SigningKey;
use rocksdb::{Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const LOCAL_KEY: &[u8] = b"meta:local";
const GROUP_KEY: &[u8] = b"meta:group";
const MERGED_LEN_KEY: &[u8] = b"meta:merged_len";

/// Pointer from a merged position to a writer log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRef {
    pub writer: WriterKey,
    pub seq: u64,
    pub weight: u64,
}

impl MergedRef {
    /// Order key of the referenced node.
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            weight: self.weight,
            writer: self.writer,
            seq: self.seq,
        }
    }
}

/// Storage backend for one group.
pub struct LogStore {
    db: DB,
    path: PathBuf,
}

impl LogStore {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_paranoid_checks(true);
        let db = DB::open(&opts, path.as_ref())?;
        Ok(Self {
            db,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Directory of this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // --- Identity ---

    /// Get or create the local writer's signing key.
    pub fn get_or_create_local_key(&self) -> Result<SigningKey> {
        if let Some(data) = self.db.get(LOCAL_KEY)? {
            let hex_key = String::from_utf8(data)
                .map_err(|_| LogError::Corruption("Invalid local writer record".into()))?;
            let writer = WriterKey::from_hex(&hex_key)
                .map_err(|_| LogError::Corruption("Invalid local writer record".into()))?;
            return self
                .get_secret(&writer)?
                .ok_or_else(|| LogError::Corruption(format!("Missing secret for {}", writer)));
        }

        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let writer = WriterKey(signing_key.verifying_key().to_bytes());
        let mut batch = WriteBatch::default();
        batch.put(secret_key(&writer), signing_key.as_bytes());
        batch.put(LOCAL_KEY, writer.to_hex());
        self.db.write(batch)?;
        Ok(signing_key)
    }

    fn get_secret(&self, writer: &WriterKey) -> Result<Option<SigningKey>> {
        match self.db.get(secret_key(writer))? {
            Some(data) => {
                let bytes: [u8; 32] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| LogError::Corruption("Invalid stored secret".into()))?;
                Ok(Some(SigningKey::from_bytes(&bytes)))
            }
            None => Ok(None),
        }
    }

    /// Group this store belongs to, if recorded.
    pub fn group(&self) -> Result<Option<GroupKey>> {
        match self.db.get(GROUP_KEY)? {
            Some(data) => {
                let hex_key = String::from_utf8(data)
                    .map_err(|_| LogError::Corruption("Invalid group record".into()))?;
                let key = GroupKey::from_hex(&hex_key)
                    .map_err(|_| LogError::Corruption("Invalid group record".into()))?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Record the group this store belongs to.
    pub fn set_group(&self, group: &GroupKey) -> Result<()> {
        self.db.put(GROUP_KEY, group.to_hex())?;
        Ok(())
    }

    // --- Writer logs ---

    /// Contiguous length of a writer's log.
    pub fn len(&self, writer: &WriterKey) -> Result<u64> {
        self.get_u64(&len_key(writer))
    }

    /// Lengths of every writer log held locally.
    pub fn lengths(&self) -> Result<BTreeMap<WriterKey, u64>> {
        self.scan_u64(b"len:")
    }

    /// Store the next entry of a writer's log. Returns the new length, or
    /// `None` if the entry is not the next one (duplicate or gap).
    pub fn put_node(&self, node: &Node) -> Result<Option<u64>> {
        let len = self.len(&node.writer)?;
        if node.seq != len {
            return Ok(None);
        }
        let mut batch = WriteBatch::default();
        batch.put(log_key(&node.writer, node.seq), serde_json::to_vec(node)?);
        batch.put(len_key(&node.writer), (len + 1).to_be_bytes());
        self.db.write(batch)?;
        Ok(Some(len + 1))
    }

    /// Read one entry of a writer's log.
    pub fn get_node(&self, writer: &WriterKey, seq: u64) -> Result<Node> {
        let length = self.len(writer)?;
        if seq >= length {
            return Err(LogError::Checkout {
                checkout: seq,
                length,
            });
        }
        match self.db.get(log_key(writer, seq))? {
            Some(data) => Ok(serde_json::from_slice(&data)
                .map_err(|e| LogError::Corruption(format!("entry {} of {}: {}", seq, writer, e)))?),
            None => Err(LogError::Corruption(format!(
                "entry {} of {} missing below length {}",
                seq, writer, length
            ))),
        }
    }

    // --- Membership ---

    /// Authorize a writer. Returns false if it already was a member.
    pub fn add_member(&self, writer: &WriterKey) -> Result<bool> {
        if self.is_member(writer)? {
            return Ok(false);
        }
        self.db.put(member_key(writer), b"1")?;
        Ok(true)
    }

    /// Check whether a writer is authorized.
    pub fn is_member(&self, writer: &WriterKey) -> Result<bool> {
        Ok(self.db.get(member_key(writer))?.is_some())
    }

    /// All authorized writers.
    pub fn members(&self) -> Result<Vec<WriterKey>> {
        let prefix = b"member:";
        let mut members = Vec::new();
        for item in self.db.prefix_iterator(prefix) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            members.push(parse_writer_suffix(&key, prefix.len())?);
        }
        Ok(members)
    }

    // --- Merge state ---

    /// Entries of each writer already merged.
    pub fn applied(&self) -> Result<BTreeMap<WriterKey, u64>> {
        self.scan_u64(b"applied:")
    }

    /// Length of the merged order.
    pub fn merged_len(&self) -> Result<u64> {
        self.get_u64(MERGED_LEN_KEY)
    }

    /// Reference stored at a merged position.
    pub fn merged_ref(&self, index: u64) -> Result<MergedRef> {
        match self.db.get(order_key(index))? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Err(LogError::Corruption(format!(
                "merged entry {} missing",
                index
            ))),
        }
    }

    /// Replace the merged order from `cut` onwards and adjust applied counts.
    pub fn commit_merge(&self, cut: u64, merged: &[MergedRef]) -> Result<()> {
        let old_len = self.merged_len()?;
        let mut applied = self.applied()?;
        let mut batch = WriteBatch::default();

        for index in cut..old_len {
            let r = self.merged_ref(index)?;
            let count = applied.entry(r.writer).or_insert(0);
            *count = count.saturating_sub(1);
        }
        for (offset, r) in merged.iter().enumerate() {
            batch.put(order_key(cut + offset as u64), serde_json::to_vec(r)?);
            *applied.entry(r.writer).or_insert(0) += 1;
        }
        let new_len = cut + merged.len() as u64;
        for index in new_len..old_len {
            batch.delete(order_key(index));
        }
        for (writer, count) in &applied {
            batch.put(applied_key(writer), count.to_be_bytes());
        }
        batch.put(MERGED_LEN_KEY, new_len.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    // --- View ---

    /// Record a value in the durable view at a merged position.
    pub fn put_view(&self, index: u64, value: &Value) -> Result<()> {
        self.db.put(view_key(index), serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Drop durable view entries in `from..to` ahead of a reorder.
    pub fn clear_view(&self, from: u64, to: u64) -> Result<()> {
        let mut batch = WriteBatch::default();
        for index in from..to {
            batch.delete(view_key(index));
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Read the durable view at a merged position.
    pub fn get_view(&self, index: u64) -> Result<Option<Value>> {
        match self.db.get(view_key(index))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    // --- Helpers ---

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        match self.db.get(key)? {
            Some(data) => decode_u64(&data),
            None => Ok(0),
        }
    }

    fn scan_u64(&self, prefix: &[u8]) -> Result<BTreeMap<WriterKey, u64>> {
        let mut out = BTreeMap::new();
        for item in self.db.prefix_iterator(prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.insert(parse_writer_suffix(&key, prefix.len())?, decode_u64(&value)?);
        }
        Ok(out)
    }
}

fn secret_key(writer: &WriterKey) -> String {
    format!("secret:{}", writer.to_hex())
}

fn log_key(writer: &WriterKey, seq: u64) -> String {
    format!("log:{}:{:020}", writer.to_hex(), seq)
}

fn len_key(writer: &WriterKey) -> String {
    format!("len:{}", writer.to_hex())
}

fn member_key(writer: &WriterKey) -> String {
    format!("member:{}", writer.to_hex())
}

fn applied_key(writer: &WriterKey) -> String {
    format!("applied:{}", writer.to_hex())
}

fn order_key(index: u64) -> String {
    format!("order:{:020}", index)
}

fn view_key(index: u64) -> String {
    format!("view:{:020}", index)
}

fn decode_u64(data: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| LogError::Corruption("Invalid counter record".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn parse_writer_suffix(key: &[u8], prefix_len: usize) -> Result<WriterKey> {
    std::str::from_utf8(&key[prefix_len..])
        .ok()
        .and_then(|s| WriterKey::from_hex(s).ok())
        .ok_or_else(|| LogError::Corruption("Invalid writer key record".into()))
}
