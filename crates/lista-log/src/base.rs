//! The multi-writer group log.
//!
//! Each authorized writer appends signed nodes to its own log. `update`
//! merges every node whose causal dependencies are already merged into a
//! single order, sorted by [`OrderKey`](crate::node::OrderKey). When a late
//! node sorts before entries that were already merged, the tail is reordered
//! and the apply hook is told to discard what it derived from it.

use crate::error::{LogError, Result};
use crate::group::{
    ApplyHook, ApplyHost, GroupLog, LogBackend, LogEvent, MergeBatch, MergedNode,
};
use crate::key::{GroupKey, WriterKey};
use crate::node::Node;
use crate::store::{LogStore, MergedRef};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use lista_swarm::PeerStream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Upper bound on nodes delivered to the hook in one batch.
const MAX_BATCH: usize = 1024;

const EVENT_CAPACITY: usize = 1024;

struct Shared {
    group: GroupKey,
    local: WriterKey,
    signing_key: SigningKey,
    store: RwLock<Option<Arc<LogStore>>>,
    writable: AtomicBool,
    closed: AtomicBool,
    append_lock: Mutex<()>,
    update_lock: Mutex<()>,
    events: broadcast::Sender<LogEvent>,
}

/// A group log backed by a [`LogStore`].
#[derive(Clone)]
pub struct Base {
    shared: Arc<Shared>,
}

impl Base {
    /// Open the store in `dir`. See [`LogBackend::open`] for group selection.
    pub fn open(dir: &Path, group: Option<GroupKey>) -> Result<Self> {
        let store = LogStore::open(dir)?;
        let signing_key = store.get_or_create_local_key()?;
        let local = WriterKey(signing_key.verifying_key().to_bytes());

        let group = match (group, store.group()?) {
            (Some(expected), Some(found)) if expected != found => {
                return Err(LogError::GroupMismatch { expected, found });
            }
            (Some(group), _) => group,
            (None, Some(found)) => found,
            (None, None) => GroupKey::from(local),
        };
        store.set_group(&group)?;
        store.add_member(&group.root_writer())?;

        verify_integrity(&store, &local)?;

        let writable = store.is_member(&local)?;
        info!(
            "Opened group {} at {} (local writer {}, writable: {})",
            group,
            dir.display(),
            local,
            writable
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                group,
                local,
                signing_key,
                store: RwLock::new(Some(Arc::new(store))),
                writable: AtomicBool::new(writable),
                closed: AtomicBool::new(false),
                append_lock: Mutex::new(()),
                update_lock: Mutex::new(()),
                events,
            }),
        })
    }

    fn store(&self) -> Result<Arc<LogStore>> {
        let guard = match self.shared.store.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(LogError::Closed)
    }

    /// Lengths of every writer log held locally.
    pub fn lengths(&self) -> Result<BTreeMap<WriterKey, u64>> {
        self.store()?.lengths()
    }

    /// Read one node of a writer's log.
    pub fn get_node(&self, writer: &WriterKey, seq: u64) -> Result<Node> {
        self.store()?.get_node(writer, seq)
    }

    /// Store nodes received from a peer. Returns how many were new.
    ///
    /// A node that is not signed by `writer` is dropped together with the
    /// rest of its batch, since later entries would leave a gap.
    pub fn ingest(&self, writer: &WriterKey, nodes: Vec<Node>) -> Result<usize> {
        if *writer == self.shared.local {
            return Ok(0);
        }
        let store = self.store()?;
        let _guard = lock(&self.shared.append_lock);

        let mut stored = 0;
        let mut length = None;
        for node in nodes {
            if node.writer != *writer {
                warn!(
                    "Dropping batch for {}: node {} from {}",
                    writer, node.seq, node.writer
                );
                break;
            }
            if let Err(e) = node.verify() {
                warn!("Dropping node {} of {}: {}", node.seq, writer, e);
                break;
            }
            if let Some(len) = store.put_node(&node)? {
                stored += 1;
                length = Some(len);
            }
        }
        if let Some(length) = length {
            debug!("Stored {} nodes of {} (length {})", stored, writer, length);
            let _ = self.shared.events.send(LogEvent::Appended {
                writer: *writer,
                length,
            });
        }
        Ok(stored)
    }

    fn append_sync(&self, value: Value) -> Result<u64> {
        let store = self.store()?;
        let _guard = lock(&self.shared.append_lock);
        if !self.is_writable() {
            return Err(LogError::NotWritable);
        }

        let local = self.shared.local;
        let seq = store.len(&local)?;
        let mut clock = store.applied()?;
        clock.remove(&local);
        clock.retain(|_, count| *count > 0);

        let node = Node::signed(&self.shared.signing_key, seq, clock, value)?;
        let length = store
            .put_node(&node)?
            .ok_or_else(|| LogError::Corruption("local log moved during append".into()))?;
        let _ = self
            .shared
            .events
            .send(LogEvent::Appended { writer: local, length });
        Ok(length)
    }

    fn update_sync(&self, hook: &mut dyn ApplyHook) -> Result<usize> {
        let store = self.store()?;
        let _guard = lock(&self.shared.update_lock);
        let mut delivered = 0;

        loop {
            let ready = collect_ready(&store)?;
            let Some(first) = ready.iter().map(Node::order_key).min() else {
                break;
            };

            let merged_len = store.merged_len()?;
            let mut cut = merged_len;
            while cut > 0 && store.merged_ref(cut - 1)?.order_key() > first {
                cut -= 1;
            }

            let mut nodes = Vec::with_capacity(ready.len() + (merged_len - cut) as usize);
            for index in cut..merged_len {
                let r = store.merged_ref(index)?;
                nodes.push(store.get_node(&r.writer, r.seq)?);
            }
            if cut < merged_len {
                debug!(
                    "Reordering {} merged entries from index {}",
                    merged_len - cut,
                    cut
                );
                store.clear_view(cut, merged_len)?;
            }
            nodes.extend(ready);
            nodes.sort_by_key(Node::order_key);

            let refs: Vec<MergedRef> = nodes
                .iter()
                .map(|n| MergedRef {
                    writer: n.writer,
                    seq: n.seq,
                    weight: n.order_key().weight,
                })
                .collect();
            let batch = MergeBatch {
                truncated_from: (cut < merged_len).then_some(cut),
                nodes: nodes
                    .into_iter()
                    .enumerate()
                    .map(|(i, n)| MergedNode {
                        index: cut + i as u64,
                        writer: n.writer,
                        seq: n.seq,
                        value: n.value,
                    })
                    .collect(),
            };

            {
                let mut host = BaseHost {
                    base: self,
                    store: &store,
                };
                hook.apply(&batch, &mut host);
            }
            store.commit_merge(cut, &refs)?;
            delivered += batch.nodes.len();
        }

        Ok(delivered)
    }

    fn read_merged(&self, store: &LogStore, index: u64) -> Result<MergedNode> {
        let length = store.merged_len()?;
        if index >= length {
            return Err(LogError::Checkout {
                checkout: index,
                length,
            });
        }
        let r = store.merged_ref(index)?;
        let node = store.get_node(&r.writer, r.seq)?;
        Ok(MergedNode {
            index,
            writer: node.writer,
            seq: node.seq,
            value: node.value,
        })
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Read the first local entry and the merged tail; both must decode and verify.
fn verify_integrity(store: &LogStore, local: &WriterKey) -> Result<()> {
    if store.len(local)? > 0 {
        store.get_node(local, 0)?.verify()?;
    }
    let merged = store.merged_len()?;
    if merged > 0 {
        let r = store.merged_ref(merged - 1)?;
        store.get_node(&r.writer, r.seq)?;
    }
    Ok(())
}

/// Every member node whose dependencies are merged, following chains within the batch.
fn collect_ready(store: &LogStore) -> Result<Vec<Node>> {
    let members = store.members()?;
    let mut applied = store.applied()?;
    let mut lengths = BTreeMap::new();
    for writer in &members {
        lengths.insert(*writer, store.len(writer)?);
    }

    let mut ready = Vec::new();
    loop {
        let mut progressed = false;
        for writer in &members {
            let next = applied.get(writer).copied().unwrap_or(0);
            if next >= lengths.get(writer).copied().unwrap_or(0) {
                continue;
            }
            let node = store.get_node(writer, next)?;
            let deps_met = node
                .clock
                .iter()
                .all(|(dep, count)| applied.get(dep).copied().unwrap_or(0) >= *count);
            if deps_met {
                applied.insert(*writer, next + 1);
                ready.push(node);
                progressed = true;
            }
        }
        if !progressed || ready.len() >= MAX_BATCH {
            break;
        }
    }
    Ok(ready)
}

struct BaseHost<'a> {
    base: &'a Base,
    store: &'a LogStore,
}

impl ApplyHost for BaseHost<'_> {
    fn add_writer(&mut self, key: WriterKey) -> Result<bool> {
        let added = self.store.add_member(&key)?;
        if added {
            info!("Writer {} added to group {}", key, self.base.shared.group);
            if key == self.base.shared.local {
                self.base.shared.writable.store(true, Ordering::SeqCst);
                info!("Local writer is now writable");
            }
        }
        Ok(added)
    }

    fn is_writer(&self, key: &WriterKey) -> bool {
        self.store.is_member(key).unwrap_or(false)
    }

    fn local_key(&self) -> WriterKey {
        self.base.shared.local
    }

    fn view_append(&mut self, index: u64, value: &Value) -> Result<()> {
        self.store.put_view(index, value)
    }

    fn merged_get(&self, index: u64) -> Result<MergedNode> {
        self.base.read_merged(self.store, index)
    }
}

#[async_trait]
impl GroupLog for Base {
    fn group_key(&self) -> GroupKey {
        self.shared.group
    }

    fn local_key(&self) -> WriterKey {
        self.shared.local
    }

    fn is_writable(&self) -> bool {
        self.shared.writable.load(Ordering::SeqCst)
    }

    fn is_writer(&self, key: &WriterKey) -> bool {
        self.store()
            .and_then(|s| s.is_member(key))
            .unwrap_or(false)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn local_len(&self) -> Result<u64> {
        self.store()?.len(&self.shared.local)
    }

    fn writer_len(&self, writer: &WriterKey) -> Result<u64> {
        self.store()?.len(writer)
    }

    async fn append(&self, value: Value) -> Result<u64> {
        self.append_sync(value)
    }

    async fn flush(&self) -> Result<()> {
        self.store()?.flush()
    }

    async fn update(&self, hook: &mut dyn ApplyHook) -> Result<usize> {
        self.update_sync(hook)
    }

    fn merged_len(&self) -> Result<u64> {
        self.store()?.merged_len()
    }

    fn merged_get(&self, index: u64) -> Result<MergedNode> {
        let store = self.store()?;
        self.read_merged(&store, index)
    }

    fn request_range(&self, writer: WriterKey, start: u64, end: u64) {
        let _ = self
            .shared
            .events
            .send(LogEvent::Wanted { writer, start, end });
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.shared.events.subscribe()
    }

    async fn replicate(&self, stream: PeerStream) -> Result<()> {
        crate::replicate::run(self.clone(), stream).await
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let store = {
            let mut guard = match self.shared.store.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(store) = store {
            if let Err(e) = store.flush() {
                warn!("Flush on close failed: {}", e);
            }
            info!("Closed group {} at {}", self.shared.group, store.path().display());
        }
        Ok(())
    }
}

/// Opens [`Base`] logs stored in RocksDB.
#[derive(Debug, Default, Clone)]
pub struct RocksBackend;

#[async_trait]
impl LogBackend for RocksBackend {
    async fn open(&self, dir: &Path, group: Option<GroupKey>) -> Result<Arc<dyn GroupLog>> {
        std::fs::create_dir_all(dir)?;
        Ok(Arc::new(Base::open(dir, group)?))
    }
}
