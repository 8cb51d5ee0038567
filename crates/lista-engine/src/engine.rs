//! The engine: owns one open group at a time and everything around it.
//!
//! An [`Engine`] holds the storage lock, the current session (log,
//! write serializer and swarms of the active group) and the merge engine.
//! Lifecycle operations (start, soft reinit, full reset, join) run under
//! the [`Lifecycle`] guard, so at most one of them is in flight. Merge
//! passes requested by the network are funneled through a signal loop that
//! holds only a weak reference to the engine.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lifecycle::{Lifecycle, Phase};
use crate::lock::StorageLock;
use crate::membership::{Authorizer, KnownWriters, Membership};
use crate::merge::MergeEngine;
use crate::notify::{Notification, Notifier};
use crate::ops::{ListItem, Operation};
use crate::recovery::{
    retry_with_backoff, Escalation, FaultClass, Reinitialize, TransientWindow,
};
use crate::replay;
use crate::replication::{Escalate, Kick, Network, NetworkContext, PeerCounter};
use crate::storage::{delete_with_retry, StorageLayout};
use crate::writer::WriteSerializer;
use async_trait::async_trait;
use lista_log::{GroupKey, GroupLog, LogBackend, LogError, RocksBackend, WriterKey};
use lista_swarm::Transport;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

const NOT_AUTHORIZED_MESSAGE: &str = "Waiting to be added as a writer by the host...";

/// Work requested of the signal loop.
#[derive(Debug, Clone, Copy)]
enum Signal {
    /// Run a merge pass
    Update,
    /// Escalate repeated failures seen in session `epoch`
    Recover { escalation: Escalation, epoch: u64 },
}

/// The open group.
struct Session {
    epoch: u64,
    log: Arc<dyn GroupLog>,
    writer: Arc<WriteSerializer>,
    network: Network,
}

struct Inner {
    config: EngineConfig,
    layout: StorageLayout,
    backend: Arc<dyn LogBackend>,
    replication: Arc<dyn Transport>,
    handshake: Arc<dyn Transport>,
    notifier: Notifier,
    lifecycle: Lifecycle,
    session: RwLock<Option<Session>>,
    merge: tokio::sync::Mutex<MergeEngine>,
    known: Arc<KnownWriters>,
    transient: Mutex<TransientWindow>,
    peers: Arc<PeerCounter>,
    signals: mpsc::UnboundedSender<Signal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    lock: Mutex<Option<StorageLock>>,
    epoch: AtomicU64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine. Nothing touches disk or network until [`start`].
    ///
    /// [`start`]: Engine::start
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn LogBackend>,
        replication: Arc<dyn Transport>,
        handshake: Arc<dyn Transport>,
    ) -> Self {
        let notifier = Notifier::new();
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let transient = TransientWindow::new(
            config.transient_window,
            config.soft_reinit_threshold,
            config.full_reset_threshold,
        );
        Self {
            inner: Arc::new(Inner {
                layout: StorageLayout::new(config.base_dir.clone()),
                config,
                backend,
                replication,
                handshake,
                peers: Arc::new(PeerCounter::new(notifier.clone())),
                merge: tokio::sync::Mutex::new(MergeEngine::new(notifier.clone())),
                notifier,
                lifecycle: Lifecycle::new(),
                session: RwLock::new(None),
                known: Arc::new(KnownWriters::new()),
                transient: Mutex::new(transient),
                signals,
                signal_rx: Mutex::new(Some(signal_rx)),
                lock: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Engine backed by RocksDB stores under the configured base directory.
    pub fn with_rocksdb(
        config: EngineConfig,
        replication: Arc<dyn Transport>,
        handshake: Arc<dyn Transport>,
    ) -> Self {
        Self::new(config, Arc::new(RocksBackend), replication, handshake)
    }

    /// Take the storage lock, finish any pending reset and open the
    /// persisted group, or create a new one.
    pub async fn start(&self) -> Result<()> {
        self.inner.lifecycle.transition(Phase::Initializing)?;
        let result = self.start_inner().await;
        match &result {
            Ok(()) => {
                self.inner.lifecycle.transition(Phase::Ready)?;
                info!("Engine ready");
            }
            Err(e) => {
                error!("Engine failed to start: {}", e);
                guard(&self.inner.lock).take();
                self.inner.lifecycle.transition(Phase::Idle)?;
            }
        }
        result
    }

    async fn start_inner(&self) -> Result<()> {
        let config = &self.inner.config;
        let layout = &self.inner.layout;
        layout.ensure_base()?;

        let lock = StorageLock::acquire(&layout.lock_file(), config.lock_jitter).await?;
        *guard(&self.inner.lock) = Some(lock);
        self.spawn_signal_loop();

        if layout
            .complete_pending_reset(config.delete_attempts, config.delete_backoff)
            .await?
        {
            self.inner.notifier.notify(Notification::ResetOccurred);
        }
        layout
            .check_version(config.delete_attempts, config.delete_backoff)
            .await?;

        let group = layout.read_group_key()?;
        match self.init(group).await {
            Ok(()) => Ok(()),
            Err(e) if FaultClass::of_engine(&e) == FaultClass::Corruption => {
                warn!("Stored group is corrupted: {}", e);
                self.do_full_reset(&e.to_string()).await
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_signal_loop(&self) {
        let Some(rx) = guard(&self.inner.signal_rx).take() else {
            return;
        };
        tokio::spawn(signal_loop(Arc::downgrade(&self.inner), rx));
    }

    fn signal(&self, signal: Signal) {
        if self.inner.signals.send(signal).is_err() {
            debug!("Signal loop gone, dropping {:?}", signal);
        }
    }

    fn kicker(&self) -> Kick {
        let tx = self.inner.signals.clone();
        Arc::new(move || {
            let _ = tx.send(Signal::Update);
        })
    }

    fn escalator(&self, epoch: u64) -> Escalate {
        let tx = self.inner.signals.clone();
        Arc::new(move || {
            let _ = tx.send(Signal::Recover {
                escalation: Escalation::FullReset,
                epoch,
            });
        })
    }

    /// Open `group` (or create a new group when `None`), replay it and join
    /// its swarms.
    async fn init(&self, group: Option<GroupKey>) -> Result<()> {
        let layout = &self.inner.layout;
        let config = &self.inner.config;

        let (dir, group) = match group {
            Some(group) => (layout.group_store(&group), group),
            None => {
                let staging = layout.staging_store();
                delete_with_retry(&staging, config.delete_attempts, config.delete_backoff)
                    .await?;
                let log = self.inner.backend.open(&staging, None).await?;
                let group = log.group_key();
                log.close().await?;
                drop(log);

                let dir = layout.group_store(&group);
                delete_with_retry(&dir, config.delete_attempts, config.delete_backoff).await?;
                std::fs::rename(&staging, &dir)?;
                info!("Created new group {}", group);
                (dir, group)
            }
        };

        let log = self.open_session(dir, group).await?;
        let group = log.group_key();

        self.verify_identity(log.as_ref());
        layout.write_writer_key(&log.local_key())?;
        if log.is_writable() {
            layout.write_group_key(&group)?;
            self.authorize_static_writers(&log).await;
        }
        self.inner.notifier.notify(Notification::GroupKey {
            key: group.to_hex(),
        });
        info!(
            "Opened group {} as {} ({})",
            group,
            log.local_key(),
            if log.is_writable() { "writer" } else { "guest" }
        );

        // Merge seeded or pending entries now; retries happen on the signal loop.
        if let Err(e) = self.update_once().await {
            warn!("Initial merge failed: {}", e);
            self.signal(Signal::Update);
        } else {
            self.after_merge().await;
        }
        Ok(())
    }

    /// Compare the opened log with the persisted identity files.
    fn verify_identity(&self, log: &dyn GroupLog) {
        let layout = &self.inner.layout;
        let local = log.local_key();
        match layout.read_writer_key() {
            Ok(Some(stored)) if stored == local => debug!("Identity check: writer key matches"),
            Ok(Some(stored)) => warn!(
                "Identity check: writer key changed from {} to {}",
                stored, local
            ),
            Ok(None) => info!("Identity check: no writer key on disk yet"),
            Err(e) => warn!("Identity check: writer key file unreadable: {}", e),
        }

        let group = log.group_key();
        match layout.read_group_key() {
            Ok(Some(stored)) if stored == group => debug!("Identity check: group key matches"),
            Ok(Some(stored)) => warn!(
                "Identity check: stored group {} differs from open group {}",
                stored, group
            ),
            Ok(None) if log.is_writable() => info!("Identity check: group key not persisted yet"),
            Ok(None) => debug!("Identity check: guest, group key not persisted"),
            Err(e) => warn!("Identity check: group key file unreadable: {}", e),
        }
    }

    /// Open the log in `dir` and install a session for it.
    async fn open_session(&self, dir: PathBuf, group: GroupKey) -> Result<Arc<dyn GroupLog>> {
        let log = self.inner.backend.open(&dir, Some(group)).await?;
        match self.install(log.clone()).await {
            Ok(()) => Ok(log),
            Err(e) => {
                if let Err(ce) = log.close().await {
                    warn!("Failed to close log after open error: {}", ce);
                }
                Err(e)
            }
        }
    }

    async fn install(&self, log: Arc<dyn GroupLog>) -> Result<()> {
        let config = &self.inner.config;
        let writer = Arc::new(WriteSerializer::spawn(log.clone(), config.confirm_writes));

        let replayed = replay::materialize(
            log.as_ref(),
            &writer,
            &self.inner.notifier,
            config.seed_defaults,
        )
        .await?;
        if replayed.corrupted {
            return Err(LogError::Corruption("merged order unreadable during replay".into()).into());
        }
        self.inner.merge.lock().await.set_list(replayed.list);

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let kick = self.kicker();
        let authorizer = Arc::new(SessionAuthorizer {
            log: log.clone(),
            writer: writer.clone(),
            kick: kick.clone(),
        });
        let membership = Arc::new(Membership::new(
            log.local_key(),
            self.inner.known.clone(),
            authorizer,
            config.handshake_timeout,
        ));
        let network = Network::start(
            NetworkContext {
                log: log.clone(),
                membership,
                peers: self.inner.peers.clone(),
                kick,
                escalate: self.escalator(epoch),
                guest_sync_delay: config.guest_sync_delay,
            },
            self.inner.replication.as_ref(),
            self.inner.handshake.as_ref(),
        )
        .await?;

        let previous = self.inner.session.write().await.replace(Session {
            epoch,
            log,
            writer,
            network,
        });
        if let Some(previous) = previous {
            warn!("Replacing a session that was not torn down");
            self.teardown(previous).await;
        }
        Ok(())
    }

    async fn authorize_static_writers(&self, log: &Arc<dyn GroupLog>) {
        let Some(writer) = self.current_writer().await else {
            return;
        };
        for key in &self.inner.config.static_writers {
            if *key == log.local_key() || log.is_writer(key) {
                continue;
            }
            self.inner.known.insert(*key);
            info!("Authorizing configured peer writer {}", key);
            if let Err(e) = writer.submit(Operation::AddWriter(*key)).await {
                warn!("Failed to authorize configured writer {}: {}", key, e);
            }
        }
    }

    /// Destroy swarms, stop the writer and close the log. Writes not yet
    /// started are superseded right away.
    async fn teardown(&self, session: Session) {
        let Session {
            epoch,
            log,
            writer,
            network,
        } = session;
        writer.close();
        network.destroy();
        tokio::time::sleep(self.inner.config.teardown_grace).await;
        writer.shutdown();
        if let Err(e) = log.close().await {
            warn!("Failed to close log: {}", e);
        }
        debug!("Session {} torn down", epoch);
    }

    async fn current_log(&self) -> Option<Arc<dyn GroupLog>> {
        self.inner.session.read().await.as_ref().map(|s| s.log.clone())
    }

    async fn current_writer(&self) -> Option<Arc<WriteSerializer>> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.writer.clone())
    }

    async fn current_epoch(&self) -> u64 {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.epoch)
            .unwrap_or(0)
    }

    async fn update_once(&self) -> std::result::Result<usize, LogError> {
        let log = self.current_log().await.ok_or(LogError::Closed)?;
        let mut merge = self.inner.merge.lock().await;
        log.update(&mut *merge).await
    }

    /// Merge everything ready, retrying transient failures and escalating
    /// repeated ones.
    async fn run_update(&self) -> Result<usize> {
        let epoch = self.current_epoch().await;
        let policy = self.inner.config.retry.clone();
        let result = retry_with_backoff("update", &policy, self, || self.update_once()).await;

        let err = match result {
            Ok(merged) => {
                self.after_merge().await;
                return Ok(merged);
            }
            Err(e) => e,
        };

        match FaultClass::of(&err) {
            FaultClass::Transient => {
                let escalation = guard(&self.inner.transient).record(Instant::now());
                warn!("Update gave up after retries: {} ({:?})", err, escalation);
                self.inner.notifier.notify(Notification::error(
                    "Sync Delayed",
                    "Some changes have not finished syncing yet and will be retried.",
                ));
                if escalation != Escalation::None {
                    self.signal(Signal::Recover { escalation, epoch });
                }
            }
            FaultClass::Corruption => {
                error!("Corruption detected during update: {}", err);
                self.signal(Signal::Recover {
                    escalation: Escalation::FullReset,
                    epoch,
                });
            }
            FaultClass::Locked | FaultClass::Other => {
                debug!("Update failed: {}", err);
            }
        }
        Err(err.into())
    }

    async fn after_merge(&self) {
        if !self.inner.merge.lock().await.take_gained_write() {
            return;
        }
        let Some(log) = self.current_log().await else {
            return;
        };
        info!("Local writer was authorized for group {}", log.group_key());
        if let Err(e) = self.inner.layout.write_group_key(&log.group_key()) {
            warn!("Failed to persist group key: {}", e);
        }
    }

    async fn write(&self, op: Operation) -> Result<()> {
        let (writer, epoch) = {
            let session = self.inner.session.read().await;
            let session = session.as_ref().ok_or(EngineError::NotReady)?;
            (session.writer.clone(), session.epoch)
        };
        let kind = op.kind();
        match writer.submit(op).await {
            Ok(length) => {
                debug!("{} persisted at local length {}", kind, length);
                if let Err(e) = self.run_update().await {
                    warn!("Merge after {} failed: {}", kind, e);
                }
                Ok(())
            }
            Err(EngineError::NotAuthorized) => {
                info!("{} rejected: not a writer yet", kind);
                self.inner.notifier.notify(Notification::NotAuthorizedYet {
                    message: NOT_AUTHORIZED_MESSAGE.to_string(),
                });
                Err(EngineError::NotAuthorized)
            }
            Err(EngineError::Superseded) => {
                info!("{} superseded by a group switch or reset", kind);
                Err(EngineError::Superseded)
            }
            Err(e) => {
                warn!("{} failed: {}", kind, e);
                self.inner
                    .notifier
                    .notify(Notification::error("Operation Failed", e.to_string()));
                if FaultClass::of_engine(&e) == FaultClass::Corruption {
                    error!("Corruption detected during {}: {}", kind, e);
                    self.signal(Signal::Recover {
                        escalation: Escalation::FullReset,
                        epoch,
                    });
                }
                Err(e)
            }
        }
    }

    /// Add an item.
    pub async fn add_item(&self, text: &str, list_id: Option<String>) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("item text is empty".into()));
        }
        self.write(Operation::Add(ListItem::new(text, list_id))).await
    }

    /// Replace the item with the same text.
    pub async fn update_item(&self, item: ListItem) -> Result<()> {
        self.write(Operation::Update(item)).await
    }

    /// Delete the item with the same text.
    pub async fn delete_item(&self, item: ListItem) -> Result<()> {
        self.write(Operation::Delete(item)).await
    }

    /// Hex writer key of this device in the current group.
    pub async fn local_identity_key(&self) -> Option<String> {
        self.current_log().await.map(|log| log.local_key().to_hex())
    }

    /// Key of the current group.
    pub async fn group_key(&self) -> Option<GroupKey> {
        self.current_log().await.map(|log| log.group_key())
    }

    /// Whether the local writer may append.
    pub async fn is_writable(&self) -> bool {
        self.current_log()
            .await
            .map(|log| log.is_writable())
            .unwrap_or(false)
    }

    /// Current items.
    pub async fn items(&self) -> Vec<ListItem> {
        self.inner.merge.lock().await.snapshot()
    }

    /// Connected replication peers.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.count()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.lifecycle.current()
    }

    /// Receive UI notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    /// Pull the root writer again and merge.
    pub async fn request_resync(&self) -> Result<()> {
        let log = self.current_log().await.ok_or(EngineError::NotReady)?;
        if !log.is_writable() {
            let root = log.group_key().root_writer();
            let have = log.writer_len(&root)?;
            log.request_range(root, have, u64::MAX);
        }
        self.run_update().await?;
        let items = self.items().await;
        self.inner
            .notifier
            .notify(Notification::ListSnapshot { items });
        Ok(())
    }

    /// Leave the current group and join the group with the given hex key.
    pub async fn join_group(&self, key: &str) -> Result<()> {
        let key = key.trim();
        if key.len() != 64 {
            return Err(EngineError::InvalidKey(format!(
                "expected 64 hex characters, got {}",
                key.len()
            )));
        }
        let group =
            GroupKey::from_hex(key).map_err(|e| EngineError::InvalidKey(e.to_string()))?;

        if self.group_key().await == Some(group) {
            info!("Already in group {}", group);
            return Ok(());
        }

        if let Err(e) = self.inner.lifecycle.transition(Phase::Joining) {
            warn!("Join rejected: {}", e);
            return Err(EngineError::Busy(self.phase()));
        }
        let result = self.switch_group(group).await;
        self.settle().await?;
        result
    }

    async fn switch_group(&self, group: GroupKey) -> Result<()> {
        info!("Joining group {}", group);
        let previous = self.inner.session.write().await.take();
        let previous_group = previous.as_ref().map(|s| s.log.group_key());
        let previous_items = self.items().await;
        if let Some(previous) = previous {
            self.teardown(previous).await;
        }
        self.clear_state().await;
        self.inner.notifier.notify(Notification::ResetOccurred);

        self.enter_initializing()?;
        match self.init(Some(group)).await {
            Ok(()) => {
                info!("Joined group {}", group);
                Ok(())
            }
            Err(e) => {
                error!("Joining group {} failed: {}", group, e);
                if let Some(old) = self.inner.session.write().await.take() {
                    self.teardown(old).await;
                }
                self.clear_state().await;
                self.inner
                    .notifier
                    .notify(Notification::error("Join Failed", e.to_string()));
                if let Some(previous_group) = previous_group {
                    if let Err(re) = self.init(Some(previous_group)).await {
                        error!("Restoring group {} failed: {}", previous_group, re);
                        self.inner.notifier.notify(Notification::ListSnapshot {
                            items: previous_items,
                        });
                    }
                }
                Err(e)
            }
        }
    }

    async fn clear_state(&self) {
        self.inner.known.clear();
        self.inner.merge.lock().await.clear();
        self.inner.peers.reset();
        guard(&self.inner.transient).clear();
    }

    async fn soft_reinit_inner(&self, reason: &str) -> Result<()> {
        info!("Soft reinit: {}", reason);
        let session = self
            .inner
            .session
            .write()
            .await
            .take()
            .ok_or(EngineError::NotReady)?;
        let group = session.log.group_key();
        self.teardown(session).await;
        self.inner.peers.reset();

        let dir = self.inner.layout.group_store(&group);
        self.enter_initializing()?;
        self.open_session(dir, group).await?;
        if let Err(e) = self.update_once().await {
            warn!("Merge after soft reinit failed: {}", e);
        } else {
            self.after_merge().await;
        }
        self.inner.notifier.notify(Notification::Reinitialized {
            reason: reason.to_string(),
        });
        info!("Soft reinit complete");
        Ok(())
    }

    /// Wipe every group store and start over as a brand-new group.
    async fn do_full_reset(&self, reason: &str) -> Result<()> {
        error!("Full reset: {}", reason);
        self.inner.notifier.notify(Notification::error(
            "Data Reset Required",
            "Local data is damaged and will be reset. Rejoin the shared list afterwards.",
        ));

        let result = self.wipe_and_reinit(reason).await;
        match &result {
            Ok(()) => {
                self.inner.notifier.notify(Notification::ResetOccurred);
                self.inner.notifier.notify(Notification::error(
                    "Reset Complete",
                    "Local data was reset. A new list has been created.",
                ));
                info!("Full reset complete");
            }
            Err(e) => {
                error!("Full reset failed: {}", e);
                self.inner
                    .notifier
                    .notify(Notification::error("Reset Failed", e.to_string()));
            }
        }
        result
    }

    async fn wipe_and_reinit(&self, reason: &str) -> Result<()> {
        let config = &self.inner.config;
        let layout = &self.inner.layout;

        if let Some(session) = self.inner.session.write().await.take() {
            self.teardown(session).await;
        }

        if let Err(e) =
            delete_with_retry(&layout.store_root(), config.delete_attempts, config.delete_backoff)
                .await
        {
            error!("Could not delete storage: {}", e);
            layout.mark_reset_pending(reason)?;
            self.inner.notifier.notify(Notification::error(
                "Reset Incomplete",
                "Some local data could not be deleted and will be removed on next start.",
            ));
        }

        self.clear_state().await;
        layout.clear_group_key()?;
        self.enter_initializing()?;
        self.init(None).await
    }

    /// Stop networking, close the log and release the storage lock.
    pub async fn shutdown(&self) -> Result<()> {
        let phase = self.inner.lifecycle.settled().await;
        if let Some(session) = self.inner.session.write().await.take() {
            self.teardown(session).await;
        }
        guard(&self.inner.lock).take();
        if phase == Phase::Ready {
            self.inner.lifecycle.transition(Phase::Idle)?;
        }
        info!("Engine shut down");
        Ok(())
    }

    /// Enter a single-flight recovery phase, or wait for the lifecycle
    /// operation in flight. Returns false if the caller should not proceed.
    async fn begin_recovery(&self) -> Result<bool> {
        match self.inner.lifecycle.transition(Phase::Resetting) {
            Ok(()) => Ok(true),
            Err(EngineError::InvalidTransition { from, .. }) if from.is_transient() => {
                debug!("{:?} in flight, waiting instead of recovering", from);
                self.inner.lifecycle.settled().await;
                Ok(false)
            }
            Err(EngineError::InvalidTransition { from, .. }) => Err(EngineError::Busy(from)),
            Err(e) => Err(e),
        }
    }

    /// Move to `Initializing` before reopening a group. A reset during
    /// startup is already there.
    fn enter_initializing(&self) -> Result<()> {
        if self.phase() == Phase::Initializing {
            return Ok(());
        }
        self.inner.lifecycle.transition(Phase::Initializing)
    }

    /// Leave a reset or join: `Ready` with an open group, `Idle` without.
    async fn settle(&self) -> Result<()> {
        if self.current_log().await.is_some() {
            self.enter_initializing()?;
            self.inner.lifecycle.transition(Phase::Ready)
        } else {
            self.inner.lifecycle.transition(Phase::Idle)
        }
    }
}

#[async_trait]
impl Reinitialize for Engine {
    async fn soft_reinit(&self, reason: &str) -> Result<()> {
        if !self.begin_recovery().await? {
            return Ok(());
        }
        let result = self.soft_reinit_inner(reason).await;
        if let Err(e) = &result {
            error!("Soft reinit failed: {}", e);
        }
        self.settle().await?;
        result
    }

    async fn full_reset(&self, reason: &str) -> Result<()> {
        if !self.begin_recovery().await? {
            return Ok(());
        }
        let result = self.do_full_reset(reason).await;
        self.settle().await?;
        result
    }
}

/// Grants write access inside one session.
struct SessionAuthorizer {
    log: Arc<dyn GroupLog>,
    writer: Arc<WriteSerializer>,
    kick: Kick,
}

#[async_trait]
impl Authorizer for SessionAuthorizer {
    fn can_authorize(&self) -> bool {
        self.log.is_writable()
    }

    async fn authorize(&self, key: WriterKey) -> Result<()> {
        if self.log.is_writer(&key) {
            debug!("Writer {} is already a member", key);
            return Ok(());
        }
        self.writer.submit(Operation::AddWriter(key)).await?;
        (self.kick)();
        Ok(())
    }
}

async fn signal_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = Engine { inner };
        match signal {
            Signal::Update => {
                // Coalesce queued kicks into one pass.
                let mut pending = Vec::new();
                while let Ok(next) = rx.try_recv() {
                    if !matches!(next, Signal::Update) {
                        pending.push(next);
                    }
                }
                if engine.current_log().await.is_some() {
                    if let Err(e) = engine.run_update().await {
                        debug!("Background merge failed: {}", e);
                    }
                }
                for signal in pending {
                    engine.signal(signal);
                }
            }
            Signal::Recover { escalation, epoch } => {
                if epoch != engine.current_epoch().await {
                    debug!("Ignoring {:?} for stale session {}", escalation, epoch);
                    continue;
                }
                let result = match escalation {
                    Escalation::SoftReinit => {
                        engine.soft_reinit("repeated transient errors").await
                    }
                    Escalation::FullReset => engine.full_reset("unrecoverable log errors").await,
                    Escalation::None => Ok(()),
                };
                if let Err(e) = result {
                    warn!("Recovery {:?} failed: {}", escalation, e);
                }
            }
        }
    }
    debug!("Signal loop stopped");
}
