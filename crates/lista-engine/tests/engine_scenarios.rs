//! End-to-end scenarios over the in-memory swarm and RocksDB logs.

use async_trait::async_trait;
use lista_engine::replay::DEFAULT_LIST;
use lista_engine::{Engine, EngineConfig, EngineError, ListItem, Notification, Phase};
use lista_log::{
    ApplyHook, GroupKey, GroupLog, LogBackend, LogError, LogEvent, MergedNode, RocksBackend,
    WriterKey,
};
use lista_swarm::{MemoryNetwork, PeerStream};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::sync::broadcast;

fn engine(net: &MemoryNetwork, dir: &Path, name: &str) -> Engine {
    let transport = Arc::new(net.transport(name));
    Engine::with_rocksdb(EngineConfig::fast(dir), transport.clone(), transport)
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    while !check().await {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn texts(engine: &Engine) -> Vec<String> {
    engine.items().await.into_iter().map(|i| i.text).collect()
}

async fn wait_for_text(engine: &Engine, text: &str) {
    wait_until(text, move || async move {
        texts(engine).await.iter().any(|t| t == text)
    })
    .await;
}

fn drain(rx: &mut broadcast::Receiver<Notification>, seen: &mut Vec<Notification>) {
    while let Ok(n) = rx.try_recv() {
        seen.push(n);
    }
}

fn error_titles(seen: &[Notification]) -> Vec<String> {
    seen.iter()
        .filter_map(|n| match n {
            Notification::ErrorNotification { title, .. } => Some(title.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn first_run_seeds_defaults_then_adds() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let host = engine(&net, dir.path(), "host");
    let mut rx = host.subscribe();

    host.start().await.unwrap();
    assert_eq!(host.phase(), Phase::Ready);
    assert_eq!(texts(&host).await, DEFAULT_LIST.to_vec());

    host.add_item("Milk", None).await.unwrap();
    let items = texts(&host).await;
    assert_eq!(items.len(), 4);
    assert_eq!(items[0], "Milk");

    let mut seen = Vec::new();
    drain(&mut rx, &mut seen);
    assert!(seen.iter().any(
        |n| matches!(n, Notification::ItemAdded { item } if item.text == "Milk")
    ));
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::GroupKey { .. })));

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn update_marks_item_done() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let host = engine(&net, dir.path(), "host");
    host.start().await.unwrap();
    host.add_item("Milk", None).await.unwrap();

    let mut milk = ListItem::new("Milk", None);
    milk.is_done = true;
    milk.time_of_completion = 1_700_000_000_000;
    host.update_item(milk).await.unwrap();

    let items = host.items().await;
    let milk = items.iter().find(|i| i.text == "Milk").unwrap();
    assert!(milk.is_done);
    assert_eq!(items.len(), 4);

    host.delete_item(ListItem::new("Milk", None)).await.unwrap();
    assert!(!texts(&host).await.contains(&"Milk".to_string()));
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn guest_is_authorized_and_converges() {
    let host_dir = tempdir().unwrap();
    let guest_dir = tempdir().unwrap();
    let net = MemoryNetwork::new();

    let host = engine(&net, host_dir.path(), "host");
    host.start().await.unwrap();
    host.add_item("Milk", None).await.unwrap();
    let group = host.group_key().await.unwrap();

    let guest = engine(&net, guest_dir.path(), "guest");
    guest.start().await.unwrap();
    let mut rx = guest.subscribe();
    guest.join_group(&group.to_hex()).await.unwrap();
    assert_eq!(guest.group_key().await, Some(group));

    // Until the host's add-writer arrives the guest may only read.
    if !guest.is_writable().await {
        match guest.add_item("Too early", None).await {
            Err(EngineError::NotAuthorized) => {
                let mut seen = Vec::new();
                drain(&mut rx, &mut seen);
                assert!(seen
                    .iter()
                    .any(|n| matches!(n, Notification::NotAuthorizedYet { .. })));
            }
            Ok(()) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let (h, g) = (&host, &guest);
    wait_until("guest write access", move || g.is_writable()).await;
    wait_for_text(g, "Milk").await;

    guest.add_item("Eggs", None).await.unwrap();
    wait_for_text(h, "Eggs").await;
    wait_until("lists to converge", move || async move {
        texts(h).await == texts(g).await
    })
    .await;

    // The guest persisted the group once it could write.
    let stored = std::fs::read_to_string(guest_dir.path().join("lista-group-key.txt")).unwrap();
    assert_eq!(stored.trim(), group.to_hex());

    guest.shutdown().await.unwrap();
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn join_rejects_malformed_keys() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let host = engine(&net, dir.path(), "host");
    host.start().await.unwrap();

    assert!(matches!(
        host.join_group("abc").await,
        Err(EngineError::InvalidKey(_))
    ));
    assert!(matches!(
        host.join_group(&"zz".repeat(32)).await,
        Err(EngineError::InvalidKey(_))
    ));

    let own = host.group_key().await.unwrap();
    host.join_group(&own.to_hex()).await.unwrap();
    assert_eq!(host.group_key().await, Some(own));
    assert_eq!(host.phase(), Phase::Ready);
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_instance_is_locked_out() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let first = engine(&net, dir.path(), "first");
    first.start().await.unwrap();

    let second = engine(&net, dir.path(), "second");
    assert!(matches!(second.start().await, Err(EngineError::Locked(_))));
    assert_eq!(second.phase(), Phase::Idle);

    first.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_replays_the_same_list() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();

    let live = {
        let host = engine(&net, dir.path(), "host");
        host.start().await.unwrap();
        host.add_item("Milk", None).await.unwrap();
        host.add_item("Eggs", Some("groceries".into())).await.unwrap();
        host.delete_item(ListItem::new(DEFAULT_LIST[0], None))
            .await
            .unwrap();
        let items = host.items().await;
        host.shutdown().await.unwrap();
        items
    };

    let host = engine(&net, dir.path(), "host");
    host.start().await.unwrap();
    assert_eq!(host.items().await, live);
    host.shutdown().await.unwrap();
}

/// Backend whose logs fail updates and appends on demand.
#[derive(Default)]
struct Faults {
    transient: AtomicUsize,
    corrupt: AtomicBool,
    corrupt_append: AtomicBool,
    lose_append: AtomicBool,
    slow_append: AtomicBool,
}

struct FaultyBackend {
    faults: Arc<Faults>,
}

#[async_trait]
impl LogBackend for FaultyBackend {
    async fn open(
        &self,
        dir: &Path,
        group: Option<GroupKey>,
    ) -> lista_log::Result<Arc<dyn GroupLog>> {
        let inner = RocksBackend.open(dir, group).await?;
        Ok(Arc::new(FaultyLog {
            inner,
            faults: self.faults.clone(),
        }))
    }
}

struct FaultyLog {
    inner: Arc<dyn GroupLog>,
    faults: Arc<Faults>,
}

#[async_trait]
impl GroupLog for FaultyLog {
    fn group_key(&self) -> GroupKey {
        self.inner.group_key()
    }

    fn local_key(&self) -> WriterKey {
        self.inner.local_key()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn is_writer(&self, key: &WriterKey) -> bool {
        self.inner.is_writer(key)
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn local_len(&self) -> lista_log::Result<u64> {
        self.inner.local_len()
    }

    fn writer_len(&self, writer: &WriterKey) -> lista_log::Result<u64> {
        self.inner.writer_len(writer)
    }

    async fn append(&self, value: Value) -> lista_log::Result<u64> {
        if self.faults.corrupt_append.swap(false, Ordering::SeqCst) {
            return Err(LogError::Corruption("injected on append".into()));
        }
        if self.faults.lose_append.swap(false, Ordering::SeqCst) {
            return Ok(self.inner.local_len()? + 1);
        }
        if self.faults.slow_append.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.inner.append(value).await
    }

    async fn flush(&self) -> lista_log::Result<()> {
        self.inner.flush().await
    }

    async fn update(&self, hook: &mut dyn ApplyHook) -> lista_log::Result<usize> {
        if self.faults.corrupt.swap(false, Ordering::SeqCst) {
            return Err(LogError::Corruption("injected".into()));
        }
        let remaining = self.faults.transient.load(Ordering::SeqCst);
        if remaining > 0 {
            self.faults.transient.store(remaining - 1, Ordering::SeqCst);
            return Err(LogError::Checkout {
                checkout: 7,
                length: 3,
            });
        }
        self.inner.update(hook).await
    }

    fn merged_len(&self) -> lista_log::Result<u64> {
        self.inner.merged_len()
    }

    fn merged_get(&self, index: u64) -> lista_log::Result<MergedNode> {
        self.inner.merged_get(index)
    }

    fn request_range(&self, writer: WriterKey, start: u64, end: u64) {
        self.inner.request_range(writer, start, end)
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.subscribe()
    }

    async fn replicate(&self, stream: PeerStream) -> lista_log::Result<()> {
        self.inner.replicate(stream).await
    }

    async fn close(&self) -> lista_log::Result<()> {
        self.inner.close().await
    }
}

fn faulty_engine(net: &MemoryNetwork, dir: &Path, faults: Arc<Faults>) -> Engine {
    faulty_engine_with(net, EngineConfig::fast(dir), faults)
}

fn faulty_engine_with(net: &MemoryNetwork, config: EngineConfig, faults: Arc<Faults>) -> Engine {
    let transport = Arc::new(net.transport("faulty"));
    Engine::new(
        config,
        Arc::new(FaultyBackend { faults }),
        transport.clone(),
        transport,
    )
}

#[tokio::test]
async fn transient_errors_recover_without_user_error() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let faults = Arc::new(Faults::default());
    let host = faulty_engine(&net, dir.path(), faults.clone());
    host.start().await.unwrap();
    let mut rx = host.subscribe();

    faults.transient.store(3, Ordering::SeqCst);
    host.add_item("Milk", None).await.unwrap();
    assert_eq!(faults.transient.load(Ordering::SeqCst), 0);
    assert_eq!(texts(&host).await[0], "Milk");

    let mut seen = Vec::new();
    drain(&mut rx, &mut seen);
    assert!(error_titles(&seen).is_empty(), "got {:?}", seen);
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::Reinitialized { .. })));
    assert_eq!(host.phase(), Phase::Ready);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn corruption_resets_to_a_new_group() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let faults = Arc::new(Faults::default());
    let host = faulty_engine(&net, dir.path(), faults.clone());
    host.start().await.unwrap();
    host.add_item("Milk", None).await.unwrap();
    let old_group = host.group_key().await.unwrap();
    let old_store = dir.path().join("lista").join(&old_group.to_hex()[..16]);
    assert!(old_store.exists());
    let mut rx = host.subscribe();

    faults.corrupt.store(true, Ordering::SeqCst);
    assert!(host.request_resync().await.is_err());

    let mut seen = Vec::new();
    wait_until("reset to complete", || {
        drain(&mut rx, &mut seen);
        let done = error_titles(&seen).iter().any(|t| t == "Reset Complete");
        async move { done }
    })
    .await;
    let h = &host;
    wait_until("engine ready", move || async move { h.phase() == Phase::Ready }).await;

    let titles = error_titles(&seen);
    assert_eq!(titles.iter().filter(|t| *t == "Data Reset Required").count(), 1);
    assert_eq!(titles.iter().filter(|t| *t == "Reset Complete").count(), 1);
    assert!(seen.iter().any(|n| matches!(n, Notification::ResetOccurred)));

    let new_group = host.group_key().await.unwrap();
    assert_ne!(new_group, old_group);
    assert!(!old_store.exists());
    assert_eq!(texts(&host).await, DEFAULT_LIST.to_vec());

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn lost_append_is_reported_as_failure() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let faults = Arc::new(Faults::default());
    let host = faulty_engine(&net, dir.path(), faults.clone());
    host.start().await.unwrap();
    let mut rx = host.subscribe();

    faults.lose_append.store(true, Ordering::SeqCst);
    let result = host.add_item("Milk", None).await;
    assert!(
        matches!(result, Err(EngineError::Unconfirmed { .. })),
        "got {:?}",
        result
    );
    assert!(!texts(&host).await.contains(&"Milk".to_string()));

    let mut seen = Vec::new();
    drain(&mut rx, &mut seen);
    assert_eq!(error_titles(&seen), vec!["Operation Failed".to_string()]);

    host.add_item("Eggs", None).await.unwrap();
    assert_eq!(texts(&host).await[0], "Eggs");
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn write_queued_during_group_switch_is_superseded() {
    let dir = tempdir().unwrap();
    let other_dir = tempdir().unwrap();
    let net = MemoryNetwork::new();

    let other = engine(&net, other_dir.path(), "other");
    other.start().await.unwrap();
    let other_group = other.group_key().await.unwrap();

    let faults = Arc::new(Faults::default());
    let mut config = EngineConfig::fast(dir.path());
    config.teardown_grace = Duration::from_millis(600);
    let host = faulty_engine_with(&net, config, faults.clone());
    host.start().await.unwrap();
    let old_group = host.group_key().await.unwrap();

    faults.slow_append.store(true, Ordering::SeqCst);
    let first = {
        let host = host.clone();
        tokio::spawn(async move { host.add_item("Milk", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = {
        let host = host.clone();
        tokio::spawn(async move { host.add_item("Eggs", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let join = {
        let host = host.clone();
        let key = other_group.to_hex();
        tokio::spawn(async move { host.join_group(&key).await })
    };

    let queued = queued.await.unwrap();
    assert!(
        matches!(queued, Err(EngineError::Superseded)),
        "got {:?}",
        queued
    );
    first.await.unwrap().unwrap();
    join.await.unwrap().unwrap();
    faults.slow_append.store(false, Ordering::SeqCst);
    assert_eq!(host.group_key().await, Some(other_group));
    host.shutdown().await.unwrap();

    // Only the write that had started reached the old group's log.
    let old = RocksBackend
        .open(&dir.path().join("lista").join(&old_group.to_hex()[..16]), Some(old_group))
        .await
        .unwrap();
    assert_eq!(old.local_len().unwrap(), DEFAULT_LIST.len() as u64 + 1);
    old.close().await.unwrap();
    other.shutdown().await.unwrap();
}

#[tokio::test]
async fn corruption_on_append_resets_once() {
    let dir = tempdir().unwrap();
    let net = MemoryNetwork::new();
    let faults = Arc::new(Faults::default());
    let host = faulty_engine(&net, dir.path(), faults.clone());
    host.start().await.unwrap();
    let old_group = host.group_key().await.unwrap();
    let mut rx = host.subscribe();

    faults.corrupt_append.store(true, Ordering::SeqCst);
    let result = host.add_item("Milk", None).await;
    assert!(matches!(result, Err(EngineError::Log(LogError::Corruption(_)))));

    let mut seen = Vec::new();
    wait_until("reset to complete", || {
        drain(&mut rx, &mut seen);
        let done = error_titles(&seen).iter().any(|t| t == "Reset Complete");
        async move { done }
    })
    .await;
    let h = &host;
    wait_until("engine ready", move || async move { h.phase() == Phase::Ready }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drain(&mut rx, &mut seen);

    let titles = error_titles(&seen);
    assert_eq!(titles.iter().filter(|t| *t == "Data Reset Required").count(), 1);
    assert_eq!(titles.iter().filter(|t| *t == "Reset Complete").count(), 1);
    assert_ne!(host.group_key().await.unwrap(), old_group);
    assert_eq!(texts(&host).await, DEFAULT_LIST.to_vec());

    host.shutdown().await.unwrap();
}
