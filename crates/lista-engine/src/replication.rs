//! Swarm wiring for one group.
//!
//! Two swarms run side by side: the replication swarm, addressed by the
//! group key, carries log entries; the handshake swarm, addressed by a
//! topic derived from the group key, carries writer keys for membership.

use crate::error::Result;
use crate::membership::{handshake_topic, Membership};
use crate::notify::{Notification, Notifier};
use crate::recovery::FaultClass;
use lista_log::{GroupLog, LogEvent};
use lista_swarm::{PeerConnection, Swarm, Topic, Transport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Asks the engine to run a merge pass soon.
pub type Kick = Arc<dyn Fn() + Send + Sync>;

/// Reports corrupted local storage found while replicating.
pub type Escalate = Arc<dyn Fn() + Send + Sync>;

/// Connected replication peers, reported to the UI on every change.
#[derive(Debug)]
pub struct PeerCounter {
    count: AtomicUsize,
    notifier: Notifier,
}

impl PeerCounter {
    /// Create a counter at zero.
    pub fn new(notifier: Notifier) -> Self {
        Self {
            count: AtomicUsize::new(0),
            notifier,
        }
    }

    /// Current number of peers.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// A peer connected.
    pub fn connected(&self) -> usize {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(count);
        count
    }

    /// A peer disconnected.
    pub fn disconnected(&self) -> usize {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let count = previous.saturating_sub(1);
        self.publish(count);
        count
    }

    /// Every swarm was torn down.
    pub fn reset(&self) {
        if self.count.swap(0, Ordering::SeqCst) != 0 {
            self.publish(0);
        }
    }

    fn publish(&self, count: usize) {
        self.notifier
            .notify(Notification::PeerCountChanged { count });
    }
}

/// Everything the connection tasks of one group need.
pub struct NetworkContext {
    pub log: Arc<dyn GroupLog>,
    pub membership: Arc<Membership>,
    pub peers: Arc<PeerCounter>,
    pub kick: Kick,
    pub escalate: Escalate,
    pub guest_sync_delay: Duration,
}

/// Running swarms of one group. Dropping it tears everything down.
pub struct Network {
    tasks: Vec<JoinHandle<()>>,
    peers: Arc<PeerCounter>,
}

impl Network {
    /// Join both swarms and start serving connections.
    pub async fn start(
        ctx: NetworkContext,
        replication: &dyn Transport,
        handshake: &dyn Transport,
    ) -> Result<Self> {
        let group = ctx.log.group_key();
        let replication_swarm = replication.join(Topic::from_bytes(*group.as_bytes())).await?;
        let handshake_swarm = handshake.join(handshake_topic(&group)).await?;
        info!("Joined replication and handshake swarms for group {}", group);

        let ctx = Arc::new(ctx);
        let peers = ctx.peers.clone();
        let tasks = vec![
            tokio::spawn(replication_loop(replication_swarm, ctx.clone())),
            tokio::spawn(handshake_loop(handshake_swarm, ctx.clone())),
            tokio::spawn(event_loop(ctx)),
        ];
        Ok(Self { tasks, peers })
    }

    /// Leave both swarms and drop every connection.
    pub fn destroy(mut self) {
        info!("Destroying swarms");
        self.stop();
    }

    fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.peers.reset();
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn replication_loop(mut swarm: Swarm, ctx: Arc<NetworkContext>) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            conn = swarm.next_connection() => match conn {
                Some(conn) => {
                    conns.spawn(serve_replica(conn, ctx.clone()));
                }
                None => break,
            },
            Some(done) = conns.join_next(), if !conns.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!("Replication task panicked: {}", e);
                    }
                }
            }
        }
    }
    debug!("Replication swarm {} closed", swarm.topic());
}

async fn serve_replica(conn: PeerConnection, ctx: Arc<NetworkContext>) {
    let peer = conn.peer.clone();
    let count = ctx.peers.connected();
    info!("Replication peer {} connected ({} peers)", peer, count);

    let guest = !ctx.log.is_writable();
    let sync = async {
        if guest {
            guest_sync(&ctx).await;
        }
    };
    let (result, ()) = tokio::join!(ctx.log.replicate(conn.stream), sync);
    match result {
        Ok(()) => debug!("Replication with {} finished", peer),
        Err(e) if FaultClass::of(&e) == FaultClass::Corruption => {
            error!("Replication with {} hit corrupted storage: {}", peer, e);
            (ctx.escalate)();
        }
        Err(e) => warn!("Replication with {} failed: {}", peer, e),
    }

    let count = ctx.peers.disconnected();
    info!("Replication peer {} disconnected ({} peers)", peer, count);
}

/// Pull the whole root writer log and merge it, then merge once more after
/// the first batch had time to arrive.
async fn guest_sync(ctx: &NetworkContext) {
    let root = ctx.log.group_key().root_writer();
    let have = ctx.log.writer_len(&root).unwrap_or(0);
    debug!("Guest sync: requesting root writer {} from {}", root, have);
    ctx.log.request_range(root, have, u64::MAX);
    (ctx.kick)();
    tokio::time::sleep(ctx.guest_sync_delay).await;
    (ctx.kick)();
}

async fn handshake_loop(mut swarm: Swarm, ctx: Arc<NetworkContext>) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            conn = swarm.next_connection() => match conn {
                Some(conn) => {
                    let membership = ctx.membership.clone();
                    conns.spawn(async move {
                        let peer = conn.peer.clone();
                        let state = membership.run(conn).await;
                        debug!("Handshake with {} ended in {:?}", peer, state);
                    });
                }
                None => break,
            },
            Some(done) = conns.join_next(), if !conns.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!("Handshake task panicked: {}", e);
                    }
                }
            }
        }
    }
    debug!("Handshake swarm {} closed", swarm.topic());
}

/// Merge whenever a remote writer's log grows.
async fn event_loop(ctx: Arc<NetworkContext>) {
    let local = ctx.log.local_key();
    let mut events = ctx.log.subscribe();
    loop {
        match events.recv().await {
            Ok(LogEvent::Appended { writer, .. }) if writer != local => (ctx.kick)(),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                debug!("Log events lagged by {}", n);
                (ctx.kick)();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_reports_every_change() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        let peers = PeerCounter::new(notifier);

        assert_eq!(peers.connected(), 1);
        assert_eq!(peers.connected(), 2);
        assert_eq!(peers.disconnected(), 1);
        peers.reset();
        assert_eq!(peers.count(), 0);

        let mut counts = Vec::new();
        while let Ok(Notification::PeerCountChanged { count }) = rx.try_recv() {
            counts.push(count);
        }
        assert_eq!(counts, vec![1, 2, 1, 0]);
    }

    #[test]
    fn counter_never_goes_negative() {
        let peers = PeerCounter::new(Notifier::new());
        assert_eq!(peers.disconnected(), 0);
        peers.reset();
        assert_eq!(peers.count(), 0);
    }

    #[tokio::test]
    async fn destroy_stops_tasks_and_clears_peers() {
        let peers = Arc::new(PeerCounter::new(Notifier::new()));
        peers.connected();
        let (alive, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await
        });
        let network = Network {
            tasks: vec![task],
            peers: peers.clone(),
        };

        network.destroy();
        assert_eq!(peers.count(), 0);
        assert!(stopped.await.is_err());
    }
}
