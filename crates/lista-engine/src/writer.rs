//! Write serializer.
//!
//! All local mutations of one group go through a single FIFO worker, so an
//! append and its durability check are never interleaved with another
//! write. Jobs fail fast once the group is being torn down.

use crate::error::{EngineError, Result};
use crate::ops::Operation;
use lista_log::{GroupLog, LogError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const QUEUE_DEPTH: usize = 256;

struct WriteJob {
    op: Operation,
    reply: oneshot::Sender<Result<u64>>,
}

/// FIFO append queue for one group.
pub struct WriteSerializer {
    tx: mpsc::Sender<WriteJob>,
    closing: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl WriteSerializer {
    /// Start the worker for `log`.
    pub fn spawn(log: Arc<dyn GroupLog>, confirm: bool) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(QUEUE_DEPTH);
        let closing = Arc::new(AtomicBool::new(false));
        let worker_closing = Arc::clone(&closing);

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = run_job(log.as_ref(), &worker_closing, &job.op, confirm).await;
                let _ = job.reply.send(result);
            }
        });

        Self {
            tx,
            closing,
            worker,
        }
    }

    /// Queue an operation and wait until it is appended. Returns the local
    /// log length after the write.
    pub async fn submit(&self, op: Operation) -> Result<u64> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(EngineError::Superseded);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob { op, reply })
            .await
            .map_err(|_| EngineError::Superseded)?;
        rx.await.map_err(|_| EngineError::Superseded)?
    }

    /// Fail every write that has not started yet. A write already being
    /// appended completes.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Close and stop the worker.
    pub fn shutdown(&self) {
        self.close();
        self.worker.abort();
    }
}

impl Drop for WriteSerializer {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_job(
    log: &dyn GroupLog,
    closing: &AtomicBool,
    op: &Operation,
    confirm: bool,
) -> Result<u64> {
    if closing.load(Ordering::SeqCst) || log.is_closed() {
        return Err(EngineError::Superseded);
    }
    if !log.is_writable() {
        return Err(EngineError::NotAuthorized);
    }

    let before = log.local_len()?;
    let length = log.append(op.to_value()).await.map_err(|e| match e {
        LogError::NotWritable => EngineError::NotAuthorized,
        LogError::Closed => EngineError::Superseded,
        other => EngineError::Log(other),
    })?;
    debug!("Appended {} at local length {}", op.kind(), length);

    if !confirm {
        return Ok(length);
    }

    log.flush().await?;
    let actual = log.local_len()?;
    let expected = before + 1;
    if actual < expected {
        warn!(
            "{} not persisted: length {} after flush, expected {}",
            op.kind(),
            actual,
            expected
        );
        return Err(EngineError::Unconfirmed { expected, actual });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ListItem;
    use lista_log::{Base, GroupKey};
    use tempfile::tempdir;

    #[tokio::test]
    async fn concurrent_submits_all_land() {
        let dir = tempdir().unwrap();
        let log: Arc<dyn GroupLog> = Arc::new(Base::open(dir.path(), None).unwrap());
        let writer = Arc::new(WriteSerializer::spawn(Arc::clone(&log), true));

        let mut receivers = Vec::new();
        for i in 0..20 {
            let writer = Arc::clone(&writer);
            let (tx, rx) = oneshot::channel();
            let handle = tokio::spawn(async move {
                let outcome = writer
                    .submit(Operation::Add(ListItem::new(format!("item {}", i), None)))
                    .await;
                let _ = tx.send(outcome);
            });
            tokio::task::yield_now().await;
            receivers.push((handle, rx));
        }
        for (handle, rx) in receivers {
            handle.await.unwrap();
            assert!(rx.await.unwrap().unwrap() >= 1);
        }

        assert_eq!(log.local_len().unwrap(), 20);
    }

    #[tokio::test]
    async fn writes_preserve_submission_order() {
        let dir = tempdir().unwrap();
        let base = Base::open(dir.path(), None).unwrap();
        let log: Arc<dyn GroupLog> = Arc::new(base.clone());
        let writer = WriteSerializer::spawn(Arc::clone(&log), false);

        let appends: Vec<_> = (0..10)
            .map(|i| writer.submit(Operation::Add(ListItem::new(format!("{}", i), None))))
            .collect();
        for result in futures::future::join_all(appends).await {
            result.unwrap();
        }

        let local = log.local_key();
        for i in 0..10u64 {
            let node = base.get_node(&local, i).unwrap();
            assert_eq!(node.value["value"]["text"], format!("{}", i));
        }
    }

    #[tokio::test]
    async fn guest_gets_not_authorized() {
        let host_dir = tempdir().unwrap();
        let guest_dir = tempdir().unwrap();
        let host = Base::open(host_dir.path(), None).unwrap();
        let guest: Arc<dyn GroupLog> = Arc::new(
            Base::open(guest_dir.path(), Some(GroupKey::from(host.local_key()))).unwrap(),
        );
        let writer = WriteSerializer::spawn(guest, true);

        let result = writer
            .submit(Operation::Add(ListItem::new("Milk", None)))
            .await;
        assert!(matches!(result, Err(EngineError::NotAuthorized)));
    }

    #[tokio::test]
    async fn shutdown_supersedes_writes() {
        let dir = tempdir().unwrap();
        let log: Arc<dyn GroupLog> = Arc::new(Base::open(dir.path(), None).unwrap());
        let writer = WriteSerializer::spawn(log, true);
        writer.shutdown();

        let result = writer
            .submit(Operation::Add(ListItem::new("Milk", None)))
            .await;
        assert!(matches!(result, Err(EngineError::Superseded)));
    }

    #[tokio::test]
    async fn close_rejects_new_writes() {
        let dir = tempdir().unwrap();
        let log: Arc<dyn GroupLog> = Arc::new(Base::open(dir.path(), None).unwrap());
        let writer = WriteSerializer::spawn(Arc::clone(&log), true);
        writer
            .submit(Operation::Add(ListItem::new("Milk", None)))
            .await
            .unwrap();

        writer.close();
        let result = writer
            .submit(Operation::Add(ListItem::new("Eggs", None)))
            .await;
        assert!(matches!(result, Err(EngineError::Superseded)));
        assert_eq!(log.local_len().unwrap(), 1);
    }
}
