//! Persisted layout under the per-installation base directory.
//!
//! ```text
//! <base>/
//!   lista/<group prefix>/     log store of one group (RocksDB)
//!   lista/new/                store of a group being created
//!   lista-group-key.txt       group key, once this device can write
//!   lista-local-writer-key.txt
//!   .lista-storage-v2         storage version marker
//!   .lista-reset-pending      a reset could not finish deleting storage
//!   lista.lock                process-exclusive lock
//! ```

use crate::error::{EngineError, Result};
use crate::ops::now_millis;
use lista_log::{GroupKey, WriterKey};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const STORE_DIR: &str = "lista";
const STAGING_DIR: &str = "new";
const GROUP_KEY_FILE: &str = "lista-group-key.txt";
const WRITER_KEY_FILE: &str = "lista-local-writer-key.txt";
const VERSION_MARKER: &str = ".lista-storage-v2";
const RESET_MARKER: &str = ".lista-reset-pending";
const LOCK_FILE: &str = "lista.lock";

/// Paths of everything the engine persists.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base: PathBuf,
}

impl StorageLayout {
    /// Layout rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Parent of every group store.
    pub fn store_root(&self) -> PathBuf {
        self.base.join(STORE_DIR)
    }

    /// Store of a known group.
    pub fn group_store(&self, group: &GroupKey) -> PathBuf {
        self.store_root().join(&group.to_hex()[..16])
    }

    /// Store used while creating a new group.
    pub fn staging_store(&self) -> PathBuf {
        self.store_root().join(STAGING_DIR)
    }

    /// Group key file.
    pub fn group_key_file(&self) -> PathBuf {
        self.base.join(GROUP_KEY_FILE)
    }

    /// Local writer key file.
    pub fn writer_key_file(&self) -> PathBuf {
        self.base.join(WRITER_KEY_FILE)
    }

    /// Storage version marker.
    pub fn version_marker(&self) -> PathBuf {
        self.base.join(VERSION_MARKER)
    }

    /// Pending reset marker.
    pub fn reset_marker(&self) -> PathBuf {
        self.base.join(RESET_MARKER)
    }

    /// Lock file.
    pub fn lock_file(&self) -> PathBuf {
        self.base.join(LOCK_FILE)
    }

    /// Create the base directory.
    pub fn ensure_base(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base)?;
        Ok(())
    }

    /// Persisted group key, if any. Unreadable content is treated as absent.
    pub fn read_group_key(&self) -> Result<Option<GroupKey>> {
        Ok(read_key_file(&self.group_key_file())?
            .and_then(|s| match GroupKey::from_hex(&s) {
                Ok(k) => Some(k),
                Err(_) => {
                    warn!("Ignoring malformed group key file");
                    None
                }
            }))
    }

    /// Persist the group key.
    pub fn write_group_key(&self, key: &GroupKey) -> Result<()> {
        write_atomic(&self.group_key_file(), &key.to_hex())
    }

    /// Forget the group key.
    pub fn clear_group_key(&self) -> Result<()> {
        remove_if_exists(&self.group_key_file())
    }

    /// Persisted local writer key, if any.
    pub fn read_writer_key(&self) -> Result<Option<WriterKey>> {
        Ok(read_key_file(&self.writer_key_file())?.and_then(|s| WriterKey::from_hex(&s).ok()))
    }

    /// Persist the local writer key.
    pub fn write_writer_key(&self, key: &WriterKey) -> Result<()> {
        write_atomic(&self.writer_key_file(), &key.to_hex())
    }

    /// Discard state written by an incompatible storage version. Returns
    /// true if anything was wiped.
    pub async fn check_version(&self, attempts: u32, backoff: Duration) -> Result<bool> {
        if self.version_marker().exists() {
            return Ok(false);
        }
        let stale = self.store_root().exists() || self.group_key_file().exists();
        if stale {
            warn!("Storage version marker missing, discarding old storage");
            self.wipe(attempts, backoff).await?;
        }
        write_atomic(&self.version_marker(), &format!("v2:{}", now_millis()))?;
        Ok(stale)
    }

    /// Finish a reset that could not delete storage last time. Returns true
    /// if one was pending.
    pub async fn complete_pending_reset(&self, attempts: u32, backoff: Duration) -> Result<bool> {
        if !self.reset_marker().exists() {
            return Ok(false);
        }
        warn!("Completing pending reset from a previous run");
        self.wipe(attempts, backoff).await?;
        remove_if_exists(&self.reset_marker())?;
        info!("Pending reset completed");
        Ok(true)
    }

    /// Record that storage still has to be deleted.
    pub fn mark_reset_pending(&self, reason: &str) -> Result<()> {
        write_atomic(&self.reset_marker(), &format!("{}:{}", now_millis(), reason))
    }

    /// Delete every group store and the identity files.
    pub async fn wipe(&self, attempts: u32, backoff: Duration) -> Result<()> {
        delete_with_retry(&self.store_root(), attempts, backoff).await?;
        self.clear_group_key()?;
        remove_if_exists(&self.writer_key_file())?;
        Ok(())
    }
}

/// Remove a directory tree, retrying while files are still held open.
pub async fn delete_with_retry(path: &Path, attempts: u32, backoff: Duration) -> Result<()> {
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!("Deleted {} (attempt {})", path.display(), attempt);
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(
                    "Deleting {} failed on attempt {}/{}: {}",
                    path.display(),
                    attempt,
                    attempts,
                    e
                );
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }
    Err(last
        .map(EngineError::Io)
        .unwrap_or_else(|| EngineError::InvalidInput("nothing to delete".into())))
}

fn read_key_file(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) if s.trim().is_empty() => Ok(None),
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FAST: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn fresh_install_writes_marker() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        assert!(!layout.check_version(3, FAST).await.unwrap());
        assert!(layout.version_marker().exists());
        let marker = std::fs::read_to_string(layout.version_marker()).unwrap();
        assert!(marker.starts_with("v2:"));
    }

    #[tokio::test]
    async fn unversioned_storage_is_discarded() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        std::fs::create_dir_all(layout.store_root().join("old")).unwrap();
        layout
            .write_group_key(&GroupKey::from_bytes([1; 32]))
            .unwrap();

        assert!(layout.check_version(3, FAST).await.unwrap());
        assert!(!layout.store_root().exists());
        assert_eq!(layout.read_group_key().unwrap(), None);
        assert!(!layout.check_version(3, FAST).await.unwrap());
    }

    #[tokio::test]
    async fn pending_reset_is_completed() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        std::fs::create_dir_all(layout.store_root().join("abc")).unwrap();
        layout.mark_reset_pending("test").unwrap();

        assert!(layout.complete_pending_reset(3, FAST).await.unwrap());
        assert!(!layout.store_root().exists());
        assert!(!layout.reset_marker().exists());
        assert!(!layout.complete_pending_reset(3, FAST).await.unwrap());
    }

    #[test]
    fn key_files_roundtrip() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let key = GroupKey::from_bytes([8; 32]);
        layout.write_group_key(&key).unwrap();
        assert_eq!(layout.read_group_key().unwrap(), Some(key));

        std::fs::write(layout.group_key_file(), "garbage").unwrap();
        assert_eq!(layout.read_group_key().unwrap(), None);
    }

    #[test]
    fn group_stores_are_separate() {
        let layout = StorageLayout::new("/tmp/x");
        let a = layout.group_store(&GroupKey::from_bytes([1; 32]));
        let b = layout.group_store(&GroupKey::from_bytes([2; 32]));
        assert_ne!(a, b);
        assert!(a.starts_with(layout.store_root()));
    }
}
