//! Process-exclusive storage lock.

use crate::error::{EngineError, Result};
use crate::ops::now_millis;
use rand::Rng;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Held for the lifetime of an engine; the file is removed on drop.
#[derive(Debug)]
pub struct StorageLock {
    path: PathBuf,
}

impl StorageLock {
    /// Wait a random delay up to `jitter`, then create the lock file
    /// exclusively. An existing file means another instance owns the storage.
    pub async fn acquire(path: &Path, jitter: Duration) -> Result<Self> {
        let max = jitter.as_millis() as u64;
        if max > 0 {
            let delay = rand::thread_rng().gen_range(0..=max);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}:{}", std::process::id(), now_millis())?;
                file.sync_all()?;
                info!("Acquired storage lock {}", path.display());
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path).unwrap_or_default();
                error!(
                    "Storage lock {} is held (owner {}); another instance is running",
                    path.display(),
                    holder.trim()
                );
                Err(EngineError::Locked(format!(
                    "{} held by {}",
                    path.display(),
                    holder.trim()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released storage lock {}", self.path.display()),
            Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
        }
    }
}
