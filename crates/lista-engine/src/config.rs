//! Engine configuration.

use crate::recovery::RetryPolicy;
use lista_log::WriterKey;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-installation base directory
    pub base_dir: PathBuf,
    /// Retry policy for log updates
    pub retry: RetryPolicy,
    /// Window over which exhausted transient errors are counted
    pub transient_window: Duration,
    /// Transient errors in the window that trigger a soft reinit
    pub soft_reinit_threshold: usize,
    /// Transient errors in the window that force a full reset
    pub full_reset_threshold: usize,
    /// Attempts at deleting storage during a reset
    pub delete_attempts: u32,
    /// Base delay between deletion attempts, multiplied by the attempt number
    pub delete_backoff: Duration,
    /// Pause after destroying swarms so sockets and file handles settle
    pub teardown_grace: Duration,
    /// How long a handshake waits for the remote writer key
    pub handshake_timeout: Duration,
    /// Delay before a guest re-runs the merge after connecting
    pub guest_sync_delay: Duration,
    /// Upper bound of the random delay before taking the storage lock
    pub lock_jitter: Duration,
    /// Flush and check the log length after every write
    pub confirm_writes: bool,
    /// Seed first-run defaults
    pub seed_defaults: bool,
    /// Writers a writable device authorizes on first initialization
    pub static_writers: Vec<WriterKey>,
}

impl EngineConfig {
    /// Default configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Short delays for tests.
    pub fn fast(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                soft_reinit_after: 2,
            },
            delete_backoff: Duration::from_millis(10),
            teardown_grace: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(2),
            guest_sync_delay: Duration::from_millis(50),
            lock_jitter: Duration::from_millis(5),
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            retry: RetryPolicy::default(),
            transient_window: Duration::from_secs(30),
            soft_reinit_threshold: 5,
            full_reset_threshold: 10,
            delete_attempts: 5,
            delete_backoff: Duration::from_millis(300),
            teardown_grace: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(30),
            guest_sync_delay: Duration::from_secs(1),
            lock_jitter: Duration::from_millis(200),
            confirm_writes: true,
            seed_defaults: true,
            static_writers: Vec::new(),
        }
    }
}
