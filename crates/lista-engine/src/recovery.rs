//! Recovery supervisor.
//!
//! Classifies log faults by their typed [`ErrorKind`], retries transient
//! ones with exponential backoff and escalates repeated failures. The
//! destructive actions themselves (soft reinit, full reset) are injected
//! through [`Reinitialize`] and run under the engine's lifecycle guard.

use crate::error::EngineError;
use async_trait::async_trait;
use lista_log::{ErrorKind, LogError};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How a fault is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Dependency not replicated yet: retry, then soft reinit
    Transient,
    /// Integrity failure: full reset
    Corruption,
    /// Storage held by another instance: fatal at startup
    Locked,
    /// Not recoverable here; surfaced to the caller
    Other,
}

impl FaultClass {
    /// Classify a log error.
    pub fn of(err: &LogError) -> Self {
        match err.kind() {
            ErrorKind::Transient => FaultClass::Transient,
            ErrorKind::Corruption => FaultClass::Corruption,
            ErrorKind::Locked => FaultClass::Locked,
            _ => FaultClass::Other,
        }
    }

    /// Classify an engine error.
    pub fn of_engine(err: &EngineError) -> Self {
        match err {
            EngineError::Log(e) => Self::of(e),
            EngineError::Locked(_) => FaultClass::Locked,
            _ => FaultClass::Other,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before the final soft reinit
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each
    pub initial_backoff: Duration,
    /// Soft reinit once this many attempts have failed
    pub soft_reinit_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            soft_reinit_after: 2,
        }
    }
}

/// Recovery actions the supervisor may request.
#[async_trait]
pub trait Reinitialize: Send + Sync {
    /// Close and reopen the log under the same group.
    async fn soft_reinit(&self, reason: &str) -> crate::error::Result<()>;

    /// Wipe local state and start a new group.
    async fn full_reset(&self, reason: &str) -> crate::error::Result<()>;
}

/// Run `op`, retrying transient failures.
///
/// After `soft_reinit_after` failed attempts the log is soft-reinitialized
/// once. If every attempt fails, one more soft reinit runs before a final
/// attempt. Non-transient errors return immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    reinit: &dyn Reinitialize,
    mut op: F,
) -> Result<T, LogError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LogError>>,
{
    let mut delay = policy.initial_backoff;
    let mut soft_done = false;
    let mut last = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if FaultClass::of(&e) == FaultClass::Transient => {
                warn!(
                    "{}: transient error on attempt {}/{}: {}",
                    label, attempt, policy.max_attempts, e
                );
                last = Some(e);
                if attempt >= policy.soft_reinit_after && !soft_done {
                    soft_done = true;
                    if let Err(re) = reinit.soft_reinit(label).await {
                        warn!("{}: soft reinit failed: {}", label, re);
                    }
                }
                if attempt < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }

    info!("{}: retries exhausted, final soft reinit before last attempt", label);
    if let Err(re) = reinit.soft_reinit(label).await {
        warn!("{}: final soft reinit failed: {}", label, re);
        return Err(last.unwrap_or(LogError::Closed));
    }
    op().await
}

/// What a run of transient errors calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    None,
    SoftReinit,
    FullReset,
}

/// Sliding window of exhausted transient errors.
#[derive(Debug)]
pub struct TransientWindow {
    window: Duration,
    soft_at: usize,
    full_at: usize,
    hits: VecDeque<Instant>,
}

impl TransientWindow {
    /// Create a window with its thresholds.
    pub fn new(window: Duration, soft_at: usize, full_at: usize) -> Self {
        Self {
            window,
            soft_at,
            full_at,
            hits: VecDeque::new(),
        }
    }

    /// Record an error at `now`.
    pub fn record(&mut self, now: Instant) -> Escalation {
        while let Some(first) = self.hits.front() {
            if now.duration_since(*first) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);

        let count = self.hits.len();
        if count >= self.full_at {
            self.hits.clear();
            Escalation::FullReset
        } else if count == self.soft_at {
            Escalation::SoftReinit
        } else {
            Escalation::None
        }
    }

    /// Errors currently in the window.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// True if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Forget every error.
    pub fn clear(&mut self) {
        self.hits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        soft: AtomicUsize,
        full: AtomicUsize,
    }

    #[async_trait]
    impl Reinitialize for Counting {
        async fn soft_reinit(&self, _reason: &str) -> crate::error::Result<()> {
            self.soft.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn full_reset(&self, _reason: &str) -> crate::error::Result<()> {
            self.full.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            soft_reinit_after: 2,
        }
    }

    fn transient() -> LogError {
        LogError::Checkout {
            checkout: 1,
            length: 0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_three_transient_failures() {
        let reinit = Counting::default();
        let calls = AtomicUsize::new(0);

        let result = retry_with_backoff("update", &policy(), &reinit, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(transient())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(reinit.soft.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_errors_return_immediately() {
        let reinit = Counting::default();
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retry_with_backoff("update", &policy(), &reinit, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LogError::Corruption("bad".into()))
        })
        .await;

        assert!(matches!(result, Err(LogError::Corruption(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reinit.soft.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let reinit = Counting::default();
        let result: Result<(), _> =
            retry_with_backoff("update", &policy(), &reinit, || async { Err(transient()) }).await;
        assert!(matches!(result, Err(LogError::Checkout { .. })));
    }

    #[test]
    fn window_escalates_at_thresholds() {
        let mut window = TransientWindow::new(Duration::from_secs(30), 5, 10);
        let start = Instant::now();
        let mut escalations = Vec::new();
        for i in 0..10 {
            escalations.push(window.record(start + Duration::from_millis(i)));
        }
        assert_eq!(escalations[4], Escalation::SoftReinit);
        assert_eq!(escalations[9], Escalation::FullReset);
        assert_eq!(
            escalations
                .iter()
                .filter(|e| **e != Escalation::None)
                .count(),
            2
        );
        assert!(window.is_empty());
    }

    #[test]
    fn window_forgets_old_errors() {
        let mut window = TransientWindow::new(Duration::from_secs(30), 5, 10);
        let start = Instant::now();
        for i in 0..4 {
            window.record(start + Duration::from_secs(i));
        }
        let later = start + Duration::from_secs(60);
        assert_eq!(window.record(later), Escalation::None);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn classification() {
        assert_eq!(FaultClass::of(&transient()), FaultClass::Transient);
        assert_eq!(
            FaultClass::of(&LogError::Corruption("x".into())),
            FaultClass::Corruption
        );
        assert_eq!(
            FaultClass::of_engine(&EngineError::Locked("x".into())),
            FaultClass::Locked
        );
        assert_eq!(
            FaultClass::of_engine(&EngineError::NotAuthorized),
            FaultClass::Other
        );
    }
}
