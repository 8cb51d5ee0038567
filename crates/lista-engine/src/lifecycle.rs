//! Engine lifecycle.
//!
//! ```text
//! Idle -> Initializing -> Ready -> {Resetting, Joining} -> Initializing
//!              \-> Idle (failed start or lost session)
//! ```
//!
//! Transitions are checked atomically; callers that lose a race either wait
//! for the in-flight operation or get an error, never a silent no-op.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Initializing,
    Ready,
    Resetting,
    Joining,
}

impl Phase {
    /// Whether `self -> to` is allowed.
    pub fn can_transition(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Idle, Initializing)
                | (Initializing, Ready)
                | (Initializing, Idle)
                | (Ready, Resetting)
                | (Ready, Joining)
                | (Ready, Idle)
                | (Resetting, Initializing)
                | (Resetting, Idle)
                | (Joining, Initializing)
                | (Joining, Idle)
        )
    }

    /// True while a reset, join or initialization is running.
    pub fn is_transient(self) -> bool {
        matches!(self, Phase::Initializing | Phase::Resetting | Phase::Joining)
    }
}

/// Observable lifecycle state.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<Phase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Start in [`Phase::Idle`].
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Idle);
        Self { tx }
    }

    /// Current phase.
    pub fn current(&self) -> Phase {
        *self.tx.borrow()
    }

    /// Move to `to` if allowed from the current phase.
    pub fn transition(&self, to: Phase) -> Result<()> {
        let mut from = Phase::Idle;
        let changed = self.tx.send_if_modified(|phase| {
            from = *phase;
            if phase.can_transition(to) {
                *phase = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!("Lifecycle {:?} -> {:?}", from, to);
            Ok(())
        } else {
            Err(EngineError::InvalidTransition { from, to })
        }
    }

    /// Wait until no reset, join or initialization is running. Returns the
    /// phase reached (`Ready` or `Idle`).
    pub async fn settled(&self) -> Phase {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|phase| !phase.is_transient()).await {
            Ok(phase) => *phase,
            Err(_) => self.current(),
        }
    }

    /// Subscribe to phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn valid_path() {
        let lc = Lifecycle::new();
        lc.transition(Phase::Initializing).unwrap();
        lc.transition(Phase::Ready).unwrap();
        lc.transition(Phase::Resetting).unwrap();
        lc.transition(Phase::Initializing).unwrap();
        lc.transition(Phase::Ready).unwrap();
        lc.transition(Phase::Joining).unwrap();
        lc.transition(Phase::Initializing).unwrap();
        lc.transition(Phase::Ready).unwrap();
        lc.transition(Phase::Idle).unwrap();
        assert_eq!(lc.current(), Phase::Idle);
    }

    #[test]
    fn rejects_invalid() {
        let lc = Lifecycle::new();
        assert!(matches!(
            lc.transition(Phase::Resetting),
            Err(EngineError::InvalidTransition {
                from: Phase::Idle,
                to: Phase::Resetting
            })
        ));
        lc.transition(Phase::Initializing).unwrap();
        lc.transition(Phase::Ready).unwrap();
        lc.transition(Phase::Resetting).unwrap();
        assert!(lc.transition(Phase::Joining).is_err());
        assert!(lc.transition(Phase::Resetting).is_err());
        assert!(lc.transition(Phase::Ready).is_err());
    }

    #[tokio::test]
    async fn settled_waits_for_ready() {
        let lc = Arc::new(Lifecycle::new());
        lc.transition(Phase::Initializing).unwrap();

        let waiter = {
            let lc = Arc::clone(&lc);
            tokio::spawn(async move { lc.settled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        lc.transition(Phase::Ready).unwrap();
        assert_eq!(waiter.await.unwrap(), Phase::Ready);
    }
}
