//! Worker lifecycle state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::BridgeError;

/// Lifecycle of one worker instance: `Starting → Ready → Dead`.
///
/// `Dead` is terminal; a restarted worker gets a new bridge and a fresh state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Spawned, no ready signal yet
    #[default]
    Starting,
    /// Ready signal received
    Ready,
    /// Channel closed, bridge shut down, or liveness probe failed
    Dead,
}

impl WorkerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

/// Shared, observable worker state.
pub struct WorkerStatus {
    tx: watch::Sender<WorkerState>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(WorkerState::Starting);
        Self { tx }
    }

    pub fn current(&self) -> WorkerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }

    /// Returns `false` if the worker is already dead.
    pub fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|state| match state {
            WorkerState::Starting => {
                *state = WorkerState::Ready;
                true
            }
            WorkerState::Ready | WorkerState::Dead => false,
        });
        !self.current().is_dead()
    }

    /// Returns `true` if this call made the transition.
    pub fn mark_dead(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_dead() {
                false
            } else {
                *state = WorkerState::Dead;
                true
            }
        })
    }

    /// Wait until the worker is ready, it dies, or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut rx = self.subscribe();
        let wait = rx.wait_for(|state| !matches!(state, WorkerState::Starting));
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) if state.is_ready() => Ok(()),
            Ok(_) => Err(BridgeError::WorkerDied),
            Err(_) => Err(BridgeError::ReadyTimeout(timeout)),
        }
    }
}
