//! Error types surfaced to callers of the bridge.

use std::time::Duration;

use crate::protocol::{RequestId, WorkerError};

/// Why a dispatched call did not produce a value.
///
/// `Clone` because memoized calls share one result between many callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The worker replied with an error for this request.
    #[error("worker error: {0}")]
    Worker(WorkerError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call {id} timed out after {after:?}")]
    Timeout { id: RequestId, after: Duration },

    /// The channel closed or the bridge shut down with the call outstanding.
    #[error("worker is gone")]
    WorkerGone,

    /// The pending entry was removed without a result.
    #[error("call dropped without a result")]
    Dropped,

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Bridge lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] crate::channel::process::SpawnError),

    #[error("worker did not signal ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("worker died before becoming ready")]
    WorkerDied,
}
