//! Correlation table: outstanding request id → pending completion.
//!
//! Shared by the dispatcher (inserts) and the response router (removes). Both
//! may run on different runtime threads, so access goes through one mutex.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::CallError;
use crate::protocol::RequestId;

pub type CallResult = Result<Value, CallError>;

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),
}

impl From<CorrelationError> for CallError {
    fn from(e: CorrelationError) -> Self {
        match e {
            CorrelationError::DuplicateId(id) => CallError::DuplicateId(id),
        }
    }
}

struct PendingCall {
    resolver: oneshot::Sender<CallResult>,
    operation: &'static str,
    registered_at: Instant,
    deadline: Option<AbortHandle>,
}

impl PendingCall {
    fn settle(self, id: RequestId, result: CallResult) {
        if let Some(deadline) = self.deadline {
            deadline.abort();
        }
        tracing::debug!(
            id,
            operation = self.operation,
            ok = result.is_ok(),
            elapsed_ms = self.registered_at.elapsed().as_millis() as u64,
            "Call settled"
        );
        // Receiver gone means the caller stopped waiting; nothing to do.
        let _ = self.resolver.send(result);
    }
}

#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<RequestId, PendingCall>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingCall>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Correlation table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register `id` and return the receiver its result will arrive on.
    pub fn register(
        &self,
        id: RequestId,
        operation: &'static str,
    ) -> Result<oneshot::Receiver<CallResult>, CorrelationError> {
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(CorrelationError::DuplicateId(id));
        }
        let (resolver, receiver) = oneshot::channel();
        pending.insert(
            id,
            PendingCall {
                resolver,
                operation,
                registered_at: Instant::now(),
                deadline: None,
            },
        );
        Ok(receiver)
    }

    /// Tie a deadline task to `id`; it is aborted when the call settles.
    /// Aborts the task right away if `id` already settled.
    pub fn attach_deadline(&self, id: RequestId, deadline: AbortHandle) {
        let mut pending = self.lock();
        match pending.get_mut(&id) {
            Some(call) => call.deadline = Some(deadline),
            None => deadline.abort(),
        }
    }

    pub fn complete(&self, id: RequestId, payload: Value) -> bool {
        self.settle(id, Ok(payload))
    }

    pub fn fail(&self, id: RequestId, error: CallError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: RequestId, result: CallResult) -> bool {
        // Entry leaves the map before the continuation runs.
        let call = self.lock().remove(&id);
        match call {
            Some(call) => {
                call.settle(id, result);
                true
            }
            None => {
                tracing::debug!(id, ok = result.is_ok(), "No pending call for id, dropping");
                false
            }
        }
    }

    pub fn has(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Drop the entry without settling it. The caller observes
    /// [`CallError::Dropped`].
    pub fn remove(&self, id: RequestId) -> bool {
        let call = self.lock().remove(&id);
        match call {
            Some(call) => {
                if let Some(deadline) = call.deadline {
                    deadline.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Reject every pending call with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: CallError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            call.settle(id, Err(error.clone()));
        }
        count
    }
}
