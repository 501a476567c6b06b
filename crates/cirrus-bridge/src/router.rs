//! Response router: the single handler for worker → host messages.
//!
//! Flow per message (in transport order):
//! 1. `"ready"` → mark the worker ready
//! 2. fault notice → log only
//! 3. progress broadcast → fan out to listeners, table untouched
//! 4. `{id, err?, response?}` → settle and remove the pending call

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelReceiver;
use crate::correlation::CorrelationTable;
use crate::error::CallError;
use crate::health::WorkerStatus;
use crate::protocol::{
    InboundMessage, ProgressEvent, ProgressKind, RequestId, WorkerInstanceId,
};

/// What the router did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Ready,
    Fault,
    Broadcast(ProgressKind),
    Resolved(RequestId),
    Rejected(RequestId),
    /// Reply for an id with no pending call (late, duplicate, or timed out).
    Stray(RequestId),
    Unroutable,
}

pub struct ResponseRouter {
    table: Arc<CorrelationTable>,
    status: Arc<WorkerStatus>,
    progress: broadcast::Sender<ProgressEvent>,
}

impl ResponseRouter {
    pub fn new(
        table: Arc<CorrelationTable>,
        status: Arc<WorkerStatus>,
        progress: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            table,
            status,
            progress,
        }
    }

    pub fn route(&self, message: Value) -> RouteOutcome {
        match InboundMessage::classify(message) {
            InboundMessage::Ready => {
                if self.status.mark_ready() {
                    tracing::info!("Worker ready");
                } else {
                    tracing::warn!("Ready signal from a worker already marked dead");
                }
                RouteOutcome::Ready
            }
            InboundMessage::Fault { error } => {
                tracing::error!(error = %error, "Worker-side fault");
                RouteOutcome::Fault
            }
            InboundMessage::Progress(event) => {
                let kind = event.kind;
                // Err only means nobody is listening right now.
                let listeners = self.progress.send(event).unwrap_or(0);
                tracing::trace!(kind = kind.as_str(), listeners, "Progress broadcast");
                RouteOutcome::Broadcast(kind)
            }
            InboundMessage::Reply { id, outcome } => {
                let routed = match outcome {
                    Ok(response) => {
                        if self.table.complete(id, response) {
                            RouteOutcome::Resolved(id)
                        } else {
                            RouteOutcome::Stray(id)
                        }
                    }
                    Err(error) => {
                        tracing::warn!(id, %error, "Worker rejected call");
                        if self.table.fail(id, CallError::Worker(error)) {
                            RouteOutcome::Rejected(id)
                        } else {
                            RouteOutcome::Stray(id)
                        }
                    }
                };
                self.table.remove(id);
                if routed == RouteOutcome::Stray(id) {
                    tracing::warn!(id, "Reply for id with no pending call");
                }
                routed
            }
            InboundMessage::Unroutable(message) => {
                tracing::warn!(%message, "Unroutable worker message");
                RouteOutcome::Unroutable
            }
        }
    }

    /// Worker is gone: mark it dead and fail whatever is still pending.
    pub fn worker_gone(&self) {
        self.status.mark_dead();
        let failed = self.table.fail_all(CallError::WorkerGone);
        if failed > 0 {
            tracing::warn!(failed, "Failed pending calls, worker is gone");
        }
    }
}

/// Route inbound messages until the channel closes, a read fails, or
/// `shutdown` fires.
pub(crate) async fn run_event_loop(
    router: ResponseRouter,
    mut receiver: ChannelReceiver,
    shutdown: CancellationToken,
    instance: WorkerInstanceId,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!(%instance, "Event loop shutdown requested");
                break;
            }

            message = receiver.recv() => {
                match message {
                    Some(Ok(message)) => {
                        router.route(message);
                    }
                    Some(Err(e)) => {
                        tracing::error!(%instance, error = %e, "Worker channel error");
                        break;
                    }
                    None => {
                        tracing::warn!(%instance, "Worker channel closed (worker crashed?)");
                        break;
                    }
                }
            }
        }
    }

    router.worker_gone();
    tracing::info!(%instance, "Event loop exiting");
}
