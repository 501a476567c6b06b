//! Worker runtime: the child side of the bridge protocol.
//!
//! The host side (dispatch, routing) lives in [`crate::bridge`]. A worker:
//! - announces itself with `"ready"`
//! - decodes each `{id, type, ...}` request and runs the handler for it on its
//!   own task, so slow calls never hold up fast ones
//! - replies `{id, response}` or `{id, err}` in completion order
//! - streams progress broadcasts through [`ProgressSender`]

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

use crate::channel::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::channel::{self, ChannelError, ChannelSender};
use crate::protocol::{
    InboundMessage, Operation, ProgressEvent, ProgressKind, Request, RequestId, WorkerError,
    is_truthy,
};

/// Streams progress broadcasts to the host while a request runs.
#[derive(Clone)]
pub struct ProgressSender {
    tx: ChannelSender,
}

impl ProgressSender {
    pub fn send(&self, kind: ProgressKind, payload: Value) -> Result<(), ChannelError> {
        self.tx
            .send(InboundMessage::Progress(ProgressEvent { kind, payload }).into_value())
    }

    pub fn upload(&self, payload: Value) -> Result<(), ChannelError> {
        self.send(ProgressKind::Upload, payload)
    }

    pub fn download(&self, payload: Value) -> Result<(), ChannelError> {
        self.send(ProgressKind::Download, payload)
    }
}

/// Capability implementation run by the worker.
///
/// `Err` carries the error payload sent back as `err`. A payload the host
/// would read as success (`null`, `false`, `0`, `""`) is sent as
/// `"unknown error"` instead.
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        id: RequestId,
        operation: Operation,
        progress: ProgressSender,
    ) -> Result<Value, Value>;
}

/// Serve requests from `reader` until the host closes its end.
pub async fn run_worker<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> io::Result<()>
where
    H: WorkerHandler,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx, writer_task) = channel::open(reader, writer, DEFAULT_MAX_FRAME_LENGTH);

    tx.send(InboundMessage::Ready.into_value())
        .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
    tracing::info!("Worker ready");

    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(Ok(message)) => {
                        let Some(request) = decode_request(&tx, message) else {
                            continue;
                        };
                        let handler = Arc::clone(&handler);
                        let tx = tx.clone();
                        in_flight.spawn(async move {
                            serve(handler.as_ref(), request, tx).await;
                        });
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Host channel error");
                        break;
                    }
                    None => {
                        tracing::info!("Host channel closed, exiting");
                        break;
                    }
                }
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Request handler panicked");
                    let _ = tx.send(
                        InboundMessage::Fault { error: Value::String(format!("handler panicked: {}", e)) }
                            .into_value(),
                    );
                }
            }
        }
    }

    // Host is gone; nobody is left to read replies.
    in_flight.shutdown().await;
    drop(tx);
    if let Err(e) = writer_task.await {
        tracing::warn!(error = %e, "Worker writer task failed");
    }
    tracing::info!("Worker exiting");
    Ok(())
}

/// Serve requests over the process's stdin/stdout.
pub async fn run_stdio_worker<H: WorkerHandler>(handler: Arc<H>) -> io::Result<()> {
    run_worker(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Decode one request, answering malformed ones on the spot.
fn decode_request(tx: &ChannelSender, message: Value) -> Option<Request> {
    let id = message.get("id").and_then(Value::as_u64);
    match serde_json::from_value::<Request>(message) {
        Ok(request) => Some(request),
        Err(e) => {
            let reply = match id {
                Some(id) => {
                    tracing::warn!(id, error = %e, "Unsupported or malformed request");
                    InboundMessage::Reply {
                        id,
                        outcome: Err(WorkerError::new(format!("unsupported request: {}", e))),
                    }
                }
                None => {
                    tracing::warn!(error = %e, "Request without id");
                    InboundMessage::Fault {
                        error: Value::String(format!("malformed request: {}", e)),
                    }
                }
            };
            let _ = tx.send(reply.into_value());
            None
        }
    }
}

async fn serve<H: WorkerHandler>(handler: &H, request: Request, tx: ChannelSender) {
    let Request { id, operation } = request;
    let tag = operation.tag();
    tracing::debug!(id, operation = tag, "Handling request");

    let progress = ProgressSender { tx: tx.clone() };
    let outcome = handler
        .handle(id, operation, progress)
        .await
        .map_err(|err| {
            tracing::debug!(id, operation = tag, error = %err, "Request failed");
            WorkerError::new(if is_truthy(&err) { err } else { json!("unknown error") })
        });

    if tx.send(InboundMessage::Reply { id, outcome }.into_value()).is_err() {
        tracing::warn!(id, operation = tag, "Host channel closed before reply");
    }
}
