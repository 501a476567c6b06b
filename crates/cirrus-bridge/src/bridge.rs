//! The bridge: one explicit object wiring transport, correlation, dispatch,
//! routing and worker state together.
//!
//! Construct it once per worker instance and hand out the [`Dispatcher`]
//! (an `Arc`) to whoever needs to make calls. A worker that dies needs a new
//! bridge; state never goes from `Dead` back to `Ready`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel;
use crate::channel::process::{WorkerProcess, WorkerSpawner};
use crate::config::BridgeConfig;
use crate::correlation::CorrelationTable;
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::health::{WorkerState, WorkerStatus};
use crate::liveness::{DeadReason, LivenessMonitor};
use crate::protocol::{ProgressEvent, WorkerInstanceId};
use crate::router::{ResponseRouter, run_event_loop};

/// How long a stopped worker gets to exit on its own before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Bridge {
    dispatcher: Arc<Dispatcher>,
    status: Arc<WorkerStatus>,
    progress: broadcast::Sender<ProgressEvent>,
    shutdown: CancellationToken,
    event_loop: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    process: Option<WorkerProcess>,
    instance: WorkerInstanceId,
    config: BridgeConfig,
}

impl Bridge {
    /// Attach to a worker already reachable over `reader`/`writer`.
    ///
    /// Must be called inside a tokio runtime. Does not wait for the ready
    /// signal; see [`wait_ready`](Self::wait_ready).
    pub fn connect<R, W>(reader: R, writer: W, config: BridgeConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let instance = WorkerInstanceId::new();
        let (sender, receiver, writer_task) =
            channel::open(reader, writer, config.max_frame_length);

        let table = Arc::new(CorrelationTable::new());
        let status = Arc::new(WorkerStatus::new());
        let (progress, _) = broadcast::channel(config.progress_capacity.max(1));

        let dispatcher = Arc::new(Dispatcher::new(
            sender,
            Arc::clone(&table),
            Arc::clone(&status),
            config.call_timeout,
        ));
        let router = ResponseRouter::new(table, Arc::clone(&status), progress.clone());

        let shutdown = CancellationToken::new();
        let event_loop = tokio::spawn(run_event_loop(
            router,
            receiver,
            shutdown.clone(),
            instance,
        ));

        tracing::info!(%instance, "Bridge connected");

        Self {
            dispatcher,
            status,
            progress,
            shutdown,
            event_loop: Some(event_loop),
            writer: Some(writer_task),
            process: None,
            instance,
            config,
        }
    }

    /// Spawn a worker process, connect to its stdio and wait for it to
    /// signal ready.
    pub async fn spawn(
        config: BridgeConfig,
        spawner: &dyn WorkerSpawner,
    ) -> Result<Self, BridgeError> {
        let (process, stdout, stdin) = WorkerProcess::start(spawner)?;
        let ready_timeout = config.ready_timeout;

        let mut bridge = Self::connect(stdout, stdin, config);
        tracing::info!(instance = %bridge.instance, pid = ?process.id(), "Waiting for worker ready");
        bridge.process = Some(process);

        if let Err(e) = bridge.status.wait_ready(ready_timeout).await {
            tracing::error!(instance = %bridge.instance, error = %e, "Worker failed to start");
            bridge.shutdown().await;
            return Err(e);
        }
        Ok(bridge)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn state(&self) -> WorkerState {
        self.status.current()
    }

    pub fn instance_id(&self) -> WorkerInstanceId {
        self.instance
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Wait for the ready signal, bounded by the configured ready timeout.
    pub async fn wait_ready(&self) -> Result<(), BridgeError> {
        self.status.wait_ready(self.config.ready_timeout).await
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.status.subscribe()
    }

    /// Start probing the worker. A failed probe marks the worker dead, then
    /// runs `on_dead`.
    pub fn monitor<F>(&self, on_dead: F) -> LivenessMonitor
    where
        F: FnOnce(DeadReason) + Send + 'static,
    {
        let status = Arc::clone(&self.status);
        let instance = self.instance;
        LivenessMonitor::spawn(
            Arc::clone(&self.dispatcher),
            self.config.liveness,
            move |reason| {
                if status.mark_dead() {
                    tracing::warn!(%instance, %reason, "Worker marked dead by liveness probe");
                }
                on_dead(reason);
            },
        )
    }

    /// Close the channel, fail outstanding calls and reap the worker process.
    pub async fn shutdown(mut self) {
        tracing::info!(instance = %self.instance, "Shutting down bridge");
        self.shutdown.cancel();

        // Dropping the writer closes the worker's input.
        if let Some(writer) = self.writer.take() {
            writer.abort();
            let _ = writer.await;
        }
        if let Some(event_loop) = self.event_loop.take()
            && let Err(e) = event_loop.await
            && e.is_panic()
        {
            tracing::error!(instance = %self.instance, error = %e, "Event loop panicked");
        }
        if let Some(process) = self.process.take() {
            process.stop(STOP_GRACE).await;
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}
