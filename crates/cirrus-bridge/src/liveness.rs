//! Liveness monitor: periodic ping probe with a bounded wait.
//!
//! The monitor owns one background task. Each round sends `ping` through the
//! dispatcher and waits at most `probe_timeout` for the reply. A reply starts
//! the next round after `interval`; a timeout or a rejected ping reports the
//! worker dead through the callback, once, and ends the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// How long one ping may take before the worker is considered dead.
    pub probe_timeout: Duration,
    /// Pause between a successful ping and the next one.
    pub interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(5),
        }
    }
}

impl LivenessConfig {
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Why the monitor declared the worker dead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeadReason {
    #[error("ping not answered within {0:?}")]
    Timeout(Duration),
    #[error("ping failed: {0}")]
    PingFailed(CallError),
}

/// Handle to a running probe loop. Dropping it stops the loop.
pub struct LivenessMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    /// Start probing. `on_dead` runs at most once, and never after
    /// [`stop`](Self::stop).
    pub fn spawn<F>(dispatcher: Arc<Dispatcher>, config: LivenessConfig, on_dead: F) -> Self
    where
        F: FnOnce(DeadReason) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(probe_loop(dispatcher, config, cancel.clone(), on_dead));
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the probe loop to end (worker dead or monitor stopped).
    pub async fn join(mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(e) = task.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "Liveness monitor panicked");
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn probe_loop<F>(
    dispatcher: Arc<Dispatcher>,
    config: LivenessConfig,
    cancel: CancellationToken,
    on_dead: F,
) where
    F: FnOnce(DeadReason) + Send + 'static,
{
    let mut probes: u64 = 0;
    let reason = loop {
        let ping = dispatcher.ping();
        let id = ping.request_id();
        probes += 1;

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Some(id) = id {
                    dispatcher.table().remove(id);
                }
                tracing::debug!(probes, "Liveness monitor stopped");
                return;
            }

            outcome = tokio::time::timeout(config.probe_timeout, ping) => outcome,
        };

        match outcome {
            Ok(Ok(_)) => {
                tracing::trace!(?id, "Ping answered");
            }
            Ok(Err(error)) => break DeadReason::PingFailed(error),
            Err(_) => {
                if let Some(id) = id {
                    dispatcher.table().fail(
                        id,
                        CallError::Timeout {
                            id,
                            after: config.probe_timeout,
                        },
                    );
                }
                break DeadReason::Timeout(config.probe_timeout);
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(probes, "Liveness monitor stopped");
                return;
            }

            _ = tokio::time::sleep(config.interval) => {}
        }
    };

    // Stopped while the last probe was settling.
    if cancel.is_cancelled() {
        return;
    }
    tracing::error!(probes, reason = %reason, "Worker unresponsive");
    on_dead(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use crate::channel::ChannelSender;
    use crate::correlation::CorrelationTable;
    use crate::health::WorkerStatus;
    use crate::protocol::WorkerError;

    const FAST: LivenessConfig = LivenessConfig {
        probe_timeout: Duration::from_millis(50),
        interval: Duration::from_millis(10),
    };

    #[derive(Clone, Copy)]
    enum Behaviour {
        Answer,
        Ignore,
        Reject,
    }

    /// Dispatcher wired to a fake worker that reacts to pings.
    fn monitored(behaviour: Behaviour) -> (Arc<Dispatcher>, Arc<AtomicUsize>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let table = Arc::new(CorrelationTable::new());
        let dispatcher = Arc::new(Dispatcher::new(
            ChannelSender::from_unbounded(tx),
            Arc::clone(&table),
            Arc::new(WorkerStatus::new()),
            None,
        ));
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Some(id) = message["id"].as_u64() else {
                    continue;
                };
                match behaviour {
                    Behaviour::Answer => {
                        table.complete(id, json!("pong"));
                    }
                    Behaviour::Reject => {
                        table.fail(id, CallError::Worker(WorkerError::new("busy")));
                    }
                    Behaviour::Ignore => {}
                }
            }
        });
        (dispatcher, pings)
    }

    fn recorder() -> (Arc<Mutex<Vec<DeadReason>>>, impl FnOnce(DeadReason) + Send + 'static) {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        (reasons, move |reason| sink.lock().unwrap().push(reason))
    }

    #[tokio::test]
    async fn answered_pings_keep_probing() {
        let (dispatcher, pings) = monitored(Behaviour::Answer);
        let (reasons, on_dead) = recorder();

        let monitor = LivenessMonitor::spawn(Arc::clone(&dispatcher), FAST, on_dead);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(pings.load(Ordering::SeqCst) >= 2);
        assert!(reasons.lock().unwrap().is_empty());
        assert!(!monitor.is_finished());

        monitor.stop();
        monitor.join().await;
        assert!(reasons.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unanswered_ping_reports_dead_once() {
        let (dispatcher, pings) = monitored(Behaviour::Ignore);
        let (reasons, on_dead) = recorder();

        let monitor = LivenessMonitor::spawn(Arc::clone(&dispatcher), FAST, on_dead);
        monitor.join().await;

        assert_eq!(
            *reasons.lock().unwrap(),
            vec![DeadReason::Timeout(FAST.probe_timeout)]
        );
        // The timed-out ping left nothing behind.
        assert!(dispatcher.table().is_empty());

        let sent = pings.load(Ordering::SeqCst);
        assert_eq!(sent, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pings.load(Ordering::SeqCst), sent);
    }

    #[tokio::test]
    async fn rejected_ping_reports_dead() {
        let (dispatcher, _pings) = monitored(Behaviour::Reject);
        let (reasons, on_dead) = recorder();

        LivenessMonitor::spawn(dispatcher, FAST, on_dead).join().await;

        let reasons = reasons.lock().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(matches!(
            &reasons[0],
            DeadReason::PingFailed(CallError::Worker(_))
        ));
    }

    #[tokio::test]
    async fn stopped_monitor_never_reports() {
        let (dispatcher, _pings) = monitored(Behaviour::Ignore);
        let (reasons, on_dead) = recorder();

        let monitor = LivenessMonitor::spawn(Arc::clone(&dispatcher), FAST, on_dead);
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.stop();
        monitor.join().await;

        tokio::time::sleep(FAST.probe_timeout * 2).await;
        assert!(reasons.lock().unwrap().is_empty());
        assert!(dispatcher.table().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_monitor_cancels_it() {
        let (dispatcher, pings) = monitored(Behaviour::Answer);
        let (reasons, on_dead) = recorder();

        drop(LivenessMonitor::spawn(Arc::clone(&dispatcher), FAST, on_dead));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = pings.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pings.load(Ordering::SeqCst), sent);
        assert!(reasons.lock().unwrap().is_empty());
    }

    #[test]
    fn default_config_probes_every_five_seconds() {
        let config = LivenessConfig::default();
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.interval, Duration::from_secs(5));
    }
}
