//! Worker child process: stdin carries requests, stdout carries replies.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns `program args...` with piped stdin/stdout and inherited stderr.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// A running worker process whose pipes were handed to the channel.
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    /// Spawn and detach the stdio pipes.
    pub fn start(
        spawner: &dyn WorkerSpawner,
    ) -> Result<(Self, ChildStdout, ChildStdin), SpawnError> {
        let mut child = spawner.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        tracing::info!(pid = ?child.id(), "Spawned worker process");
        Ok((Self { child }, stdout, stdin))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit after its stdin closed, killing it once
    /// `grace` has elapsed.
    pub async fn stop(mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Worker process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for worker process");
            }
            Err(_) => {
                tracing::warn!(?grace, "Worker did not exit in time, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill worker process");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_spawner_builder() {
        let spawner = CommandSpawner::new("cirrus-host")
            .arg("worker")
            .env("CIRRUS_LOG", "debug");
        assert_eq!(spawner.program, OsString::from("cirrus-host"));
        assert_eq!(spawner.args, vec![OsString::from("worker")]);
        assert_eq!(
            spawner.env,
            vec![(OsString::from("CIRRUS_LOG"), OsString::from("debug"))]
        );
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/cirrus-worker-binary");
        let result = WorkerProcess::start(&spawner);
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }
}
