//! Reference worker: the non-cryptographic capabilities, enough to exercise
//! the bridge end to end. Everything else is answered with an error.

use std::path::PathBuf;

use async_trait::async_trait;
use cirrus_bridge::{Operation, ProgressSender, RequestId, WorkerHandler};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

pub const ENV_DATA_DIR: &str = "CIRRUS_DATA_DIR";

pub struct ReferenceWorker {
    data_dir: PathBuf,
}

impl ReferenceWorker {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// `CIRRUS_DATA_DIR`, or `cirrus` under the system temp directory.
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("cirrus"));
        Self::new(data_dir)
    }

    async fn data_dir(&self) -> Result<Value, Value> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| io_error("create data dir", &self.data_dir.display().to_string(), e))?;
        Ok(json!(self.data_dir.display().to_string()))
    }
}

#[async_trait]
impl WorkerHandler for ReferenceWorker {
    async fn handle(
        &self,
        id: RequestId,
        operation: Operation,
        _progress: ProgressSender,
    ) -> Result<Value, Value> {
        match operation {
            Operation::Ping => Ok(json!("pong")),
            Operation::Uuidv4 => Ok(json!(uuid::Uuid::new_v4().to_string())),
            Operation::GenerateRandomString { char_length } => {
                Ok(json!(random_string(char_length as usize)))
            }
            Operation::GetDataDir => self.data_dir().await,
            Operation::AppendFileToFile { first, second } => {
                append_file_to_file(&first, &second).await
            }
            other => {
                tracing::debug!(id, operation = other.tag(), "Unsupported operation");
                Err(json!({
                    "code": "unsupported",
                    "message": format!("operation {} is not supported by this worker", other.tag()),
                }))
            }
        }
    }
}

/// Uniformly random `[A-Za-z0-9]` string.
fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Append the contents of `second` to `first`, creating `first` if needed.
async fn append_file_to_file(first: &str, second: &str) -> Result<Value, Value> {
    let contents = tokio::fs::read(second)
        .await
        .map_err(|e| io_error("read", second, e))?;
    let mut target = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(first)
        .await
        .map_err(|e| io_error("open", first, e))?;
    target
        .write_all(&contents)
        .await
        .map_err(|e| io_error("write", first, e))?;
    target.flush().await.map_err(|e| io_error("flush", first, e))?;
    Ok(json!(true))
}

fn io_error(action: &str, path: &str, e: std::io::Error) -> Value {
    json!({
        "code": "io",
        "message": format!("failed to {} {}: {}", action, path, e),
    })
}
