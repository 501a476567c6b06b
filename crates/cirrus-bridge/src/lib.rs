//! cirrus-bridge: request/response bridge between a storage client host and
//! its background crypto/IO worker.

mod cache;

pub mod bridge;
pub mod channel;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod liveness;
pub mod protocol;
pub mod router;
pub mod worker;

pub use bridge::Bridge;
pub use channel::process::{CommandSpawner, SpawnError, WorkerProcess, WorkerSpawner};
pub use config::{BridgeConfig, ConfigError};
pub use correlation::{CallResult, CorrelationError, CorrelationTable};
pub use dispatcher::{Completion, DEFAULT_RANDOM_STRING_LENGTH, Dispatcher};
pub use error::{BridgeError, CallError};
pub use health::{WorkerState, WorkerStatus};
pub use liveness::{DeadReason, LivenessConfig, LivenessMonitor};
pub use protocol::{
    ChunkDownload, FileChunkUpload, ImageFormat, InboundMessage, KeyDerivation, Keypair,
    Operation, ProgressEvent, ProgressKind, Request, RequestId, WorkerError, WorkerInstanceId,
};
pub use router::{ResponseRouter, RouteOutcome};
pub use worker::{ProgressSender, WorkerHandler, run_stdio_worker, run_worker};
