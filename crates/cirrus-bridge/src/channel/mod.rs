//! Channel transport between host and worker.
//!
//! An ordered, duplex pipe of opaque JSON messages. The channel knows nothing
//! about requests or responses; correlation lives in [`crate::correlation`].
//!
//! - **codec**: length-prefixed JSON framing
//! - **process**: spawning the worker as a child process over stdin/stdout

pub mod codec;
pub mod process;

use std::io;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use self::codec::JsonCodec;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

/// Sending half. Cheap to clone; sends never block.
///
/// Messages are queued and written by a single writer task, so the order of
/// `send` calls is the order on the wire.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelSender {
    pub(crate) fn from_unbounded(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: Value) -> Result<(), ChannelError> {
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Receiving half.
pub struct ChannelReceiver {
    reader: FramedRead<BoxedReader, JsonCodec<Value>>,
    write_failed: CancellationToken,
}

impl ChannelReceiver {
    /// Next message, `None` once the peer closed its end.
    ///
    /// A failed write on the sending half surfaces here as an error: the peer
    /// will never see what was queued, so the channel is unusable.
    pub async fn recv(&mut self) -> Option<io::Result<Value>> {
        tokio::select! {
            biased;

            message = self.reader.next() => message,
            _ = self.write_failed.cancelled() => Some(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to peer failed",
            ))),
        }
    }
}

/// Frame `reader`/`writer` and start the writer task.
///
/// The writer task exits when every [`ChannelSender`] is dropped or a write
/// fails. A failed write also ends the receiving half.
pub fn open<R, W>(
    reader: R,
    writer: W,
    max_frame_length: usize,
) -> (ChannelSender, ChannelReceiver, JoinHandle<()>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let reader: BoxedReader = Box::new(reader);
    let reader = FramedRead::new(
        reader,
        JsonCodec::<Value>::with_max_frame_length(max_frame_length),
    );
    let mut writer = FramedWrite::new(
        writer,
        JsonCodec::<Value>::with_max_frame_length(max_frame_length),
    );

    let write_failed = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn({
        let write_failed = write_failed.clone();
        async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = writer.send(message).await {
                    tracing::error!(error = %e, "Failed to write to worker channel");
                    write_failed.cancel();
                    break;
                }
            }
            tracing::trace!("Channel writer exiting");
        }
    });

    (
        ChannelSender::from_unbounded(tx),
        ChannelReceiver {
            reader,
            write_failed,
        },
        writer_task,
    )
}
