//! Request dispatcher: the typed façade over the worker's capabilities.
//!
//! Every operation allocates a request id, registers a pending entry in the
//! correlation table and queues the request on the channel, all before
//! returning. The returned [`Completion`] resolves once the router sees the
//! matching reply.

use std::future::Future;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cache::{MemoCache, file_hash_key};
use crate::channel::ChannelSender;
use crate::correlation::{CallResult, CorrelationTable};
use crate::error::CallError;
use crate::health::WorkerStatus;
use crate::protocol::{
    ChunkDownload, FileChunkUpload, ImageFormat, KeyDerivation, Keypair, Operation, Request,
    RequestId,
};

pub const DEFAULT_RANDOM_STRING_LENGTH: u32 = 32;

/// A dispatched call, shareable between every caller waiting on it.
#[derive(Clone)]
pub(crate) struct SharedCall {
    id: Option<RequestId>,
    future: Shared<BoxFuture<'static, CallResult>>,
}

impl SharedCall {
    fn pending(id: RequestId, receiver: tokio::sync::oneshot::Receiver<CallResult>) -> Self {
        let future = async move { receiver.await.unwrap_or(Err(CallError::Dropped)) };
        Self {
            id: Some(id),
            future: future.boxed().shared(),
        }
    }

    pub(crate) fn ready(id: Option<RequestId>, result: CallResult) -> Self {
        Self {
            id,
            future: futures::future::ready(result).boxed().shared(),
        }
    }

    pub(crate) fn id(&self) -> Option<RequestId> {
        self.id
    }
}

/// Completion handle for one call. Resolves exactly once.
///
/// `T` is the shape the worker's `response` is decoded into.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    call: SharedCall,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Completion<T> {
    fn new(call: SharedCall) -> Self {
        Self {
            call,
            _marker: PhantomData,
        }
    }

    /// Request id on the wire; `None` when the call resolved locally without
    /// contacting the worker.
    pub fn request_id(&self) -> Option<RequestId> {
        self.call.id()
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self::new(self.call.clone())
    }
}

impl<T: DeserializeOwned> Future for Completion<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.call.future).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => Poll::Ready(result.and_then(|value| {
                serde_json::from_value(value).map_err(|e| CallError::Decode(e.to_string()))
            })),
        }
    }
}

/// Name of the first required string field that is empty, if any.
fn missing_required(operation: &Operation) -> Option<&'static str> {
    match operation {
        Operation::EncryptData { base64, .. } | Operation::DecryptData { base64, .. }
            if base64.is_empty() =>
        {
            Some("base64")
        }
        Operation::EncryptMetadata { data, .. }
        | Operation::DecryptMetadata { data, .. }
        | Operation::EncryptMetadataPublicKey { data, .. }
        | Operation::DecryptMetadataPrivateKey { data, .. }
            if data.is_empty() =>
        {
            Some("data")
        }
        _ => None,
    }
}

pub struct Dispatcher {
    next_id: AtomicU64,
    table: Arc<CorrelationTable>,
    sender: ChannelSender,
    status: Arc<WorkerStatus>,
    call_timeout: Option<Duration>,
    password_hashes: MemoCache<String>,
    string_hashes: MemoCache<String>,
    file_hashes: MemoCache<(String, String)>,
    data_dir: MemoCache<()>,
}

impl Dispatcher {
    pub fn new(
        sender: ChannelSender,
        table: Arc<CorrelationTable>,
        status: Arc<WorkerStatus>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            table,
            sender,
            status,
            call_timeout,
            password_hashes: MemoCache::new("hashPassword"),
            string_hashes: MemoCache::new("hashFn"),
            file_hashes: MemoCache::new("getFileHash"),
            data_dir: MemoCache::new("getDataDir"),
        }
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// Most recently allocated request id (0 before the first call).
    pub fn last_issued_id(&self) -> RequestId {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Dispatch any operation, applying the same validation and memoization
    /// as the typed methods.
    pub fn call(&self, operation: Operation) -> Completion<Value> {
        Completion::new(self.route(operation))
    }

    fn typed<T>(&self, operation: Operation) -> Completion<T> {
        Completion::new(self.route(operation))
    }

    fn route(&self, operation: Operation) -> SharedCall {
        match operation {
            Operation::HashPassword { password } => self
                .password_hashes
                .get_or_dispatch(password.clone(), || {
                    self.submit(Operation::HashPassword { password })
                }),
            Operation::HashFn { string } => self
                .string_hashes
                .get_or_dispatch(string.clone(), || self.submit(Operation::HashFn { string })),
            Operation::GetFileHash { path, hash_name } => self.file_hashes.get_or_dispatch(
                file_hash_key(&path, &hash_name),
                || self.submit(Operation::GetFileHash { path, hash_name }),
            ),
            Operation::GetDataDir => self
                .data_dir
                .get_or_dispatch((), || self.submit(Operation::GetDataDir)),
            other => self.submit(other),
        }
    }

    fn allocate_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn submit(&self, operation: Operation) -> SharedCall {
        // The id is consumed even when validation short-circuits below.
        let id = self.allocate_id();
        if let Some(field) = missing_required(&operation) {
            tracing::debug!(
                id,
                operation = operation.tag(),
                field,
                "Required field empty, resolving with default"
            );
            return SharedCall::ready(None, Ok(Value::String(String::new())));
        }
        self.dispatch(id, operation)
    }

    fn dispatch(&self, id: RequestId, operation: Operation) -> SharedCall {
        let tag = operation.tag();
        if self.status.current().is_dead() {
            tracing::debug!(id, operation = tag, "Worker is dead, rejecting call");
            return SharedCall::ready(None, Err(CallError::WorkerGone));
        }
        let receiver = match self.table.register(id, tag) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::error!(id, operation = tag, error = %e, "Failed to register call");
                return SharedCall::ready(Some(id), Err(e.into()));
            }
        };
        // The worker may have died between the check above and registering;
        // its fail-all pass runs after the state flips, so re-check here.
        if self.status.current().is_dead() {
            self.table.fail(id, CallError::WorkerGone);
            return SharedCall::pending(id, receiver);
        }

        let message = match serde_json::to_value(Request { id, operation }) {
            Ok(message) => message,
            Err(e) => {
                self.table
                    .fail(id, CallError::Transport(format!("failed to encode request: {}", e)));
                return SharedCall::pending(id, receiver);
            }
        };

        self.arm_deadline(id);

        match self.sender.send(message) {
            Ok(()) => tracing::debug!(id, operation = tag, "Dispatched call"),
            Err(e) => {
                tracing::warn!(id, operation = tag, error = %e, "Failed to send call");
                self.table.fail(id, CallError::Transport(e.to_string()));
            }
        }

        SharedCall::pending(id, receiver)
    }

    fn arm_deadline(&self, id: RequestId) {
        let Some(after) = self.call_timeout else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id, "No async runtime, call deadline not armed");
            return;
        };
        let table = Arc::clone(&self.table);
        let deadline = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if table.fail(id, CallError::Timeout { id, after }) {
                tracing::warn!(id, ?after, "Call timed out");
            }
        });
        self.table.attach_deadline(id, deadline.abort_handle());
    }

    pub fn encrypt_data(
        &self,
        base64: impl Into<String>,
        key: impl Into<String>,
    ) -> Completion<String> {
        self.typed(Operation::EncryptData {
            base64: base64.into(),
            key: key.into(),
        })
    }

    pub fn decrypt_data(
        &self,
        base64: impl Into<String>,
        key: impl Into<String>,
        version: u32,
    ) -> Completion<String> {
        self.typed(Operation::DecryptData {
            base64: base64.into(),
            key: key.into(),
            version,
        })
    }

    pub fn download_and_decrypt_chunk(
        &self,
        url: impl Into<String>,
        timeout: u64,
        key: impl Into<String>,
        version: u32,
    ) -> Completion<String> {
        self.typed(Operation::DownloadAndDecryptChunk {
            url: url.into(),
            timeout,
            key: key.into(),
            version,
        })
    }

    pub fn derive_key_from_password(&self, params: KeyDerivation) -> Completion<String> {
        self.typed(Operation::DeriveKeyFromPassword(params))
    }

    pub fn encrypt_metadata(
        &self,
        data: impl Into<String>,
        key: impl Into<String>,
    ) -> Completion<String> {
        self.typed(Operation::EncryptMetadata {
            data: data.into(),
            key: key.into(),
        })
    }

    pub fn decrypt_metadata(
        &self,
        data: impl Into<String>,
        key: impl Into<String>,
    ) -> Completion<String> {
        self.typed(Operation::DecryptMetadata {
            data: data.into(),
            key: key.into(),
        })
    }

    pub fn encrypt_metadata_public_key(
        &self,
        data: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Completion<String> {
        self.typed(Operation::EncryptMetadataPublicKey {
            data: data.into(),
            public_key: public_key.into(),
        })
    }

    pub fn decrypt_metadata_private_key(
        &self,
        data: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Completion<String> {
        self.typed(Operation::DecryptMetadataPrivateKey {
            data: data.into(),
            private_key: private_key.into(),
        })
    }

    pub fn generate_keypair(&self) -> Completion<Keypair> {
        self.typed(Operation::GenerateKeypair)
    }

    /// Memoized by password.
    pub fn hash_password(&self, password: impl Into<String>) -> Completion<String> {
        self.typed(Operation::HashPassword {
            password: password.into(),
        })
    }

    /// Memoized by input string.
    pub fn hash_fn(&self, string: impl Into<String>) -> Completion<String> {
        self.typed(Operation::HashFn {
            string: string.into(),
        })
    }

    pub fn api_request(
        &self,
        method: impl Into<String>,
        url: impl Into<String>,
        timeout: u64,
        data: Value,
    ) -> Completion<Value> {
        self.typed(Operation::ApiRequest {
            method: method.into(),
            url: url.into(),
            timeout,
            data,
        })
    }

    pub fn encrypt_and_upload_chunk(
        &self,
        base64: impl Into<String>,
        key: impl Into<String>,
        url: impl Into<String>,
        timeout: u64,
    ) -> Completion<Value> {
        self.typed(Operation::EncryptAndUploadChunk {
            base64: base64.into(),
            key: key.into(),
            url: url.into(),
            timeout,
        })
    }

    pub fn encrypt_and_upload_file_chunk(&self, chunk: FileChunkUpload) -> Completion<Value> {
        self.typed(Operation::EncryptAndUploadFileChunk(chunk))
    }

    pub fn upload_avatar(
        &self,
        base64: impl Into<String>,
        url: impl Into<String>,
        timeout: u64,
    ) -> Completion<Value> {
        self.typed(Operation::UploadAvatar {
            base64: base64.into(),
            url: url.into(),
            timeout,
        })
    }

    /// Resolves with the path the chunk was written to.
    pub fn download_decrypt_and_write_file_chunk(
        &self,
        chunk: ChunkDownload,
    ) -> Completion<String> {
        self.typed(Operation::DownloadDecryptAndWriteFileChunk(chunk))
    }

    /// Memoized by `(path, hash_name)`.
    pub fn get_file_hash(
        &self,
        path: impl Into<String>,
        hash_name: impl Into<String>,
    ) -> Completion<String> {
        self.typed(Operation::GetFileHash {
            path: path.into(),
            hash_name: hash_name.into(),
        })
    }

    pub fn convert_heic(
        &self,
        input: impl Into<String>,
        output: impl Into<String>,
        format: ImageFormat,
    ) -> Completion<String> {
        self.typed(Operation::ConvertHeic {
            input: input.into(),
            output: output.into(),
            format,
        })
    }

    pub fn generate_random_string(&self, char_length: Option<u32>) -> Completion<String> {
        self.typed(Operation::GenerateRandomString {
            char_length: char_length.unwrap_or(DEFAULT_RANDOM_STRING_LENGTH),
        })
    }

    pub fn uuidv4(&self) -> Completion<String> {
        self.typed(Operation::Uuidv4)
    }

    pub fn ping(&self) -> Completion<Value> {
        self.typed(Operation::Ping)
    }

    /// Memoized; the worker is asked at most once.
    pub fn get_data_dir(&self) -> Completion<PathBuf> {
        self.typed(Operation::GetDataDir)
    }

    /// Append the bytes of `second` to `first`.
    pub fn append_file_to_file(
        &self,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> Completion<bool> {
        self.typed(Operation::AppendFileToFile {
            first: first.into(),
            second: second.into(),
        })
    }
}
