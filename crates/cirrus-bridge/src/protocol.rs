//! Wire protocol types for host-worker communication.
//!
//! Outbound (host → worker): one flat JSON object per call,
//! `{"id": N, "type": "<operation>", ...fields}`.
//!
//! Inbound (worker → host), classified by [`InboundMessage::classify`]:
//! - the bare string `"ready"`
//! - `{"nodeError": true, "err": ...}` worker-level fault notice
//! - `{"type": "uploadProgress" | "downloadProgress", ...}` broadcast
//! - `{"id": N, "err"?: ..., "response"?: ...}` correlated result

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation id linking a request to its response.
pub type RequestId = u64;

/// Sentinel sent by the worker once it accepts requests.
pub const READY_SENTINEL: &str = "ready";

/// Key marking a worker process-level fault notice.
pub const FAULT_MARKER: &str = "nodeError";

/// Unique identifier for one worker process instance.
///
/// Only used to tell instances apart in logs after a host restarts its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerInstanceId(uuid::Uuid);

impl WorkerInstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for WorkerInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output format for HEIC conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

/// Parameters for password-based key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDerivation {
    pub password: String,
    pub salt: String,
    pub iterations: u32,
    pub hash: String,
    pub bit_length: u32,
    pub return_hex: bool,
}

/// One chunk of a local file to encrypt and upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkUpload {
    pub path: String,
    pub key: String,
    pub query_params: String,
    pub chunk_index: u64,
    pub chunk_size: u64,
}

/// One chunk of a remote file to download, decrypt and write to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDownload {
    pub dest_path: String,
    pub uuid: String,
    pub region: String,
    pub bucket: String,
    pub index: u64,
    pub key: String,
    pub version: u32,
}

/// Key pair returned by `generateKeypair`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keypair {
    pub public_key: String,
    pub private_key: String,
}

/// Worker capabilities. The variant name is the wire `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    EncryptData {
        base64: String,
        key: String,
    },
    DecryptData {
        base64: String,
        key: String,
        version: u32,
    },
    DownloadAndDecryptChunk {
        url: String,
        timeout: u64,
        key: String,
        version: u32,
    },
    DeriveKeyFromPassword(KeyDerivation),
    EncryptMetadata {
        data: String,
        key: String,
    },
    DecryptMetadata {
        data: String,
        key: String,
    },
    EncryptMetadataPublicKey {
        data: String,
        public_key: String,
    },
    DecryptMetadataPrivateKey {
        data: String,
        private_key: String,
    },
    GenerateKeypair,
    HashPassword {
        #[serde(rename = "string")]
        password: String,
    },
    HashFn {
        string: String,
    },
    ApiRequest {
        method: String,
        url: String,
        timeout: u64,
        data: Value,
    },
    EncryptAndUploadChunk {
        base64: String,
        key: String,
        url: String,
        timeout: u64,
    },
    EncryptAndUploadFileChunk(FileChunkUpload),
    UploadAvatar {
        base64: String,
        url: String,
        timeout: u64,
    },
    DownloadDecryptAndWriteFileChunk(ChunkDownload),
    GetFileHash {
        path: String,
        hash_name: String,
    },
    ConvertHeic {
        input: String,
        output: String,
        format: ImageFormat,
    },
    GenerateRandomString {
        char_length: u32,
    },
    Uuidv4,
    Ping,
    GetDataDir,
    AppendFileToFile {
        first: String,
        second: String,
    },
}

impl Operation {
    /// Wire tag of this operation.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::EncryptData { .. } => "encryptData",
            Self::DecryptData { .. } => "decryptData",
            Self::DownloadAndDecryptChunk { .. } => "downloadAndDecryptChunk",
            Self::DeriveKeyFromPassword(_) => "deriveKeyFromPassword",
            Self::EncryptMetadata { .. } => "encryptMetadata",
            Self::DecryptMetadata { .. } => "decryptMetadata",
            Self::EncryptMetadataPublicKey { .. } => "encryptMetadataPublicKey",
            Self::DecryptMetadataPrivateKey { .. } => "decryptMetadataPrivateKey",
            Self::GenerateKeypair => "generateKeypair",
            Self::HashPassword { .. } => "hashPassword",
            Self::HashFn { .. } => "hashFn",
            Self::ApiRequest { .. } => "apiRequest",
            Self::EncryptAndUploadChunk { .. } => "encryptAndUploadChunk",
            Self::EncryptAndUploadFileChunk(_) => "encryptAndUploadFileChunk",
            Self::UploadAvatar { .. } => "uploadAvatar",
            Self::DownloadDecryptAndWriteFileChunk(_) => "downloadDecryptAndWriteFileChunk",
            Self::GetFileHash { .. } => "getFileHash",
            Self::ConvertHeic { .. } => "convertHeic",
            Self::GenerateRandomString { .. } => "generateRandomString",
            Self::Uuidv4 => "uuidv4",
            Self::Ping => "ping",
            Self::GetDataDir => "getDataDir",
            Self::AppendFileToFile { .. } => "appendFileToFile",
        }
    }
}

/// A request as it goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(flatten)]
    pub operation: Operation,
}

/// Error payload reported by the worker for one request.
///
/// Kept as raw JSON: the worker decides its error shape.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerError {
    pub payload: Value,
}

impl WorkerError {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl std::error::Error for WorkerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressKind {
    Upload,
    Download,
}

impl ProgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "uploadProgress",
            Self::Download => "downloadProgress",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "uploadProgress" => Some(Self::Upload),
            "downloadProgress" => Some(Self::Download),
            _ => None,
        }
    }
}

/// Out-of-band progress notification, fanned out to every listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    /// The full message as sent by the worker, `type` included.
    pub payload: Value,
}

/// Classified worker → host message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Ready,
    Fault {
        error: Value,
    },
    Progress(ProgressEvent),
    Reply {
        id: RequestId,
        outcome: Result<Value, WorkerError>,
    },
    /// Nothing to correlate against (no integer `id`).
    Unroutable(Value),
}

impl InboundMessage {
    /// Classify a raw message. Checks run in a fixed order: ready sentinel,
    /// fault marker, progress broadcast, correlated reply.
    pub fn classify(message: Value) -> Self {
        let mut fields = match message {
            Value::String(ref s) if s == READY_SENTINEL => return Self::Ready,
            Value::Object(fields) => fields,
            other => return Self::Unroutable(other),
        };

        if fields.contains_key(FAULT_MARKER) {
            let error = fields.remove("err").unwrap_or(Value::Null);
            return Self::Fault { error };
        }

        if let Some(kind) = fields
            .get("type")
            .and_then(Value::as_str)
            .and_then(ProgressKind::from_tag)
        {
            return Self::Progress(ProgressEvent {
                kind,
                payload: Value::Object(fields),
            });
        }

        let Some(id) = fields.get("id").and_then(Value::as_u64) else {
            return Self::Unroutable(Value::Object(fields));
        };

        let outcome = match fields.remove("err") {
            Some(err) if is_truthy(&err) => Err(WorkerError::new(err)),
            _ => Ok(fields.remove("response").unwrap_or(Value::Null)),
        };

        Self::Reply { id, outcome }
    }

    /// Encode for the wire (worker side).
    pub fn into_value(self) -> Value {
        match self {
            Self::Ready => Value::String(READY_SENTINEL.to_string()),
            Self::Fault { error } => {
                let mut fields = Map::new();
                fields.insert(FAULT_MARKER.to_string(), Value::Bool(true));
                fields.insert("err".to_string(), error);
                Value::Object(fields)
            }
            Self::Progress(event) => match event.payload {
                Value::Object(mut fields) => {
                    fields.insert(
                        "type".to_string(),
                        Value::String(event.kind.as_str().to_string()),
                    );
                    Value::Object(fields)
                }
                other => serde_json::json!({ "type": event.kind.as_str(), "data": other }),
            },
            Self::Reply { id, outcome } => match outcome {
                Ok(response) => serde_json::json!({ "id": id, "response": response }),
                Err(error) => serde_json::json!({ "id": id, "err": error.payload }),
            },
            Self::Unroutable(value) => value,
        }
    }
}

/// Whether a worker `err` field counts as an error.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encrypt_data_request_serializes() {
        let req = Request {
            id: 7,
            operation: Operation::EncryptData {
                base64: "aGVsbG8=".to_string(),
                key: "k".to_string(),
            },
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": 7,
          "type": "encryptData",
          "base64": "aGVsbG8=",
          "key": "k"
        }
        "#);
    }

    #[test]
    fn hash_password_uses_string_field() {
        let req = Request {
            id: 1,
            operation: Operation::HashPassword {
                password: "hunter2".to_string(),
            },
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": 1,
          "type": "hashPassword",
          "string": "hunter2"
        }
        "#);
    }

    #[test]
    fn file_chunk_download_request_serializes_camel_case() {
        let req = Request {
            id: 3,
            operation: Operation::DownloadDecryptAndWriteFileChunk(ChunkDownload {
                dest_path: "/tmp/out.part".to_string(),
                uuid: "f00d".to_string(),
                region: "de-1".to_string(),
                bucket: "b1".to_string(),
                index: 4,
                key: "k".to_string(),
                version: 2,
            }),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": 3,
          "type": "downloadDecryptAndWriteFileChunk",
          "destPath": "/tmp/out.part",
          "uuid": "f00d",
          "region": "de-1",
          "bucket": "b1",
          "index": 4,
          "key": "k",
          "version": 2
        }
        "#);
    }

    #[test]
    fn unit_operations_carry_only_the_tag() {
        let value = serde_json::to_value(Request {
            id: 9,
            operation: Operation::Uuidv4,
        })
        .unwrap();
        assert_eq!(value, json!({"id": 9, "type": "uuidv4"}));
    }

    #[test]
    fn convert_heic_format_is_uppercase() {
        let value = serde_json::to_value(Operation::ConvertHeic {
            input: "a.heic".to_string(),
            output: "a.jpg".to_string(),
            format: ImageFormat::Jpeg,
        })
        .unwrap();
        assert_eq!(value["format"], json!("JPEG"));
        assert_eq!(value["type"], json!("convertHeic"));
    }

    #[test]
    fn request_parses_on_worker_side() {
        let raw = json!({"id": 12, "type": "getFileHash", "path": "/a.txt", "hashName": "sha256"});
        let req: Request = serde_json::from_value(raw).unwrap();
        assert_eq!(req.id, 12);
        assert_eq!(
            req.operation,
            Operation::GetFileHash {
                path: "/a.txt".to_string(),
                hash_name: "sha256".to_string(),
            }
        );
        assert_eq!(req.operation.tag(), "getFileHash");
    }

    #[test]
    fn tag_matches_serialized_type() {
        let ops = [
            Operation::GenerateKeypair,
            Operation::Ping,
            Operation::GetDataDir,
            Operation::GenerateRandomString { char_length: 32 },
            Operation::EncryptMetadataPublicKey {
                data: "d".to_string(),
                public_key: "p".to_string(),
            },
        ];
        for op in ops {
            let value = serde_json::to_value(&op).unwrap();
            assert_eq!(value["type"], json!(op.tag()));
        }
    }

    #[test]
    fn classify_ready_sentinel() {
        assert_eq!(InboundMessage::classify(json!("ready")), InboundMessage::Ready);
    }

    #[test]
    fn classify_fault_notice() {
        let msg = InboundMessage::classify(json!({"nodeError": true, "err": "EPIPE"}));
        assert_eq!(
            msg,
            InboundMessage::Fault {
                error: json!("EPIPE")
            }
        );
    }

    #[test]
    fn classify_fault_wins_over_id() {
        let msg = InboundMessage::classify(json!({"nodeError": true, "id": 4, "err": "boom"}));
        assert!(matches!(msg, InboundMessage::Fault { .. }));
    }

    #[test]
    fn classify_progress_keeps_full_payload() {
        let raw = json!({"type": "uploadProgress", "data": {"uuid": "u1", "bytes": 1024}});
        match InboundMessage::classify(raw.clone()) {
            InboundMessage::Progress(event) => {
                assert_eq!(event.kind, ProgressKind::Upload);
                assert_eq!(event.payload, raw);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn classify_unknown_type_falls_through_to_reply() {
        let msg = InboundMessage::classify(json!({"type": "somethingElse", "id": 5, "response": 1}));
        assert_eq!(
            msg,
            InboundMessage::Reply {
                id: 5,
                outcome: Ok(json!(1))
            }
        );
    }

    #[test]
    fn classify_reply_success_and_error() {
        assert_eq!(
            InboundMessage::classify(json!({"id": 2, "response": "3f2504e0"})),
            InboundMessage::Reply {
                id: 2,
                outcome: Ok(json!("3f2504e0"))
            }
        );
        assert_eq!(
            InboundMessage::classify(json!({"id": 2, "err": {"code": "ENOENT"}})),
            InboundMessage::Reply {
                id: 2,
                outcome: Err(WorkerError::new(json!({"code": "ENOENT"})))
            }
        );
    }

    #[test]
    fn classify_falsy_err_is_success() {
        for err in [json!(null), json!(false), json!(""), json!(0)] {
            let msg = InboundMessage::classify(json!({"id": 1, "err": err, "response": true}));
            assert_eq!(
                msg,
                InboundMessage::Reply {
                    id: 1,
                    outcome: Ok(json!(true))
                }
            );
        }
    }

    #[test]
    fn classify_missing_id_is_unroutable() {
        assert!(matches!(
            InboundMessage::classify(json!({"response": 1})),
            InboundMessage::Unroutable(_)
        ));
        assert!(matches!(
            InboundMessage::classify(json!({"id": "abc", "response": 1})),
            InboundMessage::Unroutable(_)
        ));
        assert!(matches!(
            InboundMessage::classify(json!(42)),
            InboundMessage::Unroutable(_)
        ));
    }

    #[test]
    fn outbound_worker_messages_classify_back() {
        let messages = [
            InboundMessage::Ready,
            InboundMessage::Fault {
                error: json!("crashed"),
            },
            InboundMessage::Reply {
                id: 8,
                outcome: Err(WorkerError::new("bad key")),
            },
        ];
        for msg in messages {
            assert_eq!(InboundMessage::classify(msg.clone().into_value()), msg);
        }
    }

    #[test]
    fn worker_error_display() {
        assert_eq!(WorkerError::new("bad key").to_string(), "bad key");
        assert_eq!(
            WorkerError::new(json!({"code": 1})).to_string(),
            r#"{"code":1}"#
        );
    }
}
