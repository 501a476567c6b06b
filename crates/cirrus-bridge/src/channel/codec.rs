//! Framed JSON codec for the worker channel.
//!
//! Length prefix (4 bytes, big endian) via LengthDelimitedCodec, JSON body via
//! serde_json. Works over any AsyncRead/AsyncWrite (pipes, duplex streams).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size are logged at info level.
const LARGE_FRAME_BYTES: usize = 100_000;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        tracing::trace!(frame_bytes = bytes.len(), "Decoding frame");
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(frame_bytes = json_len, "Encoding frame");
        if json_len > LARGE_FRAME_BYTES {
            // Chunk uploads carry whole base64 payloads.
            tracing::info!(
                frame_bytes = json_len,
                frame_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn frames_preserve_order() {
        let mut codec = JsonCodec::<Value>::new();
        let mut buf = BytesMut::new();

        codec.encode(json!("ready"), &mut buf).unwrap();
        codec.encode(json!({"id": 1, "response": "a"}), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!("ready")));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(json!({"id": 1, "response": "a"}))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Value>::new();
        let mut full = BytesMut::new();
        codec.encode(json!({"id": 2}), &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 2);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(json!({"id": 2})));
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut codec = JsonCodec::<Value>::new();
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"{not json"), &mut buf).unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut small = JsonCodec::<Value>::with_max_frame_length(8);
        let mut buf = BytesMut::new();
        let err = small
            .encode(json!({"base64": "aaaaaaaaaaaaaaaa"}), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
