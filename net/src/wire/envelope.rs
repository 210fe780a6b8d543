//! # Envelope & RPC Wrappers
//!
//! The [`Envelope`] is the logical unit exchanged on the wire for both RPC
//! and pubsub: routing metadata wrapped around an opaque payload. The core
//! never interprets payload bytes — applications own their own encoding.
//!
//! RPC adds one thin layer: [`StreamRequest`] pairs an envelope with a
//! request ID, and [`StreamResponse`] echoes that ID back with a status.
//! A non-OK status is a definitive application-level rejection, surfaced to
//! the caller with its code and message and never retried.
//!
//! Serialization is bincode — compact, schemaless, and already the
//! workspace's binary format. The envelope's `encoding` tag describes the
//! *payload*, not the envelope itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{COMPRESSION_HINT_THRESHOLD, ENVELOPE_VERSION};
use crate::error::NetError;

/// How the payload bytes are encoded, as declared by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Application-defined binary. The default.
    Binary,
    /// UTF-8 JSON.
    Json,
}

/// Advisory compression flag.
///
/// Set when the payload crosses [`COMPRESSION_HINT_THRESHOLD`]. This is a
/// hint to transports that can compress, not an on-wire transform — payload
/// bytes pass through this layer untouched either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionHint {
    None,
    Suggested,
}

/// Wire-level wrapper around one opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope schema version.
    pub version: u16,
    /// Protocol ID (RPC) or topic string (pubsub) this payload belongs to.
    pub channel: String,
    /// Opaque application bytes.
    pub payload: Vec<u8>,
    /// Payload encoding tag.
    pub encoding: Encoding,
    /// Advisory compression flag.
    pub compression: CompressionHint,
    /// Correlates request/response pairs and log lines across nodes.
    pub correlation_id: String,
    /// MIME-ish content type, for diagnostics only.
    pub content_type: String,
    /// Sender's clock at creation, Unix milliseconds.
    pub timestamp_ms: u64,
}

impl Envelope {
    /// Wrap payload bytes for the given channel. Sets the compression hint
    /// from the payload size and stamps a fresh correlation ID.
    pub fn new(channel: impl Into<String>, payload: Vec<u8>) -> Self {
        let compression = if payload.len() > COMPRESSION_HINT_THRESHOLD {
            CompressionHint::Suggested
        } else {
            CompressionHint::None
        };
        Self {
            version: ENVELOPE_VERSION,
            channel: channel.into(),
            payload,
            encoding: Encoding::Binary,
            compression,
            correlation_id: Uuid::new_v4().to_string(),
            content_type: "application/octet-stream".to_string(),
            timestamp_ms: unix_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Outcome of a remote handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error { code: u16, message: String },
}

/// One RPC request on a stream: an envelope plus the ID the response must
/// echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub id: String,
    pub envelope: Envelope,
}

impl StreamRequest {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            envelope,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One RPC response on a stream. `envelope` is present on `Ok` and absent
/// on `Error` — an error response carries no payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
    pub id: String,
    pub status: ResponseStatus,
    pub envelope: Option<Envelope>,
}

impl StreamResponse {
    pub fn ok(request_id: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            id: request_id.into(),
            status: ResponseStatus::Ok,
            envelope: Some(envelope),
        }
    }

    pub fn error(request_id: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            id: request_id.into(),
            status: ResponseStatus::Error {
                code,
                message: message.into(),
            },
            envelope: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Current Unix time in milliseconds. Clock-before-epoch maps to zero
/// rather than panicking.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new("/arc/sync/1.0.0", b"blocks please".to_vec());
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn small_payload_gets_no_compression_hint() {
        let env = Envelope::new("arc.consensus.blocks.v1", vec![0u8; 128]);
        assert_eq!(env.compression, CompressionHint::None);
    }

    #[test]
    fn large_payload_gets_compression_hint() {
        let env = Envelope::new(
            "arc.consensus.blocks.v1",
            vec![0u8; COMPRESSION_HINT_THRESHOLD + 1],
        );
        assert_eq!(env.compression, CompressionHint::Suggested);
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = Envelope::new("/arc/ping/1.0.0", Vec::new());
        let b = Envelope::new("/arc/ping/1.0.0", Vec::new());
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn response_echoes_request_id() {
        let req = StreamRequest::new(Envelope::new("/arc/ping/1.0.0", b"ping".to_vec()));
        let resp = StreamResponse::ok(req.id.clone(), Envelope::new("/arc/ping/1.0.0", b"pong".to_vec()));
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.status, ResponseStatus::Ok);
    }

    #[test]
    fn error_response_carries_no_envelope() {
        let resp = StreamResponse::error("req-1", 500, "handler exploded");
        assert!(resp.envelope.is_none());
        match resp.status {
            ResponseStatus::Error { code, ref message } => {
                assert_eq!(code, 500);
                assert_eq!(message, "handler exploded");
            }
            _ => panic!("expected error status"),
        }
    }

    #[test]
    fn garbage_bytes_fail_decode_as_codec_error() {
        let result = Envelope::decode(&[0xFF; 3]);
        assert!(matches!(result, Err(NetError::Codec(_))));
    }
}
