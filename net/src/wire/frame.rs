//! # Frame Codec
//!
//! Encodes and decodes the fixed-layout frame every Arclight stream speaks:
//!
//! ```text
//! magic(2B) | version(1B) | type(1B) | length(4B, big-endian) | payload
//! ```
//!
//! The decoder rejects mismatched magic or version and any length above the
//! configured cap before allocating a byte for the payload. Those are
//! protocol errors — fatal to the stream, never retried. The encoder
//! enforces the same cap so both sides of the wire share one limit and the
//! protocol cannot drift between them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{FRAME_MAGIC, WIRE_VERSION};
use crate::error::NetError;

/// Header size on the wire.
pub const HEADER_LEN: usize = 8;

/// Closed set of frame types. Decided once at decode time; downstream code
/// matches on the variant and never re-inspects bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// One RPC request envelope.
    Request = 0x01,
    /// One RPC response envelope.
    Response = 0x02,
    /// Keepalive, no payload semantics.
    Heartbeat = 0x03,
    /// Reserved for large-transfer chunking.
    Chunk = 0x04,
}

impl FrameType {
    fn from_wire(b: u8) -> Result<Self, NetError> {
        match b {
            0x01 => Ok(FrameType::Request),
            0x02 => Ok(FrameType::Response),
            0x03 => Ok(FrameType::Heartbeat),
            0x04 => Ok(FrameType::Chunk),
            other => Err(NetError::Protocol(format!("unknown frame type 0x{:02x}", other))),
        }
    }
}

/// Write one frame: header, then payload, then flush.
///
/// The caller decides when to half-close the stream — a single-request RPC
/// shuts the write side down right after this returns.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame_type: FrameType,
    payload: &[u8],
    max_size: usize,
) -> Result<(), NetError> {
    if payload.len() > max_size {
        return Err(NetError::FrameTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header[0] = FRAME_MAGIC[0];
    header[1] = FRAME_MAGIC[1];
    header[2] = WIRE_VERSION;
    header[3] = frame_type as u8;
    header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame, validating magic, version, and length before the payload
/// allocation.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_size: usize,
) -> Result<(FrameType, Vec<u8>), NetError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;

    if header[0..2] != FRAME_MAGIC {
        return Err(NetError::Protocol(format!(
            "bad frame magic 0x{:02x}{:02x}",
            header[0], header[1]
        )));
    }
    if header[2] != WIRE_VERSION {
        return Err(NetError::Protocol(format!(
            "unsupported wire version {} (ours is {})",
            header[2], WIRE_VERSION
        )));
    }
    let frame_type = FrameType::from_wire(header[3])?;

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > max_size {
        return Err(NetError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((frame_type, payload))
}
