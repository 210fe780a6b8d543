//! # Wire Layer
//!
//! The two units everything on the network reduces to:
//!
//! ```text
//! frame.rs    — the byte-level unit on a raw stream: fixed 8-byte header
//!               (magic, version, type, length) plus payload
//! envelope.rs — the logical unit inside a frame or mesh message: routing
//!               metadata around an opaque payload, plus the RPC
//!               request/response wrappers with status
//! ```
//!
//! One frame carries exactly one serialized envelope (wrapped in a
//! request/response record on RPC streams). Payload bytes are never
//! interpreted here — opacity is preserved end to end.

pub mod envelope;
pub mod frame;

pub use envelope::{
    CompressionHint, Encoding, Envelope, ResponseStatus, StreamRequest, StreamResponse,
};
pub use frame::{read_frame, write_frame, FrameType};
