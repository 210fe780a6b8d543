//! # Error Taxonomy
//!
//! One error enum for the whole networking core, with retryability as a
//! first-class property. The retry loop in the stream transport and every
//! caller share [`NetError::is_retryable`] as the single source of truth —
//! there is no second list of "errors worth retrying" hiding in a match arm
//! somewhere.
//!
//! The taxonomy follows the failure domains:
//!
//! - **Protocol** violations (bad magic, bad version, oversize frame) are
//!   fatal to the current stream and never retried.
//! - **I/O** failures (dial, write, read, reset) and per-phase **timeouts**
//!   are transient; the transport retries them with backoff.
//! - **Codec** failures (envelope encode/decode) are retried — a fresh
//!   attempt gets a fresh stream and a fresh serialization.
//! - **Application** errors came back in a well-formed response; the remote
//!   already made up its mind, retrying would just annoy it.
//! - **Policy** rejections (rate limits, size caps, duplicate registration)
//!   are local decisions and never retried.

use std::time::Duration;

/// Errors produced by the networking core.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The peer sent bytes that violate the wire protocol. Fatal to the
    /// stream they arrived on.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A frame's declared or actual payload length exceeds the cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Envelope or request/response serialization failed.
    #[error("codec failure: {0}")]
    Codec(String),

    /// Transport-level I/O failure: dial, stream open, write, read, reset.
    #[error("i/o failure: {0}")]
    Io(String),

    /// A per-phase deadline expired.
    #[error("timed out after {timeout:?} while {phase}")]
    Timeout {
        phase: &'static str,
        timeout: Duration,
    },

    /// The remote handler processed the request and rejected it. Carries the
    /// remote's status code and message verbatim.
    #[error("application error {code}: {message}")]
    Application { code: u16, message: String },

    /// A local or remote rate/backpressure limit rejected the operation.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// An outbound message exceeds the configured size cap. Pre-flight.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Registering a protocol or topic that is already registered. Returned
    /// at setup time to catch programming errors — never silently overwritten.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// No handler/route for the given protocol or topic.
    #[error("not registered: {0}")]
    NotRegistered(String),

    /// The facade is shutting down; no further work is accepted.
    #[error("network is shutting down")]
    Shutdown,

    /// A user-supplied handler panicked. The panic was caught at the
    /// invocation boundary and the owning task kept running.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

impl NetError {
    /// Whether the stream transport's retry loop may attempt this operation
    /// again. Callers deciding on their own retries should consult this too.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetError::Io(_) | NetError::Timeout { .. } | NetError::Codec(_)
        )
    }

    /// Shorthand for the remote-rejection variant.
    pub fn application(code: u16, message: impl Into<String>) -> Self {
        NetError::Application {
            code,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(e.to_string())
    }
}

impl From<bincode::Error> for NetError {
    fn from(e: bincode::Error) -> Self {
        NetError::Codec(e.to_string())
    }
}

/// Status codes carried in RPC error responses. Kept deliberately small —
/// applications encode their own failure detail in the message string.
pub mod status_code {
    /// Handler returned an error.
    pub const HANDLER_ERROR: u16 = 500;
    /// No handler registered for the requested protocol on this node.
    pub const UNKNOWN_PROTOCOL: u16 = 501;
    /// Handler panicked while processing the request.
    pub const HANDLER_PANIC: u16 = 502;
    /// The request frame failed to decode.
    pub const BAD_REQUEST: u16 = 400;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_split() {
        assert!(NetError::Io("reset".into()).is_retryable());
        assert!(NetError::Timeout {
            phase: "read",
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(NetError::Codec("truncated".into()).is_retryable());

        assert!(!NetError::Protocol("bad magic".into()).is_retryable());
        assert!(!NetError::FrameTooLarge { size: 1, max: 0 }.is_retryable());
        assert!(!NetError::application(500, "nope").is_retryable());
        assert!(!NetError::RateLimited("window".into()).is_retryable());
        assert!(!NetError::DuplicateRegistration("/arc/x/1.0.0".into()).is_retryable());
        assert!(!NetError::Shutdown.is_retryable());
    }

    #[test]
    fn io_error_converts() {
        let e: NetError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(e.is_retryable());
    }
}
