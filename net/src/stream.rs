//! # Stream Transport
//!
//! Request/response RPC over a raw bidirectional stream: one stream, one
//! request frame, one response frame. Ordering within a call is therefore
//! structural; across calls there are no guarantees.
//!
//! ## Outbound
//!
//! Each call walks `Connecting → (Fallback?) → Writing → ReadingResponse`,
//! with an independent deadline per phase — a slow connect does not eat the
//! read budget. Transport failures (I/O, timeout, codec) retry with
//! exponential backoff up to the configured budget; a response carrying a
//! non-OK status is the remote's final answer and is surfaced as an
//! application error without burning a retry. Protocol ID selection and the
//! one-shot qualified→original fallback are delegated to the
//! [`Negotiator`], which also learns from every outcome.
//!
//! ## Inbound
//!
//! A per-protocol semaphore is acquired before the handler runs; saturation
//! resets the stream instead of queuing. The connection limiter is checked
//! before any frame is read. Handler panics are caught at the invocation
//! boundary and turned into an error response — an inbound stream can never
//! take the node down.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::{self, MAX_FRAME_SIZE};
use crate::error::{status_code, NetError};
use crate::gate::InflightGate;
use crate::gossip::panic_message;
use crate::negotiate::Negotiator;
use crate::ratelimit::ConnectionLimiter;
use crate::registry::ProtocolRegistry;
use crate::substrate::{BoxStream, Connectedness, HostTransport, InboundStreamHandler, PeerId};
use crate::wire::{read_frame, write_frame, Envelope, FrameType, ResponseStatus, StreamRequest, StreamResponse};

/// Per-call transport options. Unset fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub connect_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub backoff_factor: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedOptions {
    connect_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    backoff_factor: f64,
}

/// RPC transport built on the host's raw streams.
pub struct StreamTransport {
    host: Arc<dyn HostTransport>,
    negotiator: Arc<Negotiator>,
    gate: Arc<InflightGate>,
    registry: Arc<ProtocolRegistry>,
    conn_limiter: Arc<ConnectionLimiter>,
    defaults: ResolvedOptions,
}

impl StreamTransport {
    pub fn new(
        host: Arc<dyn HostTransport>,
        negotiator: Arc<Negotiator>,
        gate: Arc<InflightGate>,
        registry: Arc<ProtocolRegistry>,
        conn_limiter: Arc<ConnectionLimiter>,
        cfg: &config::NetworkConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            negotiator,
            gate,
            registry,
            conn_limiter,
            defaults: ResolvedOptions {
                connect_timeout: cfg.connect_timeout,
                write_timeout: cfg.write_timeout,
                read_timeout: cfg.read_timeout,
                max_retries: cfg.max_retries,
                retry_delay: cfg.retry_delay,
                backoff_factor: cfg.backoff_factor,
            },
        })
    }

    fn resolve(&self, opts: &CallOptions) -> ResolvedOptions {
        ResolvedOptions {
            connect_timeout: opts.connect_timeout.unwrap_or(self.defaults.connect_timeout),
            write_timeout: opts.write_timeout.unwrap_or(self.defaults.write_timeout),
            read_timeout: opts.read_timeout.unwrap_or(self.defaults.read_timeout),
            max_retries: opts.max_retries.unwrap_or(self.defaults.max_retries),
            retry_delay: opts.retry_delay.unwrap_or(self.defaults.retry_delay),
            backoff_factor: opts.backoff_factor.unwrap_or(self.defaults.backoff_factor),
        }
    }

    /// Call `peer` on the given protocol with one request payload, returning
    /// the response payload.
    ///
    /// `original` and `qualified` are the two forms of the protocol ID; with
    /// no namespace configured they are the same string and no negotiation
    /// happens.
    pub async fn call(
        &self,
        peer: &PeerId,
        original: &str,
        qualified: &str,
        payload: Bytes,
        opts: CallOptions,
    ) -> Result<Bytes, NetError> {
        let opts = self.resolve(&opts);
        let mut attempt: u32 = 0;

        loop {
            match self.attempt_call(peer, original, qualified, &payload, &opts).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < opts.max_retries => {
                    let delay = backoff_delay(opts.retry_delay, opts.backoff_factor, attempt);
                    debug!(
                        peer = %peer,
                        protocol = qualified,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "call attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_call(
        &self,
        peer: &PeerId,
        original: &str,
        qualified: &str,
        payload: &Bytes,
        opts: &ResolvedOptions,
    ) -> Result<Bytes, NetError> {
        // Connecting: dial only when the substrate says we are not connected.
        if self.host.connectedness(peer) != Connectedness::Connected {
            timeout(opts.connect_timeout, self.host.dial(peer))
                .await
                .map_err(|_| NetError::Timeout {
                    phase: "connect",
                    timeout: opts.connect_timeout,
                })??;
        }

        // Stream open with negotiated ID, one-shot fallback when permitted.
        let selection = self.negotiator.select(peer, original, qualified);
        let negotiated = original != qualified;
        let (mut stream, used_id, fell_back) = match timeout(
            opts.connect_timeout,
            self.host.open_stream(peer, &selection.primary),
        )
        .await
        {
            Ok(Ok(stream)) => (stream, selection.primary.clone(), false),
            Ok(Err(primary_err)) => match &selection.fallback {
                Some(fallback_id) => {
                    trace!(
                        peer = %peer,
                        primary = %selection.primary,
                        fallback = %fallback_id,
                        error = %primary_err,
                        "primary protocol refused, trying fallback"
                    );
                    let stream = timeout(opts.connect_timeout, self.host.open_stream(peer, fallback_id))
                        .await
                        .map_err(|_| NetError::Timeout {
                            phase: "open-stream",
                            timeout: opts.connect_timeout,
                        })??;
                    (stream, fallback_id.clone(), true)
                }
                None => return Err(primary_err),
            },
            Err(_) => {
                return Err(NetError::Timeout {
                    phase: "open-stream",
                    timeout: opts.connect_timeout,
                })
            }
        };
        if negotiated {
            self.negotiator
                .record_result(peer, used_id == qualified, fell_back);
        }

        // Writing: one request frame, then half-close the write side.
        let request = StreamRequest::new(Envelope::new(used_id.clone(), payload.to_vec()));
        let request_bytes = request.encode()?;
        timeout(opts.write_timeout, async {
            write_frame(&mut stream, FrameType::Request, &request_bytes, MAX_FRAME_SIZE).await?;
            stream.shutdown().await?;
            Ok::<(), NetError>(())
        })
        .await
        .map_err(|_| NetError::Timeout {
            phase: "write",
            timeout: opts.write_timeout,
        })??;

        // ReadingResponse: exactly one response frame.
        let (frame_type, frame_payload) = timeout(opts.read_timeout, read_frame(&mut stream, MAX_FRAME_SIZE))
            .await
            .map_err(|_| NetError::Timeout {
                phase: "read",
                timeout: opts.read_timeout,
            })??;
        if frame_type != FrameType::Response {
            return Err(NetError::Protocol(format!(
                "expected response frame, got {:?}",
                frame_type
            )));
        }

        let response = StreamResponse::decode(&frame_payload)?;
        if response.id != request.id {
            return Err(NetError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            )));
        }

        match response.status {
            ResponseStatus::Ok => {
                let envelope = response.envelope.ok_or_else(|| {
                    NetError::Protocol("ok response missing envelope".to_string())
                })?;
                Ok(Bytes::from(envelope.payload))
            }
            // The remote made a decision; retrying would not change it.
            ResponseStatus::Error { code, message } => Err(NetError::Application { code, message }),
        }
    }

    /// Build the inbound handler the facade installs on the substrate for
    /// one protocol ID. Each inbound stream is limiter-checked, gated, read,
    /// dispatched, and answered — all failure paths reply or reset and then
    /// drop the stream.
    pub fn make_inbound_handler(self: &Arc<Self>, protocol: &str) -> InboundStreamHandler {
        let transport = Arc::clone(self);
        let protocol = protocol.to_string();
        Arc::new(move |peer, stream| {
            let transport = Arc::clone(&transport);
            let protocol = protocol.clone();
            async move {
                transport.serve_stream(peer, &protocol, stream).await;
            }
            .boxed()
        })
    }

    async fn serve_stream(&self, peer: PeerId, protocol: &str, mut stream: BoxStream) {
        if let Err(e) = self.conn_limiter.check_connection(&peer) {
            debug!(peer = %peer, protocol, error = %e, "inbound stream rejected by connection limiter");
            return;
        }

        // Saturation resets the stream: dropping it on return is the reset.
        let permit = match self.gate.acquire(protocol, self.defaults.read_timeout).await {
            Ok(permit) => permit,
            Err(e) => {
                debug!(peer = %peer, protocol, error = %e, "inbound stream reset, gate saturated");
                self.conn_limiter.remove_connection(&peer);
                return;
            }
        };

        let outcome = self.process_stream(&peer, protocol, &mut stream).await;
        if let Err(e) = outcome {
            debug!(peer = %peer, protocol, error = %e, "inbound stream failed");
        }

        drop(permit);
        self.conn_limiter.remove_connection(&peer);
    }

    async fn process_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
        stream: &mut BoxStream,
    ) -> Result<(), NetError> {
        let read_deadline = self.defaults.read_timeout;
        let (frame_type, frame_payload) = timeout(read_deadline, read_frame(stream, MAX_FRAME_SIZE))
            .await
            .map_err(|_| NetError::Timeout {
                phase: "read-request",
                timeout: read_deadline,
            })??;
        if frame_type != FrameType::Request {
            return Err(NetError::Protocol(format!(
                "expected request frame, got {:?}",
                frame_type
            )));
        }

        let reply = match StreamRequest::decode(&frame_payload) {
            Ok(request) => self.invoke_handler(peer, protocol, request).await,
            Err(e) => StreamResponse::error(String::new(), status_code::BAD_REQUEST, e.to_string()),
        };

        let response_bytes = reply.encode()?;
        timeout(self.defaults.write_timeout, async {
            write_frame(stream, FrameType::Response, &response_bytes, MAX_FRAME_SIZE).await?;
            stream.shutdown().await?;
            Ok::<(), NetError>(())
        })
        .await
        .map_err(|_| NetError::Timeout {
            phase: "write-response",
            timeout: self.defaults.write_timeout,
        })??;

        Ok(())
    }

    async fn invoke_handler(
        &self,
        peer: &PeerId,
        protocol: &str,
        request: StreamRequest,
    ) -> StreamResponse {
        let handler = match self.registry.get(protocol) {
            Some(h) => h,
            None => {
                return StreamResponse::error(
                    request.id,
                    status_code::UNKNOWN_PROTOCOL,
                    format!("no handler for {}", protocol),
                )
            }
        };

        let fut = handler(peer.clone(), Bytes::from(request.envelope.payload));
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(response_payload)) => StreamResponse::ok(
                request.id,
                Envelope::new(protocol.to_string(), response_payload.to_vec()),
            ),
            Ok(Err(e)) => {
                let code = match &e {
                    NetError::Application { code, .. } => *code,
                    _ => status_code::HANDLER_ERROR,
                };
                StreamResponse::error(request.id, code, e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic);
                warn!(peer = %peer, protocol, %reason, "protocol handler panicked");
                StreamResponse::error(request.id, status_code::HANDLER_PANIC, reason)
            }
        }
    }
}

/// `delay * factor^attempt`, saturating instead of overflowing for large
/// attempt counts.
fn backoff_delay(base: Duration, factor: f64, attempt: u32) -> Duration {
    let multiplier = factor.max(1.0).powi(attempt.min(16) as i32);
    base.mul_f64(multiplier)
}
