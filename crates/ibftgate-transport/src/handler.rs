//! Per-connection receive, dispatch and respond loop.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use ibftgate_core::{CorrelationId, ResponseCode, ResponseEnvelope};
use ibftgate_pool::PoolManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::audit::AuditDispatcher;
use crate::connection::{ConnectionSettings, ConnectionShared, HandlerState};
use crate::metrics::ExchangeMetrics;
use crate::outcome::{DisconnectReason, IoOutcome};
use crate::processor::{AuditRecord, ProcessingError, RequestContext, RequestProcessor};

/// Collaborators shared by every handler
#[derive(Debug, Clone)]
pub struct HandlerServices {
    /// Business logic
    pub processor: Arc<dyn RequestProcessor>,
    /// Transaction audit, delivered off the connection's path
    pub audit: AuditDispatcher,
    /// Database pools
    pub pools: Arc<PoolManager>,
    /// Exchange metrics
    pub metrics: Arc<ExchangeMetrics>,
}

/// Owner of one accepted socket
///
/// Requests on a connection are handled strictly one after another. One
/// successful read is one request.
pub struct ConnectionHandler {
    stream: TcpStream,
    shared: Arc<ConnectionShared>,
    settings: ConnectionSettings,
    services: HandlerServices,
    buffer: Vec<u8>,
    last_activity: Instant,
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.shared.id())
            .field("remote", &self.shared.remote())
            .field("state", &self.shared.state())
            .field("requests", &self.shared.requests())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandler {
    /// Wrap an accepted socket
    ///
    /// Enables no-delay and keep-alive and applies the buffer sizes. Socket
    /// option failures are logged; the connection is still served.
    pub fn new(
        stream: TcpStream,
        shared: Arc<ConnectionShared>,
        settings: ConnectionSettings,
        services: HandlerServices,
    ) -> Self {
        configure_socket(&stream, &settings);
        // one extra byte detects an oversized read
        let buffer = vec![0u8; settings.max_request_size.saturating_add(1)];
        Self {
            stream,
            shared,
            settings,
            services,
            buffer,
            last_activity: Instant::now(),
        }
    }

    /// Shared state of this connection
    pub fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    /// Serve the connection until it ends, then dispose it
    pub async fn run(mut self) -> DisconnectReason {
        let span = info_span!(
            "connection",
            connection_id = %self.shared.id(),
            remote = %self.shared.remote()
        );
        async move {
            let reason = self.serve().await;
            self.disconnect(reason).await;
            reason
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self) -> DisconnectReason {
        debug!("Connection handler started");
        loop {
            if self.shared.is_disposed() {
                return DisconnectReason::Disposed;
            }

            self.shared.set_state(HandlerState::Receiving);
            let token = self.shared.token().clone();
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => return DisconnectReason::Cancelled,
                outcome = self.receive() => outcome,
            };

            let payload = match outcome {
                IoOutcome::Ok(payload) => payload,
                IoOutcome::Timeout => return DisconnectReason::IdleTimeout,
                other => {
                    if let IoOutcome::Reset(e) | IoOutcome::Other(e) = &other {
                        debug!(error = %e, "Receive failed");
                    }
                    return other
                        .disconnect_reason()
                        .unwrap_or(DisconnectReason::TransportError);
                }
            };

            if let Some(reason) = self.exchange(payload).await {
                return reason;
            }
        }
    }

    /// Wait for the next request
    ///
    /// Each read is bounded by the connection timeout. A read timeout only
    /// ends the connection once the idle timeout since the last exchange has
    /// also passed; then [`IoOutcome::Timeout`] is returned.
    async fn receive(&mut self) -> IoOutcome<Bytes> {
        loop {
            let idle = self.last_activity.elapsed();
            let Some(remaining) = self.settings.idle_timeout.checked_sub(idle) else {
                return IoOutcome::Timeout;
            };
            if remaining.is_zero() {
                return IoOutcome::Timeout;
            }
            let wait = remaining.min(self.settings.connection_timeout);

            match tokio::time::timeout(wait, self.stream.read(&mut self.buffer)).await {
                Ok(Ok(0)) => return IoOutcome::PeerClosed,
                Ok(Ok(n)) => {
                    self.last_activity = Instant::now();
                    return IoOutcome::Ok(Bytes::copy_from_slice(&self.buffer[..n]));
                }
                Ok(Err(e)) => return IoOutcome::from_error(e),
                Err(_) => trace!(?wait, "Receive wait elapsed"),
            }
        }
    }

    /// Process one request and write its response
    ///
    /// Returns a reason when the connection must end.
    async fn exchange(&mut self, payload: Bytes) -> Option<DisconnectReason> {
        let started = Instant::now();
        let correlation_id = CorrelationId::new();
        let size = payload.len();
        self.shared.record_request();
        let _in_flight = self.services.metrics.record_request_start(size);
        trace!(correlation_id = %correlation_id, size, "Request received");

        let ctx = RequestContext {
            correlation_id: correlation_id.clone(),
            connection_id: self.shared.id(),
            client_id: self.shared.remote().to_string(),
            received_at: Utc::now(),
            pools: Arc::clone(&self.services.pools),
        };

        self.shared.set_state(HandlerState::Processing);
        let result = if size > self.settings.max_request_size {
            self.services
                .metrics
                .oversized_requests
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(ProcessingError::Oversized {
                size,
                limit: self.settings.max_request_size,
            })
        } else {
            match self.dispatch(payload.clone(), &ctx).await {
                Some(result) => result,
                None => {
                    let elapsed = started.elapsed();
                    self.services.metrics.record_request_end(false, elapsed);
                    info!(correlation_id = %correlation_id, "In-flight request abandoned at shutdown");
                    return Some(DisconnectReason::Cancelled);
                }
            }
        };

        let (response, code) = match result {
            Ok(bytes) if !bytes.is_empty() => (bytes, None),
            Ok(_) => {
                warn!(correlation_id = %correlation_id, "Processor returned an empty response");
                synthesize(&correlation_id, ResponseCode::SystemMalfunction)
            }
            Err(e) => {
                let code = e.response_code();
                warn!(
                    correlation_id = %correlation_id,
                    response_code = %code,
                    error = %e,
                    "Request failed"
                );
                synthesize(&correlation_id, code)
            }
        };
        let elapsed = started.elapsed();
        let success = code.is_none();
        self.services.metrics.record_request_end(success, elapsed);

        self.shared.set_state(HandlerState::Responding);
        match self.send(&response).await {
            IoOutcome::Ok(()) => {
                self.last_activity = Instant::now();
                self.services.metrics.record_bytes_sent(response.len());
            }
            other => {
                if let IoOutcome::Reset(e) | IoOutcome::Other(e) = &other {
                    debug!(error = %e, "Send failed");
                }
                return Some(
                    other
                        .disconnect_reason()
                        .unwrap_or(DisconnectReason::TransportError),
                );
            }
        }

        self.services.audit.submit(AuditRecord {
            correlation_id,
            connection_id: self.shared.id(),
            client_id: ctx.client_id,
            request: payload,
            response,
            elapsed,
            success,
            response_code: code,
        });
        None
    }

    /// Run the processor with the processing timeout, catching panics
    ///
    /// Returns `None` if shutdown began and the request did not finish within
    /// the drain grace period.
    async fn dispatch(
        &self,
        payload: Bytes,
        ctx: &RequestContext,
    ) -> Option<Result<Bytes, ProcessingError>> {
        let limit = self.settings.processing_timeout;
        let work = AssertUnwindSafe(self.services.processor.process(payload, ctx)).catch_unwind();
        let work = tokio::time::timeout(limit, work);
        tokio::pin!(work);

        let token = self.shared.token();
        let finished = tokio::select! {
            biased;
            finished = &mut work => finished,
            () = token.cancelled() => {
                debug!(grace = ?self.settings.drain_grace, "Shutdown during processing; waiting for grace period");
                tokio::time::timeout(self.settings.drain_grace, &mut work).await.ok()?
            }
        };

        Some(match finished {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => {
                self.services
                    .metrics
                    .processor_panics
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(ProcessingError::Panicked(panic_message(&*payload)))
            }
            Err(_) => {
                self.services
                    .metrics
                    .processing_timeouts
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(ProcessingError::Timeout(limit))
            }
        })
    }

    async fn send(&mut self, response: &[u8]) -> IoOutcome<()> {
        match tokio::time::timeout(
            self.settings.connection_timeout,
            self.stream.write_all(response),
        )
        .await
        {
            Ok(Ok(())) => IoOutcome::Ok(()),
            Ok(Err(e)) => IoOutcome::from_error(e),
            Err(_) => IoOutcome::Timeout,
        }
    }

    async fn disconnect(&mut self, reason: DisconnectReason) {
        if !self.shared.dispose(reason) {
            trace!(%reason, "Connection already disposed");
            return;
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!(error = %e, "Socket shutdown failed");
        }

        let requests = self.shared.requests();
        match reason {
            DisconnectReason::PeerClosed | DisconnectReason::Cancelled => {
                debug!(%reason, requests, "Connection closed");
            }
            DisconnectReason::IdleTimeout => {
                info!(%reason, requests, idle_timeout = ?self.settings.idle_timeout, "Connection idle; disconnecting");
            }
            _ => warn!(%reason, requests, "Connection terminated"),
        }
    }
}

fn synthesize(correlation_id: &CorrelationId, code: ResponseCode) -> (Bytes, Option<ResponseCode>) {
    let body = ResponseEnvelope::new(correlation_id.clone(), code).to_bytes();
    (Bytes::from(body), Some(code))
}

fn configure_socket(stream: &TcpStream, settings: &ConnectionSettings) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to enable TCP_NODELAY");
    }
    let socket = socket2::SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        debug!(error = %e, "Failed to enable keep-alive");
    }
    if settings.receive_buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(settings.receive_buffer_size) {
            debug!(error = %e, "Failed to set receive buffer size");
        }
    }
    if settings.send_buffer_size > 0 {
        if let Err(e) = socket.set_send_buffer_size(settings.send_buffer_size) {
            debug!(error = %e, "Failed to set send buffer size");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(&*boxed), "kaboom");
        let boxed: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    #[test]
    fn test_synthesized_response_is_not_empty() {
        let (body, code) = synthesize(&CorrelationId::new(), ResponseCode::SystemMalfunction);
        assert!(!body.is_empty());
        assert_eq!(code, Some(ResponseCode::SystemMalfunction));
    }
}
