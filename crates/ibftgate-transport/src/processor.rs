//! Collaborator interfaces: request processing and transaction audit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ibftgate_core::{ConnectionId, CorrelationId, ResponseCode};
use ibftgate_pool::{PoolError, PoolManager};

/// Failure reported by a [`RequestProcessor`]
///
/// Never terminates the connection; the handler answers with a synthesized
/// envelope carrying [`ProcessingError::response_code`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// Request could not be parsed or failed validation
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Request exceeded the configured maximum size
    #[error("Request of {size} bytes exceeds limit of {limit} bytes")]
    Oversized {
        /// Received size
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// Pool selection or connection acquisition failed
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Downstream system failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Processing exceeded the processing timeout
    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),

    /// The processor panicked
    #[error("Processor panicked: {0}")]
    Panicked(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessingError {
    /// Create a malformed-request error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Response code sent to the client
    #[must_use]
    pub const fn response_code(&self) -> ResponseCode {
        match self {
            Self::Malformed(_) | Self::Oversized { .. } => ResponseCode::FormatError,
            Self::Pool(_) | Self::Backend(_) => ResponseCode::BackendUnavailable,
            Self::Timeout(_) => ResponseCode::ResponseTooLate,
            Self::Panicked(_) | Self::Internal(_) => ResponseCode::SystemMalfunction,
        }
    }
}

/// Per-request context handed to the processor
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id generated for this request
    pub correlation_id: CorrelationId,
    /// Connection the request arrived on
    pub connection_id: ConnectionId,
    /// Remote address of the client
    pub client_id: String,
    /// Time the request was read
    pub received_at: DateTime<Utc>,
    /// Database pools
    pub pools: Arc<PoolManager>,
}

/// Business logic invoked once per inbound message
///
/// Implementations should finish well inside the processing timeout; the
/// handler enforces it as a backstop and catches panics.
#[async_trait]
pub trait RequestProcessor: Send + Sync + std::fmt::Debug {
    /// Produce the response bytes for one request
    ///
    /// An empty response is replaced by a system-malfunction envelope.
    async fn process(&self, payload: Bytes, ctx: &RequestContext) -> Result<Bytes, ProcessingError>;
}

/// One completed exchange, as seen by the audit sink
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Correlation id
    pub correlation_id: CorrelationId,
    /// Connection id
    pub connection_id: ConnectionId,
    /// Remote address of the client
    pub client_id: String,
    /// Request bytes
    pub request: Bytes,
    /// Response bytes actually sent
    pub response: Bytes,
    /// Time from read to response ready
    pub elapsed: Duration,
    /// Whether the processor produced the response
    pub success: bool,
    /// Code of the synthesized envelope, if one was sent
    pub response_code: Option<ResponseCode>,
}

/// Fire-and-forget transaction audit
///
/// Records are handed over after each response is sent and delivered in
/// order on the blocking pool by an [`AuditDispatcher`](crate::AuditDispatcher).
/// An implementation may block; its failures and panics never reach the
/// connection.
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    /// Record one exchange
    fn record_transaction(&self, record: &AuditRecord);
}

/// Audit sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record_transaction(&self, _record: &AuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_response_codes() {
        assert_eq!(
            ProcessingError::malformed("bad").response_code(),
            ResponseCode::FormatError
        );
        assert_eq!(
            ProcessingError::Oversized { size: 10, limit: 5 }.response_code(),
            ResponseCode::FormatError
        );
        assert_eq!(
            ProcessingError::from(PoolError::NotInitialized).response_code(),
            ResponseCode::BackendUnavailable
        );
        assert_eq!(
            ProcessingError::Timeout(Duration::from_secs(1)).response_code(),
            ResponseCode::ResponseTooLate
        );
        assert_eq!(
            ProcessingError::Panicked("boom".into()).response_code(),
            ResponseCode::SystemMalfunction
        );
    }

    #[test]
    fn test_no_error_maps_to_success() {
        for err in [
            ProcessingError::malformed("x"),
            ProcessingError::backend("x"),
            ProcessingError::internal("x"),
        ] {
            assert!(!err.response_code().is_success());
        }
    }
}
