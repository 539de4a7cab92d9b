//! Reference collaborators shipped with the binary.
//!
//! Neither carries business rules. Deployments plug their own
//! [`RequestProcessor`] and [`AuditSink`] into the listener builder.

use async_trait::async_trait;
use bytes::Bytes;
use ibftgate_core::{ResponseCode, ResponseEnvelope};
use ibftgate_transport::{AuditRecord, AuditSink, ProcessingError, RequestContext, RequestProcessor};

/// Tracing target for audit records
pub const AUDIT_TARGET: &str = "ibftgate::audit";

/// Acknowledges every well-formed request
///
/// Selects a pool round robin for each request and answers `00` naming it.
/// Empty and non-UTF-8 payloads are rejected as format errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeProcessor;

#[async_trait]
impl RequestProcessor for AcknowledgeProcessor {
    async fn process(&self, payload: Bytes, ctx: &RequestContext) -> Result<Bytes, ProcessingError> {
        if payload.is_empty() {
            return Err(ProcessingError::malformed("empty request"));
        }
        let text = std::str::from_utf8(&payload)
            .map_err(|e| ProcessingError::malformed(format!("request is not UTF-8: {e}")))?;
        if text.trim().is_empty() {
            return Err(ProcessingError::malformed("blank request"));
        }

        let pool = ctx.pools.get_connection(None)?;
        let envelope = ResponseEnvelope::with_message(
            ctx.correlation_id.clone(),
            ResponseCode::Approved,
            format!("Acknowledged {} bytes via {}", payload.len(), pool.name()),
        );
        Ok(Bytes::from(envelope.to_bytes()))
    }
}

/// Writes audit records as structured events on [`AUDIT_TARGET`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_transaction(&self, record: &AuditRecord) {
        tracing::info!(
            target: AUDIT_TARGET,
            correlation_id = %record.correlation_id,
            connection_id = %record.connection_id,
            client_id = %record.client_id,
            request_bytes = record.request.len(),
            response_bytes = record.response.len(),
            elapsed_ms = record.elapsed.as_millis() as u64,
            success = record.success,
            response_code = record.response_code.map(|c| c.code()),
            "transaction"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ibftgate_core::{ConnectionId, CorrelationId, DatabaseConfig};
    use ibftgate_pool::PoolManager;
    use std::sync::Arc;

    fn ctx(pools: Arc<PoolManager>) -> RequestContext {
        RequestContext {
            correlation_id: CorrelationId::from("c0ffee"),
            connection_id: ConnectionId::new(1),
            client_id: "127.0.0.1:9000".to_string(),
            received_at: Utc::now(),
            pools,
        }
    }

    fn lazy_pools(n: usize) -> Arc<PoolManager> {
        let manager = PoolManager::new(DatabaseConfig {
            connection_string: "postgres://ibft@127.0.0.1:1/ibft".into(),
            number_of_pools: n,
            min_pool_size: 0,
            ..DatabaseConfig::default()
        });
        manager.initialize().unwrap();
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_acknowledges_with_pool_name() {
        let ctx = ctx(lazy_pools(2));
        let body = AcknowledgeProcessor
            .process(Bytes::from_static(b"MT103"), &ctx)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["responseCode"], "00");
        assert_eq!(value["correlationId"], "c0ffee");
        assert_eq!(value["responseMessage"], "Acknowledged 5 bytes via pool_1");
    }

    #[tokio::test]
    async fn test_rejects_empty_and_binary() {
        let ctx = ctx(lazy_pools(1));
        let err = AcknowledgeProcessor.process(Bytes::new(), &ctx).await.unwrap_err();
        assert_eq!(err.response_code(), ResponseCode::FormatError);

        let err = AcknowledgeProcessor
            .process(Bytes::from_static(&[0xff, 0xfe]), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.response_code(), ResponseCode::FormatError);
    }

    #[tokio::test]
    async fn test_uninitialized_pools_are_backend_unavailable() {
        let ctx = ctx(Arc::new(PoolManager::new(DatabaseConfig::default())));
        let err = AcknowledgeProcessor
            .process(Bytes::from_static(b"MT103"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.response_code(), ResponseCode::BackendUnavailable);
    }
}
