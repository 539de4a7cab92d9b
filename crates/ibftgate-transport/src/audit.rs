//! Background delivery of audit records.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::processor::{AuditRecord, AuditSink};

/// Hands audit records to an [`AuditSink`] off the handler's path
///
/// Records travel over an unbounded channel to one delivery task, which calls
/// the sink on the blocking pool one record at a time. Order is preserved; a
/// slow, blocking or panicking sink never delays a connection.
#[derive(Debug, Clone)]
pub struct AuditDispatcher {
    sender: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditDispatcher {
    /// Start the delivery task for `sink`
    ///
    /// Must be called within a Tokio runtime. The task ends once every clone
    /// of the dispatcher is dropped and the queue is empty.
    pub fn spawn(sink: Arc<dyn AuditSink>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(deliver(sink, receiver));
        Self { sender }
    }

    /// Queue one record; never blocks
    pub fn submit(&self, record: AuditRecord) {
        if let Err(mpsc::error::SendError(record)) = self.sender.send(record) {
            warn!(correlation_id = %record.correlation_id, "Audit delivery stopped; record dropped");
        }
    }
}

async fn deliver(sink: Arc<dyn AuditSink>, mut receiver: mpsc::UnboundedReceiver<AuditRecord>) {
    while let Some(record) = receiver.recv().await {
        let sink = Arc::clone(&sink);
        let correlation_id = record.correlation_id.clone();
        match tokio::task::spawn_blocking(move || sink.record_transaction(&record)).await {
            Ok(()) => trace!(correlation_id = %correlation_id, "Audit record delivered"),
            Err(e) if e.is_panic() => {
                warn!(correlation_id = %correlation_id, "Audit sink panicked");
            }
            Err(e) => warn!(correlation_id = %correlation_id, error = %e, "Audit delivery failed"),
        }
    }
    trace!("Audit delivery task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ibftgate_core::{ConnectionId, CorrelationId};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Debug, Default)]
    struct Collecting(Mutex<Vec<String>>);

    impl AuditSink for Collecting {
        fn record_transaction(&self, record: &AuditRecord) {
            std::thread::sleep(Duration::from_millis(20));
            self.0.lock().unwrap().push(record.client_id.clone());
        }
    }

    fn record(client: &str) -> AuditRecord {
        AuditRecord {
            correlation_id: CorrelationId::new(),
            connection_id: ConnectionId::new(1),
            client_id: client.to_string(),
            request: Bytes::from_static(b"req"),
            response: Bytes::from_static(b"resp"),
            elapsed: Duration::from_millis(1),
            success: true,
            response_code: None,
        }
    }

    #[tokio::test]
    async fn test_submit_does_not_wait_for_sink() {
        let sink = Arc::new(Collecting::default());
        let dispatcher = AuditDispatcher::spawn(sink.clone());

        let started = Instant::now();
        for client in ["a", "b", "c"] {
            dispatcher.submit(record(client));
        }
        assert!(started.elapsed() < Duration::from_millis(20));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.0.lock().unwrap().len() < 3 {
            assert!(Instant::now() < deadline, "records not delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*sink.0.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
