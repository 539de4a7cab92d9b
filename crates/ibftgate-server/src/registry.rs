//! Registry of live connections.
//!
//! The listener registers each admitted connection before its handler task is
//! spawned. Handlers unregister themselves indirectly: they publish a
//! [`ConnectionEvent::Disconnected`] which the registry's event loop consumes.
//! Removing an entry drops its admission permit, freeing the slot.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ibftgate_core::ConnectionId;
use ibftgate_transport::{ConnectionEvent, ConnectionShared, DisconnectReason, HandlerState};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::admission::AdmissionPermit;
use crate::metrics::ServerMetrics;

#[derive(Debug)]
struct Entry {
    shared: Arc<ConnectionShared>,
    task: OnceLock<AbortHandle>,
    _permit: AdmissionPermit,
}

/// Snapshot of one registered connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: ConnectionId,
    /// Remote address
    pub remote: std::net::SocketAddr,
    /// Handler state
    pub state: HandlerState,
    /// Requests served
    pub requests: u64,
    /// Time since accept
    pub age: std::time::Duration,
}

/// Live connection registry
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Entry>,
    all_closed: Notify,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate the next connection id
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register an admitted connection
    pub fn register(&self, shared: Arc<ConnectionShared>, permit: AdmissionPermit) {
        let id = shared.id();
        self.connections.insert(
            id,
            Entry {
                shared,
                task: OnceLock::new(),
                _permit: permit,
            },
        );
        trace!(connection_id = %id, "Connection registered");
    }

    /// Attach the handler task so it can be aborted on forced disposal
    pub fn attach_task(&self, id: ConnectionId, task: AbortHandle) {
        match self.connections.get(&id) {
            Some(entry) => {
                let _ = entry.task.set(task);
            }
            // handler already finished and was unregistered
            None => trace!(connection_id = %id, "Task attached after unregister"),
        }
    }

    /// Remove a connection; returns whether it was present
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if self.connections.is_empty() {
            self.all_closed.notify_waiters();
        }
        removed
    }

    /// Number of registered connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of registered connections
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| {
                let shared = &entry.value().shared;
                ConnectionInfo {
                    id: shared.id(),
                    remote: shared.remote(),
                    state: shared.state(),
                    requests: shared.requests(),
                    age: shared.age(),
                }
            })
            .collect()
    }

    /// Wait until no connection is registered
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.all_closed.notified();
            tokio::pin!(notified);
            // register interest before checking to avoid a lost wakeup
            notified.as_mut().enable();
            if self.connections.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Dispose every remaining connection and abort its task
    ///
    /// Returns the number of connections this call disposed.
    pub fn force_dispose_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let mut forced = 0;
        for id in ids {
            if let Some((_, entry)) = self.connections.remove(&id) {
                if entry.shared.dispose(DisconnectReason::Forced) {
                    forced += 1;
                }
                if let Some(task) = entry.task.get() {
                    task.abort();
                }
            }
        }
        if self.connections.is_empty() {
            self.all_closed.notify_waiters();
        }
        forced
    }

    /// Consume disconnect events until `stop` is cancelled
    ///
    /// Events already queued when `stop` fires are still counted.
    pub async fn run_events(
        self: Arc<Self>,
        mut events: UnboundedReceiver<ConnectionEvent>,
        metrics: Arc<ServerMetrics>,
        stop: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = stop.cancelled() => {
                    let mut drained = 0usize;
                    while let Ok(event) = events.try_recv() {
                        self.handle_event(event, &metrics);
                        drained += 1;
                    }
                    trace!(drained, "Pending disconnect events drained");
                    break;
                }
                event = events.recv() => event,
            };
            let Some(event) = event else { break };
            self.handle_event(event, &metrics);
        }
        trace!("Registry event loop stopped");
    }

    fn handle_event(&self, event: ConnectionEvent, metrics: &ServerMetrics) {
        match event {
            ConnectionEvent::Disconnected {
                id,
                remote,
                requests,
                reason,
            } => {
                metrics.record_connection_closed(reason);
                let removed = self.unregister(id);
                debug!(
                    connection_id = %id,
                    %remote,
                    requests,
                    %reason,
                    removed,
                    active = self.len(),
                    "Connection unregistered"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionControl;
    use ibftgate_transport::ConnectionEventEmitter;
    use std::time::Duration;

    fn connection(
        registry: &ConnectionRegistry,
        emitter: &ConnectionEventEmitter,
    ) -> Arc<ConnectionShared> {
        ConnectionShared::new(
            registry.next_id(),
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
            emitter.clone(),
        )
    }

    #[tokio::test]
    async fn test_disconnect_event_unregisters_and_frees_slot() {
        let registry = ConnectionRegistry::new();
        let admission = AdmissionControl::new(1);
        let metrics = Arc::new(ServerMetrics::new());
        let (emitter, rx) = ConnectionEventEmitter::new();
        let stop = CancellationToken::new();
        let events = tokio::spawn(Arc::clone(&registry).run_events(rx, Arc::clone(&metrics), stop.clone()));

        let shared = connection(&registry, &emitter);
        registry.register(Arc::clone(&shared), admission.try_admit().unwrap());
        assert_eq!(registry.len(), 1);
        assert!(admission.try_admit().is_none());

        shared.dispose(DisconnectReason::PeerClosed);
        tokio::time::timeout(Duration::from_secs(1), registry.wait_empty())
            .await
            .unwrap();
        assert_eq!(admission.active(), 0);
        assert_eq!(metrics.connections_closed(), 1);

        stop.cancel();
        events.await.unwrap();
    }

    #[tokio::test]
    async fn test_force_dispose_all() {
        let registry = ConnectionRegistry::new();
        let admission = AdmissionControl::new(4);
        let (emitter, _rx) = ConnectionEventEmitter::new();

        let a = connection(&registry, &emitter);
        let b = connection(&registry, &emitter);
        registry.register(Arc::clone(&a), admission.try_admit().unwrap());
        registry.register(Arc::clone(&b), admission.try_admit().unwrap());

        // b already closed itself
        b.dispose(DisconnectReason::PeerClosed);

        assert_eq!(registry.force_dispose_all(), 1);
        assert!(registry.is_empty());
        assert!(a.is_disposed());
        assert_eq!(admission.active(), 0);
        registry.wait_empty().await;
    }

    #[tokio::test]
    async fn test_stop_counts_queued_forced_events() {
        let registry = ConnectionRegistry::new();
        let admission = AdmissionControl::new(4);
        let metrics = Arc::new(ServerMetrics::new());
        let (emitter, rx) = ConnectionEventEmitter::new();

        for _ in 0..2 {
            let shared = connection(&registry, &emitter);
            registry.register(shared, admission.try_admit().unwrap());
        }
        assert_eq!(registry.force_dispose_all(), 2);

        // stop before the loop ever sees the events
        let stop = CancellationToken::new();
        stop.cancel();
        Arc::clone(&registry)
            .run_events(rx, Arc::clone(&metrics), stop)
            .await;

        assert_eq!(metrics.connections_forced.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.connections_closed(), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = ConnectionRegistry::default();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
    }
}
