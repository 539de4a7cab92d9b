//! TCP listener: accept loop, admission and graceful shutdown.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ibftgate_core::ListenerConfig;
use ibftgate_pool::PoolManager;
use ibftgate_transport::{
    AuditDispatcher, AuditSink, ConnectionEvent, ConnectionEventEmitter, ConnectionHandler, ConnectionSettings,
    ConnectionShared, HandlerServices, RequestProcessor,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionControl;
use crate::error::{ServerError, ServerResult};
use crate::lifecycle::{ServerLifecycle, ServerState, ShutdownHandle};
use crate::metrics::{GatewayMetricsCollector, ServerMetrics, StatsReporter};
use crate::processor::{AcknowledgeProcessor, TracingAuditSink};
use crate::registry::ConnectionRegistry;

/// Pause after a resource-exhaustion accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// errno values shared by Linux and the BSDs
const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Why the accept loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The shutdown token was cancelled
    Requested,
    /// The listening socket failed
    ListenerFailed(String),
}

/// Final counts reported once shutdown completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// What ended the accept loop
    pub cause: ShutdownCause,
    /// Connections admitted over the listener's lifetime
    pub accepted: u64,
    /// Connections refused at the ceiling
    pub rejected: u64,
    /// Connections still open when draining began
    pub draining: usize,
    /// Of those, connections that closed within the drain window
    pub drained: usize,
    /// Connections forcibly disposed after the drain window
    pub forced: usize,
    /// Pools cleared
    pub pools_cleared: usize,
    /// Time spent shutting down
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Whether every connection closed on its own
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.forced == 0 && matches!(self.cause, ShutdownCause::Requested)
    }
}

/// Builder for [`Listener`]
#[derive(Debug)]
pub struct ListenerBuilder {
    config: ListenerConfig,
    pools: Arc<PoolManager>,
    processor: Arc<dyn RequestProcessor>,
    audit: Arc<dyn AuditSink>,
}

impl ListenerBuilder {
    /// Replace the request processor
    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn RequestProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Replace the audit sink
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Bind the listening socket
    pub async fn bind(self) -> ServerResult<Listener> {
        let target = self.config.bind_target();
        let listener = TcpListener::bind(&target)
            .await
            .map_err(|source| ServerError::Bind {
                addr: target.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let metrics = Arc::new(ServerMetrics::new());
        let (emitter, events) = ConnectionEventEmitter::new();
        let services = HandlerServices {
            processor: self.processor,
            audit: AuditDispatcher::spawn(self.audit),
            pools: self.pools,
            metrics: Arc::clone(&metrics.exchange),
        };

        info!(addr = %local_addr, max_connections = self.config.max_connections, "Listener bound");
        Ok(Listener {
            listener,
            local_addr,
            settings: ConnectionSettings::from(&self.config),
            admission: AdmissionControl::new(self.config.max_connections),
            config: self.config,
            services,
            registry: ConnectionRegistry::new(),
            metrics,
            lifecycle: Arc::new(ServerLifecycle::new()),
            handler_token: CancellationToken::new(),
            emitter,
            events,
        })
    }

    /// Bind and run until `token` is cancelled
    pub async fn start(self, token: CancellationToken) -> ServerResult<ShutdownReport> {
        Ok(self.bind().await?.run(token).await)
    }
}

/// Accepting side of the gateway
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ListenerConfig,
    settings: ConnectionSettings,
    services: HandlerServices,
    admission: Arc<AdmissionControl>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
    lifecycle: Arc<ServerLifecycle>,
    handler_token: CancellationToken,
    emitter: ConnectionEventEmitter,
    events: UnboundedReceiver<ConnectionEvent>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("active", &self.admission.active())
            .field("max_connections", &self.admission.max())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Start building a listener
    ///
    /// Defaults to [`AcknowledgeProcessor`] and [`TracingAuditSink`].
    #[must_use]
    pub fn builder(config: ListenerConfig, pools: Arc<PoolManager>) -> ListenerBuilder {
        ListenerBuilder {
            config,
            pools,
            processor: Arc::new(AcknowledgeProcessor),
            audit: Arc::new(TracingAuditSink),
        }
    }

    /// Bind with the reference collaborators
    pub async fn bind(config: ListenerConfig, pools: Arc<PoolManager>) -> ServerResult<Self> {
        Self::builder(config, pools).bind().await
    }

    /// Address actually bound
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server metrics
    #[must_use]
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Live connection registry
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Admission controller
    #[must_use]
    pub fn admission(&self) -> Arc<AdmissionControl> {
        Arc::clone(&self.admission)
    }

    /// Metrics collector for export
    #[must_use]
    pub fn collector(&self) -> GatewayMetricsCollector {
        GatewayMetricsCollector::new(
            Arc::clone(&self.metrics),
            Arc::clone(&self.admission),
            Arc::clone(&self.services.pools),
        )
    }

    /// Handle that triggers graceful shutdown
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(Arc::clone(&self.lifecycle))
    }

    /// Accept until `token` is cancelled (or the shutdown handle fires, or
    /// the listening socket fails), then shut down gracefully
    pub async fn run(self, token: CancellationToken) -> ShutdownReport {
        self.run_with(token, |listener| listener).await
    }

    /// [`run`](Self::run) over any connection source built from the socket
    async fn run_with<A, F>(self, token: CancellationToken, wrap: F) -> ShutdownReport
    where
        A: Accept,
        F: FnOnce(TcpListener) -> A,
    {
        let Self {
            listener,
            local_addr,
            config,
            settings,
            services,
            admission,
            registry,
            metrics,
            lifecycle,
            handler_token,
            emitter,
            events,
        } = self;

        lifecycle.start().await;
        info!(addr = %local_addr, "Accepting connections");

        let events_stop = CancellationToken::new();
        let events_task = tokio::spawn(Arc::clone(&registry).run_events(
            events,
            Arc::clone(&metrics),
            events_stop.clone(),
        ));

        let collector = GatewayMetricsCollector::new(
            Arc::clone(&metrics),
            Arc::clone(&admission),
            Arc::clone(&services.pools),
        );
        let stats_stop = CancellationToken::new();
        let stats_task = config
            .stats_interval()
            .map(|period| StatsReporter::spawn(collector, period, stats_stop.clone()));

        let source = wrap(listener);
        let acceptor = Acceptor {
            source: &source,
            settings: &settings,
            services: &services,
            admission: &admission,
            registry: &registry,
            metrics: &metrics,
            handler_token: &handler_token,
            emitter: &emitter,
        };
        let cause = acceptor.accept_loop(&token, lifecycle.token()).await;

        // shutdown
        let started = Instant::now();
        lifecycle.set_state(ServerState::Draining).await;
        info!(?cause, "Shutting down");

        // 1. stop accepting
        drop(source);
        debug!("Listening socket closed");

        // 2. stop periodic stats
        stop_task("stats reporter", &stats_stop, stats_task).await;

        // 3. signal handlers; each gets the drain grace for in-flight work
        let draining = registry.len();
        handler_token.cancel();
        info!(connections = draining, grace = ?config.drain_grace(), "Draining connections");

        // 4. wait for handlers, bounded by the drain window
        let window = config.drain_window();
        let forced = if tokio::time::timeout(window, registry.wait_empty())
            .await
            .is_ok()
        {
            0
        } else {
            let forced = registry.force_dispose_all();
            warn!(forced, ?window, "Drain window elapsed; forcibly disposed connections");
            forced
        };

        // 5. clear pools
        let pools_cleared = services.pools.clear_all_pools().await;

        stop_task("registry event loop", &events_stop, Some(events_task)).await;
        lifecycle.set_state(ServerState::Stopped).await;

        // 6. report
        let report = ShutdownReport {
            cause,
            accepted: metrics.connections_accepted(),
            rejected: metrics.connections_rejected(),
            draining,
            drained: draining.saturating_sub(forced),
            forced,
            pools_cleared,
            elapsed: started.elapsed(),
        };
        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            drained = report.drained,
            forced = report.forced,
            pools_cleared = report.pools_cleared,
            elapsed = ?report.elapsed,
            "Shutdown complete"
        );
        report
    }
}

/// Source of inbound connections for the accept loop
trait Accept {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// What the accept loop does after one accept attempt
#[derive(Debug, PartialEq, Eq)]
enum AcceptStep {
    Continue,
    Backoff,
    Fatal(String),
}

/// Borrowed view of the listener used by the accept loop
struct Acceptor<'a, A> {
    source: &'a A,
    settings: &'a ConnectionSettings,
    services: &'a HandlerServices,
    admission: &'a Arc<AdmissionControl>,
    registry: &'a Arc<ConnectionRegistry>,
    metrics: &'a ServerMetrics,
    handler_token: &'a CancellationToken,
    emitter: &'a ConnectionEventEmitter,
}

impl<A: Accept> Acceptor<'_, A> {
    async fn accept_loop(
        &self,
        shutdown: &CancellationToken,
        handle: &CancellationToken,
    ) -> ShutdownCause {
        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => return ShutdownCause::Requested,
                () = handle.cancelled() => return ShutdownCause::Requested,
                accepted = self.source.accept() => accepted,
            };

            match self.handle_accepted(accepted) {
                AcceptStep::Continue => {}
                AcceptStep::Backoff => {
                    tokio::select! {
                        () = shutdown.cancelled() => return ShutdownCause::Requested,
                        () = handle.cancelled() => return ShutdownCause::Requested,
                        () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                AcceptStep::Fatal(reason) => return ShutdownCause::ListenerFailed(reason),
            }
        }
    }

    fn handle_accepted(&self, accepted: io::Result<(TcpStream, SocketAddr)>) -> AcceptStep {
        match accepted {
            Ok((stream, remote)) => {
                self.admit(stream, remote);
                AcceptStep::Continue
            }
            Err(e) if is_resource_exhaustion(&e) => {
                self.metrics.record_accept_error();
                warn!(error = %e, backoff = ?ACCEPT_BACKOFF, "Accept failed: resources exhausted");
                AcceptStep::Backoff
            }
            Err(e) if is_transient(&e) => {
                self.metrics.record_accept_error();
                debug!(error = %e, "Transient accept error");
                AcceptStep::Continue
            }
            Err(e) => {
                error!(error = %e, "Listening socket failed");
                AcceptStep::Fatal(e.to_string())
            }
        }
    }

    fn admit(&self, stream: TcpStream, remote: SocketAddr) {
        let Some(permit) = self.admission.try_admit() else {
            self.metrics.record_connection_rejected();
            warn!(
                %remote,
                max_connections = self.admission.max(),
                "Connection limit reached; rejecting"
            );
            drop(stream);
            return;
        };
        self.metrics.record_connection_accepted();

        let id = self.registry.next_id();
        let shared = ConnectionShared::new(
            id,
            remote,
            self.handler_token.child_token(),
            self.emitter.clone(),
        );
        let handler = ConnectionHandler::new(
            stream,
            Arc::clone(&shared),
            self.settings.clone(),
            self.services.clone(),
        );
        self.registry.register(shared, permit);
        let task = tokio::spawn(handler.run());
        self.registry.attach_task(id, task.abort_handle());

        debug!(connection_id = %id, %remote, active = self.admission.active(), "Connection accepted");
    }
}

async fn stop_task(name: &str, stop: &CancellationToken, task: Option<JoinHandle<()>>) {
    stop.cancel();
    if let Some(task) = task {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(EMFILE | ENFILE | ENOMEM))
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
