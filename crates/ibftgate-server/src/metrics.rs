//! Server metrics, export and the periodic stats reporter
//!
//! Connection counters live here; request counters live in the transport's
//! [`ExchangeMetrics`] shared by all handlers. Both are lock-free atomics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ibftgate_pool::PoolManager;
use ibftgate_transport::{DisconnectReason, ExchangeMetrics};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::admission::AdmissionControl;

/// Connection-level counters
#[derive(Debug)]
pub struct ServerMetrics {
    /// Connections admitted
    pub connections_accepted: AtomicU64,
    /// Connections refused at the admission ceiling
    pub connections_rejected: AtomicU64,
    /// Connections that ended, for any reason
    pub connections_closed: AtomicU64,
    /// Connections ended by the idle timeout
    pub connections_idle_closed: AtomicU64,
    /// Connections ended by a socket error
    pub connections_errored: AtomicU64,
    /// Connections forcibly disposed at shutdown
    pub connections_forced: AtomicU64,
    /// Transient accept errors
    pub accept_errors: AtomicU64,
    /// Request/response counters shared with the handlers
    pub exchange: Arc<ExchangeMetrics>,
    /// Server start time for uptime calculation
    pub start_time: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_idle_closed: AtomicU64::new(0),
            connections_errored: AtomicU64::new(0),
            connections_forced: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            exchange: Arc::new(ExchangeMetrics::new()),
            start_time: Instant::now(),
        }
    }

    /// A connection passed admission
    #[inline]
    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection was refused at the ceiling
    #[inline]
    pub fn record_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection ended
    #[inline]
    pub fn record_connection_closed(&self, reason: DisconnectReason) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        match reason {
            DisconnectReason::IdleTimeout => {
                self.connections_idle_closed.fetch_add(1, Ordering::Relaxed);
            }
            DisconnectReason::Forced => {
                self.connections_forced.fetch_add(1, Ordering::Relaxed);
            }
            DisconnectReason::TransportReset
            | DisconnectReason::TransportError
            | DisconnectReason::IoTimeout => {
                self.connections_errored.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// A transient accept error occurred
    #[inline]
    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections admitted so far
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Connections rejected so far
    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }

    /// Connections closed so far
    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    /// Uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Metrics collector trait for export to monitoring systems
pub trait MetricsCollector: Send + Sync {
    /// Collect metrics into a flat name -> value map
    fn collect(&self) -> HashMap<String, f64>;
}

/// Collector covering connections, exchanges and pools
#[derive(Debug, Clone)]
pub struct GatewayMetricsCollector {
    metrics: Arc<ServerMetrics>,
    admission: Arc<AdmissionControl>,
    pools: Arc<PoolManager>,
}

impl GatewayMetricsCollector {
    /// Create a collector
    #[must_use]
    pub const fn new(
        metrics: Arc<ServerMetrics>,
        admission: Arc<AdmissionControl>,
        pools: Arc<PoolManager>,
    ) -> Self {
        Self {
            metrics,
            admission,
            pools,
        }
    }
}

impl MetricsCollector for GatewayMetricsCollector {
    fn collect(&self) -> HashMap<String, f64> {
        let m = &self.metrics;
        let x = &m.exchange;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed) as f64;

        let mut out = HashMap::new();
        out.insert("uptime_seconds".to_string(), m.uptime_seconds() as f64);
        out.insert("connections_active".to_string(), self.admission.active() as f64);
        out.insert("connections_max".to_string(), self.admission.max() as f64);
        out.insert("connections_accepted".to_string(), load(&m.connections_accepted));
        out.insert("connections_rejected".to_string(), load(&m.connections_rejected));
        out.insert("connections_closed".to_string(), load(&m.connections_closed));
        out.insert("connections_idle_closed".to_string(), load(&m.connections_idle_closed));
        out.insert("connections_errored".to_string(), load(&m.connections_errored));
        out.insert("connections_forced".to_string(), load(&m.connections_forced));
        out.insert("accept_errors".to_string(), load(&m.accept_errors));

        out.insert("requests_total".to_string(), load(&x.requests_total));
        out.insert("requests_successful".to_string(), load(&x.requests_successful));
        out.insert("requests_failed".to_string(), load(&x.requests_failed));
        out.insert("requests_in_flight".to_string(), load(&x.requests_in_flight));
        out.insert("processing_timeouts".to_string(), load(&x.processing_timeouts));
        out.insert("processor_panics".to_string(), load(&x.processor_panics));
        out.insert("oversized_requests".to_string(), load(&x.oversized_requests));
        out.insert("bytes_received".to_string(), load(&x.bytes_received));
        out.insert("bytes_sent".to_string(), load(&x.bytes_sent));
        out.insert("response_time_avg_us".to_string(), x.avg_response_time_us());
        out.insert(
            "response_time_min_us".to_string(),
            x.min_response_time_us().unwrap_or(0) as f64,
        );
        out.insert("response_time_max_us".to_string(), load(&x.max_response_time_us));
        out.insert("error_rate_percent".to_string(), x.error_rate_percent());

        for status in self.pools.status() {
            let prefix = format!("pool.{}", status.name);
            out.insert(format!("{prefix}.size"), f64::from(status.size));
            out.insert(format!("{prefix}.idle"), status.idle as f64);
            out.insert(format!("{prefix}.selections"), status.selections as f64);
            out.insert(format!("{prefix}.probes_performed"), status.probes_performed as f64);
            out.insert(format!("{prefix}.probes_failed"), status.probes_failed as f64);
            out.insert(format!("{prefix}.clears"), status.clears as f64);
        }
        out
    }
}

/// Periodic stats logger
#[derive(Debug)]
pub struct StatsReporter;

impl StatsReporter {
    /// Log a stats line every `period` until `token` is cancelled
    pub fn spawn(
        collector: GatewayMetricsCollector,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => Self::report(&collector),
                }
            }
            debug!("Stats reporter stopped");
        })
    }

    /// Log one snapshot
    pub fn report(collector: &GatewayMetricsCollector) {
        let snapshot = collector.collect();
        let get = |key: &str| snapshot.get(key).copied().unwrap_or_default();
        info!(
            active = get("connections_active"),
            accepted = get("connections_accepted"),
            rejected = get("connections_rejected"),
            closed = get("connections_closed"),
            requests = get("requests_total"),
            failed = get("requests_failed"),
            in_flight = get("requests_in_flight"),
            avg_response_us = get("response_time_avg_us"),
            "Gateway stats"
        );
        for status in collector.pools.status() {
            info!(
                pool = %status.name,
                size = status.size,
                idle = status.idle,
                in_use = status.in_use(),
                utilization = status.utilization(),
                selections = status.selections,
                probes_failed = status.probes_failed,
                "Pool stats"
            );
        }
    }
}
