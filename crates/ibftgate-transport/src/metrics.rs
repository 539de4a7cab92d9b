//! Request/response exchange metrics shared by all connection handlers.
//!
//! Every counter is a relaxed atomic so the hot path never takes a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds (milliseconds) of the response-time buckets; the final bucket
/// is unbounded.
pub const BUCKET_BOUNDS_MS: [u64; 12] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Response-time histogram
#[derive(Debug, Default)]
pub struct ResponseTimeHistogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
}

impl ResponseTimeHistogram {
    /// Record one observation
    #[inline]
    pub fn record(&self, duration_us: u64) {
        let duration_ms = duration_us / 1000;
        let index = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| duration_ms < bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Bucket counts, lowest bound first
    pub fn snapshot(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Total observations
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }
}

/// Exchange counters
#[derive(Debug)]
pub struct ExchangeMetrics {
    /// Requests received
    pub requests_total: AtomicU64,
    /// Requests answered by the processor
    pub requests_successful: AtomicU64,
    /// Requests answered with a synthesized error
    pub requests_failed: AtomicU64,
    /// Requests currently in the processor
    pub requests_in_flight: AtomicU64,
    /// Processing timeouts
    pub processing_timeouts: AtomicU64,
    /// Processor panics caught
    pub processor_panics: AtomicU64,
    /// Oversized requests rejected
    pub oversized_requests: AtomicU64,
    /// Bytes read from clients
    pub bytes_received: AtomicU64,
    /// Bytes written to clients
    pub bytes_sent: AtomicU64,
    /// Sum of response times in microseconds
    pub total_response_time_us: AtomicU64,
    /// Minimum response time observed (microseconds)
    pub min_response_time_us: AtomicU64,
    /// Maximum response time observed (microseconds)
    pub max_response_time_us: AtomicU64,
    /// Response-time distribution
    pub response_time_buckets: ResponseTimeHistogram,
}

impl Default for ExchangeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_successful: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_in_flight: AtomicU64::new(0),
            processing_timeouts: AtomicU64::new(0),
            processor_panics: AtomicU64::new(0),
            oversized_requests: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            min_response_time_us: AtomicU64::new(u64::MAX),
            max_response_time_us: AtomicU64::new(0),
            response_time_buckets: ResponseTimeHistogram::default(),
        }
    }

    /// A request was read off the wire
    ///
    /// The request counts as in flight until the returned guard is dropped,
    /// which also covers handler tasks aborted mid-request.
    #[inline]
    pub fn record_request_start(self: &Arc<Self>, bytes: usize) -> InFlightGuard {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    /// The request finished, successfully or not
    #[inline]
    pub fn record_request_end(&self, success: bool, duration: Duration) {
        if success {
            self.requests_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }

        let duration_us = duration.as_micros() as u64;
        self.total_response_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
        self.response_time_buckets.record(duration_us);
        self.min_response_time_us
            .fetch_min(duration_us, Ordering::Relaxed);
        self.max_response_time_us
            .fetch_max(duration_us, Ordering::Relaxed);
    }

    /// Bytes written back to a client
    #[inline]
    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Average response time in microseconds
    pub fn avg_response_time_us(&self) -> f64 {
        let completed = self.requests_successful.load(Ordering::Relaxed)
            + self.requests_failed.load(Ordering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        self.total_response_time_us.load(Ordering::Relaxed) as f64 / completed as f64
    }

    /// Minimum response time, `None` before the first request completes
    pub fn min_response_time_us(&self) -> Option<u64> {
        match self.min_response_time_us.load(Ordering::Relaxed) {
            u64::MAX => None,
            v => Some(v),
        }
    }

    /// Failed requests as a percentage of completed ones
    pub fn error_rate_percent(&self) -> f64 {
        let ok = self.requests_successful.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);
        if ok + failed == 0 {
            return 0.0;
        }
        failed as f64 / (ok + failed) as f64 * 100.0
    }
}

/// Holds one request in the in-flight gauge
#[derive(Debug)]
#[must_use = "the request leaves the in-flight gauge when the guard drops"]
pub struct InFlightGuard {
    metrics: Arc<ExchangeMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics
            .requests_in_flight
            .fetch_sub(1, Ordering::Relaxed);
    }
}
