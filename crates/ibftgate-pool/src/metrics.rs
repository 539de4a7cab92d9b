//! Per-pool counters and status snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept for each logical pool
#[derive(Debug, Default)]
pub struct PoolMetrics {
    selections: AtomicU64,
    probes_performed: AtomicU64,
    probes_failed: AtomicU64,
    clears: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn record_selection(&self) {
        self.selections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_probe(&self, ok: bool) {
        self.probes_performed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.probes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    /// Times this pool was handed out by `get_connection`
    pub fn selections(&self) -> u64 {
        self.selections.load(Ordering::Relaxed)
    }

    /// Health probes run against this pool
    pub fn probes_performed(&self) -> u64 {
        self.probes_performed.load(Ordering::Relaxed)
    }

    /// Health probes that failed or timed out
    pub fn probes_failed(&self) -> u64 {
        self.probes_failed.load(Ordering::Relaxed)
    }

    /// Times the pool was cleared
    pub fn clears(&self) -> u64 {
        self.clears.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one logical pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Pool name
    pub name: String,
    /// Open physical connections
    pub size: u32,
    /// Idle physical connections
    pub idle: usize,
    /// Configured maximum
    pub max_size: u32,
    /// Configured minimum
    pub min_size: u32,
    /// Times selected
    pub selections: u64,
    /// Probes run
    pub probes_performed: u64,
    /// Probes failed
    pub probes_failed: u64,
    /// Times cleared
    pub clears: u64,
}

impl PoolStatus {
    /// Fraction of `max_size` currently open
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        f64::from(self.size) / f64::from(self.max_size)
    }

    /// Connections in use
    #[must_use]
    pub fn in_use(&self) -> u32 {
        self.size.saturating_sub(self.idle as u32)
    }
}
