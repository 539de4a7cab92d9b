//! Multi-pool connection manager.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use ibftgate_core::DatabaseConfig;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::{PoolDescriptor, parse_base};
use crate::error::{PoolError, PoolResult};
use crate::metrics::{PoolMetrics, PoolStatus};

/// One named logical pool
struct PoolEntry {
    descriptor: PoolDescriptor,
    pool: ArcSwap<PgPool>,
    metrics: PoolMetrics,
}

impl PoolEntry {
    fn new(descriptor: PoolDescriptor) -> Self {
        let pool = descriptor.build_pool();
        Self {
            descriptor,
            pool: ArcSwap::from_pointee(pool),
            metrics: PoolMetrics::default(),
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn current(&self) -> PgPool {
        PgPool::clone(&self.pool.load())
    }
}

/// Immutable set of pools built by `initialize`
struct PoolSet {
    entries: Vec<PoolEntry>,
    by_name: HashMap<String, usize>,
}

impl PoolSet {
    fn find(&self, name: &str) -> Option<&PoolEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }
}

/// Handle to the pool selected for one request
///
/// Cheap to clone; holds a reference-counted pool, not a physical connection.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    name: String,
    pool: PgPool,
}

impl PoolHandle {
    /// Name of the selected pool
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying driver pool
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check out a physical connection
    pub async fn acquire(&self) -> PoolResult<PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|source| PoolError::Acquire {
                pool: self.name.clone(),
                source,
            })
    }
}

/// Result of probing one pool
#[derive(Debug)]
pub struct ProbeOutcome {
    /// Pool name
    pub pool: String,
    /// Probe duration on success
    pub result: PoolResult<Duration>,
}

impl ProbeOutcome {
    /// Whether the probe succeeded
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.result.is_ok()
    }
}

/// Owner of the gateway's named database pools
///
/// Construct once, call [`PoolManager::initialize`] and share it behind an
/// `Arc`. Selection is lock-free after initialization; the round-robin cursor
/// is a single atomic counter.
pub struct PoolManager {
    config: DatabaseConfig,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    pools: OnceCell<PoolSet>,
    cursor: AtomicUsize,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("initialized", &self.is_initialized())
            .field("pools", &self.pool_names())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Create an uninitialized manager
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            pools: OnceCell::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Database configuration in effect
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Whether `initialize` has completed
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Build the `number_of_pools` logical pools
    ///
    /// Runs once. A repeated call logs a warning and returns `Ok`. Pools
    /// connect lazily, so this does not touch the database; it must run
    /// inside a Tokio runtime.
    pub fn initialize(&self) -> PoolResult<()> {
        if self.is_initialized() {
            warn!("Pool manager already initialized; ignoring repeated initialize");
            return Ok(());
        }

        let _guard = self.init_lock.lock();
        if self.is_initialized() {
            warn!("Pool manager already initialized; ignoring repeated initialize");
            return Ok(());
        }

        let base = parse_base(&self.config.connection_string)?;
        let count = self.config.number_of_pools;
        if count == 0 {
            return Err(PoolError::InvalidDescriptor(
                "number_of_pools must be at least 1".to_string(),
            ));
        }
        let mut entries = Vec::with_capacity(count);
        let mut by_name = HashMap::with_capacity(count);

        for index in 0..count {
            let name = format!("pool_{}", index + 1);
            let descriptor = PoolDescriptor::derive(&base, &self.config, &name);
            debug!(
                pool = %name,
                application_name = %descriptor.application_name,
                max_size = descriptor.max_size,
                min_size = descriptor.min_size,
                "Creating pool"
            );
            by_name.insert(name, index);
            entries.push(PoolEntry::new(descriptor));
        }

        if self.pools.set(PoolSet { entries, by_name }).is_err() {
            warn!("Pool set was already populated; keeping the existing pools");
        }
        self.initialized.store(true, Ordering::Release);

        info!(
            pools = count,
            max_pool_size = self.config.max_pool_size,
            min_pool_size = self.config.min_pool_size,
            "Pool manager initialized"
        );
        Ok(())
    }

    /// Select a pool
    ///
    /// With `None`, pools are chosen round robin so per-pool selection
    /// counts never differ by more than one. With a name, that pool is
    /// returned or [`PoolError::UnknownPool`].
    pub fn get_connection(&self, pool_name: Option<&str>) -> PoolResult<PoolHandle> {
        let set = self.pools.get().ok_or(PoolError::NotInitialized)?;

        let entry = match pool_name {
            Some(name) => set
                .find(name)
                .ok_or_else(|| PoolError::UnknownPool(name.to_string()))?,
            None => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % set.entries.len();
                &set.entries[index]
            }
        };

        entry.metrics.record_selection();
        Ok(PoolHandle {
            name: entry.name().to_string(),
            pool: entry.current(),
        })
    }

    /// Names of all pools, empty before initialization
    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        self.pools
            .get()
            .map(|set| set.entries.iter().map(|e| e.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Number of pools, zero before initialization
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.get().map_or(0, |set| set.entries.len())
    }

    /// Snapshot of every pool
    #[must_use]
    pub fn status(&self) -> Vec<PoolStatus> {
        let Some(set) = self.pools.get() else {
            return Vec::new();
        };
        set.entries
            .iter()
            .map(|entry| {
                let pool = entry.pool.load();
                PoolStatus {
                    name: entry.name().to_string(),
                    size: pool.size(),
                    idle: pool.num_idle(),
                    max_size: entry.descriptor.max_size,
                    min_size: entry.descriptor.min_size,
                    selections: entry.metrics.selections(),
                    probes_performed: entry.metrics.probes_performed(),
                    probes_failed: entry.metrics.probes_failed(),
                    clears: entry.metrics.clears(),
                }
            })
            .collect()
    }

    /// Release every pooled physical connection
    ///
    /// Each pool is replaced by a fresh lazy pool, so the manager stays
    /// usable afterwards. The old pools are closed with the command timeout
    /// as an upper bound. Never fails; returns the number of pools cleared.
    pub async fn clear_all_pools(&self) -> usize {
        let Some(set) = self.pools.get() else {
            debug!("clear_all_pools called before initialization");
            return 0;
        };

        let timeout = self.config.command_timeout();
        for entry in &set.entries {
            let old = entry.pool.swap(Arc::new(entry.descriptor.build_pool()));
            entry.metrics.record_clear();
            if tokio::time::timeout(timeout, old.close()).await.is_err() {
                warn!(pool = %entry.name(), ?timeout, "Timed out closing pool; connections still checked out");
            } else {
                debug!(pool = %entry.name(), "Pool cleared");
            }
        }

        info!(pools = set.entries.len(), "All pools cleared");
        set.entries.len()
    }

    /// Probe every pool once with `SELECT 1`
    ///
    /// Failures are logged and counted; a pool is never disabled.
    pub async fn probe_all(&self) -> Vec<ProbeOutcome> {
        let Some(set) = self.pools.get() else {
            return Vec::new();
        };

        let mut outcomes = Vec::with_capacity(set.entries.len());
        for entry in &set.entries {
            let result = self.probe(entry).await;
            entry.metrics.record_probe(result.is_ok());
            match &result {
                Ok(elapsed) => debug!(pool = %entry.name(), ?elapsed, "Health probe ok"),
                Err(e) => warn!(pool = %entry.name(), error = %e, "Health probe failed"),
            }
            outcomes.push(ProbeOutcome {
                pool: entry.name().to_string(),
                result,
            });
        }
        outcomes
    }

    async fn probe(&self, entry: &PoolEntry) -> PoolResult<Duration> {
        let pool = entry.current();
        let timeout = self.config.command_timeout();
        let started = Instant::now();

        let probe = async {
            let mut conn = pool.acquire().await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok::<_, sqlx::Error>(())
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(source)) => Err(PoolError::Probe {
                pool: entry.name().to_string(),
                source,
            }),
            Err(_) => Err(PoolError::ProbeTimeout {
                pool: entry.name().to_string(),
                timeout,
            }),
        }
    }

    /// Start the periodic health probe
    ///
    /// Returns `None` when probing is disabled by configuration. The task
    /// stops when `token` is cancelled.
    pub fn spawn_health_probe(self: &Arc<Self>, token: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.health_check_interval()?;
        Some(self.spawn_health_probe_every(period, token))
    }

    /// Start the health probe with an explicit period
    pub fn spawn_health_probe_every(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately; probe one period after start
            interval.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        let outcomes = manager.probe_all().await;
                        let failed = outcomes.iter().filter(|o| !o.is_healthy()).count();
                        if failed > 0 {
                            warn!(failed, total = outcomes.len(), "Health probe round finished with failures");
                        }
                    }
                }
            }
            debug!("Health probe stopped");
        })
    }
}
