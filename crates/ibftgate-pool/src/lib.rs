//! # ibftgate pool
//!
//! Database pool manager for the IBFT gateway. A fixed set of logical
//! PostgreSQL pools (`pool_1`..`pool_N`) is derived from one base connection
//! string, each with its own application name so the driver never merges them.
//! Requests are spread across pools round robin, a background task probes each
//! pool with `SELECT 1`, and all pools can be cleared for shutdown or manual
//! recovery.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ibftgate_core::DatabaseConfig;
//! use ibftgate_pool::PoolManager;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), ibftgate_pool::PoolError> {
//! let manager = Arc::new(PoolManager::new(DatabaseConfig::default()));
//! manager.initialize()?;
//!
//! let probe = manager.spawn_health_probe(CancellationToken::new());
//! let handle = manager.get_connection(None)?;
//! let conn = handle.acquire().await?;
//! # drop(conn); drop(probe);
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc  // Error documentation in progress
)]

pub mod descriptor;
pub mod error;
pub mod manager;
pub mod metrics;

pub use descriptor::PoolDescriptor;
pub use error::{PoolError, PoolResult};
pub use manager::{PoolHandle, PoolManager, ProbeOutcome};
pub use metrics::{PoolMetrics, PoolStatus};
