//! # ibftgate server
//!
//! The accepting side of the IBFT gateway: a TCP listener that admits clients
//! up to a hard ceiling, hands each one to a
//! [`ConnectionHandler`](ibftgate_transport::ConnectionHandler), keeps a
//! registry of live connections and shuts everything down in order when asked.
//!
//! ## Shutdown
//!
//! Cancelling the run token (or calling [`ShutdownHandle::shutdown`]) starts a
//! best-effort sequence. Each step runs even if an earlier one failed:
//!
//! 1. stop accepting and close the listening socket
//! 2. stop the periodic stats reporter
//! 3. cancel every handler; in-flight requests get the drain grace
//! 4. wait for handlers up to the drain window, then force-dispose the rest
//! 5. clear every database pool
//! 6. log and return a [`ShutdownReport`]
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ibftgate_core::GatewayConfig;
//! use ibftgate_pool::PoolManager;
//! use ibftgate_server::Listener;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::default();
//! let pools = Arc::new(PoolManager::new(config.database.clone()));
//! pools.initialize()?;
//!
//! let token = CancellationToken::new();
//! let listener = Listener::bind(config.listener, pools).await?;
//! let report = listener.run(token).await;
//! println!("drained {} connections", report.drained);
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
    clippy::missing_errors_doc,  // Error documentation in progress
    clippy::must_use_candidate,  // Too pedantic for library APIs
    clippy::return_self_not_must_use,  // Constructor methods don't need must_use
    clippy::cast_precision_loss  // Counters exported as f64
)]

pub mod admission;
pub mod cli;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod metrics;
pub mod processor;
pub mod registry;
pub mod telemetry;

pub use admission::{AdmissionControl, AdmissionPermit};
pub use cli::Cli;
pub use error::{ServerError, ServerResult};
pub use lifecycle::{ServerLifecycle, ServerState, ShutdownHandle, wait_for_signal};
pub use listener::{Listener, ListenerBuilder, ShutdownCause, ShutdownReport};
pub use metrics::{GatewayMetricsCollector, MetricsCollector, ServerMetrics, StatsReporter};
pub use processor::{AUDIT_TARGET, AcknowledgeProcessor, TracingAuditSink};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use telemetry::init_tracing;
