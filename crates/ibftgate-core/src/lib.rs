//! # ibftgate core
//!
//! Shared building blocks for the IBFT gateway crates: configuration loading and
//! validation, the error taxonomy every layer classifies its failures into,
//! correlation identifiers, and the synthesized response envelope sent to
//! clients when a request cannot be answered by the processor.
//!
//! ## Example
//!
//! ```
//! use ibftgate_core::{CorrelationId, GatewayConfig, ResponseCode, ResponseEnvelope};
//!
//! let config = GatewayConfig::default();
//! assert!(config.validate().is_ok());
//!
//! let id = CorrelationId::new();
//! let body = ResponseEnvelope::new(id.clone(), ResponseCode::SystemMalfunction).to_bytes();
//! assert!(!body.is_empty());
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
    clippy::return_self_not_must_use  // Constructor methods don't need must_use
)]

pub mod config;
pub mod error;
pub mod response;
pub mod types;

pub use config::{
    DatabaseConfig, GatewayConfig, ListenerConfig, LoggingConfig, MAX_REQUEST_SIZE_LIMIT,
};
pub use error::{Error, ErrorKind, Result};
pub use response::{ResponseCode, ResponseEnvelope};
pub use types::{ConnectionId, CorrelationId};

/// Service name used in logs and database application names
pub const SERVICE_NAME: &str = "ibftgate";

/// Service version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix for environment variable configuration overrides
pub const ENV_PREFIX: &str = "IBFTGATE";
