//! # ibftgate transport
//!
//! The per-connection half of the IBFT gateway. A [`ConnectionHandler`] owns
//! one accepted socket and loops through receive, dispatch and respond until
//! the peer leaves, the connection idles out, a socket error occurs or the
//! service shuts down. It then disposes itself exactly once and publishes a
//! [`ConnectionEvent::Disconnected`] for the registry.
//!
//! Processing failures of every sort (typed errors, timeouts, panics, empty
//! responses) are answered with a synthesized
//! [`ResponseEnvelope`](ibftgate_core::ResponseEnvelope) and never end the
//! connection. Socket failures always do.
//!
//! ## Framing
//!
//! There is no length prefix or delimiter: the bytes returned by one
//! successful read are one request. Clients must send one request at a time
//! and wait for its response.

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
    clippy::cast_possible_truncation,  // Durations in microseconds fit in u64
    clippy::cast_precision_loss,  // Averages and percentages are approximate
    clippy::missing_errors_doc
)]

pub mod audit;
pub mod connection;
pub mod event;
pub mod handler;
pub mod metrics;
pub mod outcome;
pub mod processor;

pub use audit::AuditDispatcher;
pub use connection::{ConnectionSettings, ConnectionShared, HandlerState};
pub use event::{ConnectionEvent, ConnectionEventEmitter};
pub use handler::{ConnectionHandler, HandlerServices};
pub use metrics::{ExchangeMetrics, InFlightGuard, ResponseTimeHistogram};
pub use outcome::{DisconnectReason, IoOutcome};
pub use processor::{
    AuditRecord, AuditSink, NoopAuditSink, ProcessingError, RequestContext, RequestProcessor,
};
