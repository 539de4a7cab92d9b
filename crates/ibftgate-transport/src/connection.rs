//! State shared between a connection handler and the registry that tracks it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ibftgate_core::{ConnectionId, ListenerConfig};
use tokio_util::sync::CancellationToken;

use crate::event::ConnectionEventEmitter;
use crate::outcome::DisconnectReason;

/// Handler state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandlerState {
    /// Accepted, loop not yet started
    Connected = 0,
    /// Waiting for the next request
    Receiving = 1,
    /// Request handed to the processor
    Processing = 2,
    /// Writing the response
    Responding = 3,
    /// Terminal
    Disconnected = 4,
}

impl HandlerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Receiving,
            2 => Self::Processing,
            3 => Self::Responding,
            _ => Self::Disconnected,
        }
    }
}

/// Per-connection settings derived from the listener configuration
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bound on a single receive or send
    pub connection_timeout: Duration,
    /// Silence after which the connection is dropped
    pub idle_timeout: Duration,
    /// Largest accepted request
    pub max_request_size: usize,
    /// Backstop on one processor call
    pub processing_timeout: Duration,
    /// Time granted to an in-flight request once shutdown starts
    pub drain_grace: Duration,
    /// Socket receive buffer size
    pub receive_buffer_size: usize,
    /// Socket send buffer size
    pub send_buffer_size: usize,
}

impl From<&ListenerConfig> for ConnectionSettings {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout(),
            idle_timeout: config.idle_timeout(),
            max_request_size: config.max_request_size,
            processing_timeout: config.processing_timeout(),
            drain_grace: config.drain_grace(),
            receive_buffer_size: config.receive_buffer_size,
            send_buffer_size: config.send_buffer_size,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ListenerConfig::default())
    }
}

/// Identity and single-fire disposal state of one connection
///
/// The handler task and the registry both hold an `Arc` to it. Whichever side
/// calls [`ConnectionShared::dispose`] first publishes the disconnect event;
/// every later call is a no-op.
#[derive(Debug)]
pub struct ConnectionShared {
    id: ConnectionId,
    remote: SocketAddr,
    token: CancellationToken,
    emitter: ConnectionEventEmitter,
    created_at: Instant,
    disposed: AtomicBool,
    requests: AtomicU64,
    state: AtomicU8,
}

impl ConnectionShared {
    /// Create shared state for a freshly accepted connection
    pub fn new(
        id: ConnectionId,
        remote: SocketAddr,
        token: CancellationToken,
        emitter: ConnectionEventEmitter,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote,
            token,
            emitter,
            created_at: Instant::now(),
            disposed: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            state: AtomicU8::new(HandlerState::Connected as u8),
        })
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Cancellation token of this connection
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time since accept
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Requests received so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub(crate) fn record_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current handler state
    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the connection has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Ask the handler to stop; does not dispose
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Dispose the connection
    ///
    /// Returns `true` for the single call that performed the disposal. That
    /// call cancels the token and publishes the disconnect event.
    pub fn dispose(&self, reason: DisconnectReason) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(HandlerState::Disconnected);
        self.token.cancel();
        self.emitter
            .emit_disconnected(self.id, self.remote, self.requests(), reason);
        true
    }
}
