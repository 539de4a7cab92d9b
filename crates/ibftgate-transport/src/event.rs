//! Connection lifecycle events published by handlers.

use std::net::SocketAddr;

use ibftgate_core::ConnectionId;
use tokio::sync::mpsc;

use crate::outcome::DisconnectReason;

/// Event published by a connection handler
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection ended; published exactly once per connection
    Disconnected {
        /// Connection id
        id: ConnectionId,
        /// Remote address
        remote: SocketAddr,
        /// Requests served on the connection
        requests: u64,
        /// Why it ended
        reason: DisconnectReason,
    },
}

/// Sending half of the connection event channel
///
/// Unbounded so that publishing never blocks a disconnect.
#[derive(Debug, Clone)]
pub struct ConnectionEventEmitter {
    sender: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEventEmitter {
    /// Create an emitter and its receiver
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Emit an event; dropped silently if the receiver is gone
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.sender.send(event);
    }

    /// Emit a disconnection event
    pub fn emit_disconnected(
        &self,
        id: ConnectionId,
        remote: SocketAddr,
        requests: u64,
        reason: DisconnectReason,
    ) {
        self.emit(ConnectionEvent::Disconnected {
            id,
            remote,
            requests,
            reason,
        });
    }
}
