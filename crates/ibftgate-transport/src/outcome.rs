//! Closed set of socket operation results and disconnect reasons.

use std::fmt;
use std::io;

/// Result of one receive or send on a client socket
#[derive(Debug)]
pub enum IoOutcome<T> {
    /// Operation completed
    Ok(T),
    /// Orderly close by the peer (zero-length read)
    PeerClosed,
    /// The operation did not finish in time
    Timeout,
    /// Connection reset, aborted or broken pipe
    Reset(io::Error),
    /// The connection was already disposed
    Disposed,
    /// Any other socket error
    Other(io::Error),
}

impl<T> IoOutcome<T> {
    /// Classify an I/O error
    pub fn from_error(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Reset(err),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::NotConnected => Self::Disposed,
            _ => Self::Other(err),
        }
    }

    /// Whether this is a successful result
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Disconnect reason for a failed outcome, `None` for `Ok`
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            Self::Ok(_) => None,
            Self::PeerClosed => Some(DisconnectReason::PeerClosed),
            Self::Timeout => Some(DisconnectReason::IoTimeout),
            Self::Reset(_) => Some(DisconnectReason::TransportReset),
            Self::Disposed => Some(DisconnectReason::Disposed),
            Self::Other(_) => Some(DisconnectReason::TransportError),
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Peer closed the connection
    PeerClosed,
    /// No request within the idle timeout
    IdleTimeout,
    /// A send did not complete within the connection timeout
    IoTimeout,
    /// Service shutdown
    Cancelled,
    /// Connection reset or aborted
    TransportReset,
    /// Other socket error
    TransportError,
    /// Disposed before the handler loop ran
    Disposed,
    /// Forcibly disposed after the drain window
    Forced,
}

impl DisconnectReason {
    /// Short label for logs and metrics
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::IoTimeout => "io_timeout",
            Self::Cancelled => "cancelled",
            Self::TransportReset => "transport_reset",
            Self::TransportError => "transport_error",
            Self::Disposed => "disposed",
            Self::Forced => "forced",
        }
    }

    /// Whether the disconnect indicates a fault rather than a normal close
    pub const fn is_abnormal(self) -> bool {
        matches!(
            self,
            Self::IoTimeout | Self::TransportReset | Self::TransportError | Self::Forced
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        let reset = IoOutcome::<()>::from_error(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(reset, IoOutcome::Reset(_)));
        assert_eq!(reset.disconnect_reason(), Some(DisconnectReason::TransportReset));

        let pipe = IoOutcome::<()>::from_error(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(pipe, IoOutcome::Reset(_)));

        let timeout = IoOutcome::<()>::from_error(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(timeout, IoOutcome::Timeout));

        let other = IoOutcome::<()>::from_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(other, IoOutcome::Other(_)));
    }

    #[test]
    fn test_ok_has_no_reason() {
        assert_eq!(IoOutcome::Ok(3).disconnect_reason(), None);
        assert!(IoOutcome::Ok(()).is_ok());
    }

    #[test]
    fn test_abnormal_reasons() {
        assert!(!DisconnectReason::PeerClosed.is_abnormal());
        assert!(!DisconnectReason::IdleTimeout.is_abnormal());
        assert!(DisconnectReason::Forced.is_abnormal());
        assert_eq!(DisconnectReason::Cancelled.to_string(), "cancelled");
    }
}
