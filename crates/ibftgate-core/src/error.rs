//! Error taxonomy shared by every gateway layer.
//!
//! Failures are classified into four kinds that govern behavior rather than
//! log text:
//!
//! - [`ErrorKind::Transport`] ends the connection it occurred on, no retry.
//! - [`ErrorKind::Processing`] keeps the connection open; the client receives a
//!   synthesized error response.
//! - [`ErrorKind::Configuration`] is fatal at startup.
//! - [`ErrorKind::Shutdown`] is logged and swallowed so shutdown always completes.

use serde::{Deserialize, Serialize};

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error classification for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket reset, abort, timeout or use after disposal
    Transport,
    /// Malformed request or request processor failure
    Processing,
    /// Missing or invalid configuration, pool manager misuse
    Configuration,
    /// Failure while tearing the service down
    Shutdown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Processing => write!(f, "processing"),
            Self::Configuration => write!(f, "configuration"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Core error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
        /// Configuration key that caused the error
        key: Option<String>,
    },

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Processing errors
    #[error("Processing error: {0}")]
    Processing(String),

    /// Shutdown errors
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: None,
        }
    }

    /// Create a configuration error with key
    pub fn configuration_with_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Create a new transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new processing error
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    /// Create a new shutdown error
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown(message.into())
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Transport(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Processing(_) => ErrorKind::Processing,
            Self::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    /// Check if this error should prevent the service from starting
    #[must_use]
    pub const fn is_fatal_at_startup(&self) -> bool {
        matches!(self.kind(), ErrorKind::Configuration)
    }

    /// Check if this error terminates the connection it occurred on
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::configuration("x").kind(), ErrorKind::Configuration);
        assert_eq!(Error::transport("x").kind(), ErrorKind::Transport);
        assert_eq!(Error::processing("x").kind(), ErrorKind::Processing);
        assert_eq!(Error::shutdown("x").kind(), ErrorKind::Shutdown);

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(Error::from(io).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_error_policies() {
        assert!(Error::configuration("missing").is_fatal_at_startup());
        assert!(!Error::processing("bad request").is_fatal_at_startup());
        assert!(Error::transport("reset").is_connection_fatal());
        assert!(!Error::processing("bad request").is_connection_fatal());
        assert!(!Error::shutdown("already closed").is_connection_fatal());
    }

    #[test]
    fn test_configuration_with_key_display() {
        let err = Error::configuration_with_key("must be positive", "listener.max_connections");
        assert_eq!(err.to_string(), "Configuration error: must be positive");
        match err {
            Error::Configuration { key, .. } => {
                assert_eq!(key.as_deref(), Some("listener.max_connections"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
