//! Server error types and handling

use ibftgate_core::ErrorKind;
use ibftgate_pool::PoolError;

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration or startup errors from the core crate
    #[error("{0}")]
    Core(#[from] ibftgate_core::Error),

    /// Pool manager errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Server lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Create a lifecycle error
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }

    /// Classify the error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Core(e) => e.kind(),
            Self::Pool(e) => e.kind(),
            Self::Bind { .. } | Self::Lifecycle(_) => ErrorKind::Configuration,
            Self::Io(_) => ErrorKind::Transport,
        }
    }

    /// Check if the error should stop the service
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Core(_) | Self::Pool(_) | Self::Bind { .. }
        )
    }

    /// Process exit code for startup failures
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => 78, // EX_CONFIG
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_exit_with_ex_config() {
        let err = ServerError::from(ibftgate_core::Error::configuration("bad"));
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 78);

        let err = ServerError::from(PoolError::NotInitialized);
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:80".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().starts_with("Failed to bind 0.0.0.0:80"));
        assert!(err.is_fatal());
    }
}
