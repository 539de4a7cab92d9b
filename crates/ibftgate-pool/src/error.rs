//! Pool manager errors.

use std::time::Duration;

use ibftgate_core::{Error, ErrorKind};

/// Result alias for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors raised by the pool manager
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// `get_connection` called before `initialize`
    #[error("Pool manager is not initialized")]
    NotInitialized,

    /// An explicitly requested pool does not exist
    #[error("Unknown pool: {0}")]
    UnknownPool(String),

    /// The base connection string could not be parsed
    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// Acquiring a physical connection failed
    #[error("Failed to acquire connection from {pool}: {source}")]
    Acquire {
        /// Pool name
        pool: String,
        /// Driver error
        #[source]
        source: sqlx::Error,
    },

    /// A health probe query failed
    #[error("Health probe failed on {pool}: {source}")]
    Probe {
        /// Pool name
        pool: String,
        /// Driver error
        #[source]
        source: sqlx::Error,
    },

    /// A health probe did not finish within the command timeout
    #[error("Health probe on {pool} timed out after {timeout:?}")]
    ProbeTimeout {
        /// Pool name
        pool: String,
        /// Command timeout that elapsed
        timeout: Duration,
    },
}

impl PoolError {
    /// Classify the error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInitialized | Self::UnknownPool(_) | Self::InvalidDescriptor(_) => {
                ErrorKind::Configuration
            }
            Self::Acquire { .. } | Self::Probe { .. } | Self::ProbeTimeout { .. } => {
                ErrorKind::Transport
            }
        }
    }

    /// Pool the error refers to, if any
    #[must_use]
    pub fn pool(&self) -> Option<&str> {
        match self {
            Self::UnknownPool(pool)
            | Self::Acquire { pool, .. }
            | Self::Probe { pool, .. }
            | Self::ProbeTimeout { pool, .. } => Some(pool),
            Self::NotInitialized | Self::InvalidDescriptor(_) => None,
        }
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err.kind() {
            ErrorKind::Configuration => Self::configuration(err.to_string()),
            _ => Self::transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_is_configuration_error() {
        assert_eq!(PoolError::NotInitialized.kind(), ErrorKind::Configuration);
        assert_eq!(
            PoolError::UnknownPool("pool_9".into()).kind(),
            ErrorKind::Configuration
        );

        let core: Error = PoolError::UnknownPool("pool_9".into()).into();
        assert!(core.is_fatal_at_startup());
    }

    #[test]
    fn test_probe_timeout_is_runtime_error() {
        let err = PoolError::ProbeTimeout {
            pool: "pool_1".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.pool(), Some("pool_1"));
    }
}
