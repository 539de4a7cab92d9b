//! Gateway configuration management
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `IBFTGATE__<SECTION>__<KEY>` environment variables. The binary applies its
//! command-line overrides on top and calls [`GatewayConfig::validate`] before
//! anything is bound or connected.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest allowed `listener.max_request_size`
pub const MAX_REQUEST_SIZE_LIMIT: usize = 16 * 1024 * 1024;
use crate::{ENV_PREFIX, SERVICE_NAME};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener and per-connection settings
    pub listener: ListenerConfig,
    /// Database pool settings
    pub database: DatabaseConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address
    pub bind_address: String,
    /// Listen port
    pub port: u16,
    /// Maximum simultaneously active connections
    pub max_connections: usize,
    /// Socket receive buffer size in bytes
    pub receive_buffer_size: usize,
    /// Socket send buffer size in bytes
    pub send_buffer_size: usize,
    /// Bound on a single receive or send
    pub connection_timeout_ms: u64,
    /// Silence after which a connection is dropped
    pub idle_timeout_ms: u64,
    /// Largest accepted request payload
    pub max_request_size: usize,
    /// Backstop on a single processor call
    pub processing_timeout_ms: u64,
    /// Grace period for in-flight work once shutdown starts
    pub drain_grace_ms: u64,
    /// Upper bound on waiting for handlers during shutdown
    pub drain_window_ms: u64,
    /// Period of the stats log line, zero disables it
    pub stats_interval_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9500,
            max_connections: 1000,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            connection_timeout_ms: 30_000,
            idle_timeout_ms: 300_000,
            max_request_size: 64 * 1024,
            processing_timeout_ms: 30_000,
            drain_grace_ms: 500,
            drain_window_ms: 10_000,
            stats_interval_secs: 60,
        }
    }
}

impl ListenerConfig {
    /// Receive/send timeout
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Idle timeout
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Processing timeout
    #[must_use]
    pub const fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    /// Per-handler drain grace period
    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Overall drain window
    #[must_use]
    pub const fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    /// Stats interval, `None` when disabled
    #[must_use]
    pub const fn stats_interval(&self) -> Option<Duration> {
        if self.stats_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stats_interval_secs))
        }
    }

    /// `host:port` string to bind
    #[must_use]
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Database pool configuration
///
/// Sizing applies to every logical pool individually; `number_of_pools`
/// copies are created from the same base connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Base connection string (`postgres://...`)
    pub connection_string: String,
    /// Maximum physical connections per pool
    pub max_pool_size: u32,
    /// Minimum physical connections per pool
    pub min_pool_size: u32,
    /// Growth step hint
    pub incr_pool_size: u32,
    /// Shrink step hint
    pub decr_pool_size: u32,
    /// Maximum lifetime of a physical connection, zero for unlimited
    pub connection_lifetime_secs: u64,
    /// Number of independent logical pools
    pub number_of_pools: usize,
    /// Validate connections before handing them out
    pub validate_connection: bool,
    /// Command and acquire timeout
    pub command_timeout_secs: u64,
    /// Health probe period, zero disables probing
    pub health_check_interval_secs: u64,
    /// Application name prefix reported to the database
    pub application_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "postgres://ibft@localhost:5432/ibft".to_string(),
            max_pool_size: 20,
            min_pool_size: 1,
            incr_pool_size: 5,
            decr_pool_size: 2,
            connection_lifetime_secs: 300,
            number_of_pools: 4,
            validate_connection: true,
            command_timeout_secs: 30,
            health_check_interval_secs: 60,
            application_name: SERVICE_NAME.to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Command timeout
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Connection lifetime, `None` for unlimited
    #[must_use]
    pub const fn connection_lifetime(&self) -> Option<Duration> {
        if self.connection_lifetime_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.connection_lifetime_secs))
        }
    }

    /// Health probe interval, `None` when disabled
    #[must_use]
    pub const fn health_check_interval(&self) -> Option<Duration> {
        if self.health_check_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.health_check_interval_secs))
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file and the environment
    ///
    /// A missing file is not an error when `path` is `None`; an explicit path
    /// must exist. The result is not validated: callers apply their own
    /// overrides first and then call [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        let l = &self.listener;
        let d = &self.database;

        if l.max_connections == 0 {
            return Err(Error::configuration_with_key(
                "must be greater than zero",
                "listener.max_connections",
            ));
        }
        if l.max_request_size == 0 {
            return Err(Error::configuration_with_key(
                "must be greater than zero",
                "listener.max_request_size",
            ));
        }
        // every connection allocates a receive buffer of this size up front
        if l.max_request_size > MAX_REQUEST_SIZE_LIMIT {
            return Err(Error::configuration_with_key(
                format!("must not exceed {MAX_REQUEST_SIZE_LIMIT} bytes"),
                "listener.max_request_size",
            ));
        }
        for (key, value) in [
            ("listener.connection_timeout_ms", l.connection_timeout_ms),
            ("listener.idle_timeout_ms", l.idle_timeout_ms),
            ("listener.processing_timeout_ms", l.processing_timeout_ms),
            ("listener.drain_window_ms", l.drain_window_ms),
            ("database.command_timeout_secs", d.command_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::configuration_with_key("timeout must be non-zero", key));
            }
        }
        if d.connection_string.trim().is_empty() {
            return Err(Error::configuration_with_key(
                "connection string is required",
                "database.connection_string",
            ));
        }
        if d.number_of_pools == 0 {
            return Err(Error::configuration_with_key(
                "must be greater than zero",
                "database.number_of_pools",
            ));
        }
        if d.max_pool_size == 0 {
            return Err(Error::configuration_with_key(
                "must be greater than zero",
                "database.max_pool_size",
            ));
        }
        if d.min_pool_size > d.max_pool_size {
            return Err(Error::configuration_with_key(
                format!(
                    "min_pool_size ({}) exceeds max_pool_size ({})",
                    d.min_pool_size, d.max_pool_size
                ),
                "database.min_pool_size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn key_of(err: Error) -> Option<String> {
        match err {
            Error::Configuration { key, .. } => key,
            _ => None,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listener.drain_grace(), Duration::from_millis(500));
        assert_eq!(config.listener.drain_window(), Duration::from_secs(10));
        assert_eq!(
            config.database.health_check_interval(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_rejects_zero_max_connections() {
        let mut config = GatewayConfig::default();
        config.listener.max_connections = 0;
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal_at_startup());
        assert_eq!(key_of(err).as_deref(), Some("listener.max_connections"));
    }

    #[test]
    fn test_rejects_min_above_max() {
        let mut config = GatewayConfig::default();
        config.database.min_pool_size = 50;
        config.database.max_pool_size = 10;
        let err = config.validate().unwrap_err();
        assert_eq!(key_of(err).as_deref(), Some("database.min_pool_size"));
    }

    #[test]
    fn test_rejects_zero_pools_and_empty_connection_string() {
        let mut config = GatewayConfig::default();
        config.database.number_of_pools = 0;
        assert_eq!(
            key_of(config.validate().unwrap_err()).as_deref(),
            Some("database.number_of_pools")
        );

        let mut config = GatewayConfig::default();
        config.database.connection_string = "  ".to_string();
        assert_eq!(
            key_of(config.validate().unwrap_err()).as_deref(),
            Some("database.connection_string")
        );
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = GatewayConfig::default();
        config.listener.idle_timeout_ms = 0;
        assert_eq!(
            key_of(config.validate().unwrap_err()).as_deref(),
            Some("listener.idle_timeout_ms")
        );
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[listener]
port = 9700
max_connections = 2

[database]
number_of_pools = 3
connection_string = "postgres://gw@db:5432/ibft"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listener.port, 9700);
        assert_eq!(config.listener.max_connections, 2);
        assert_eq!(config.database.number_of_pools, 3);
        // untouched keys keep their defaults
        assert_eq!(config.listener.idle_timeout_ms, 300_000);
    }

    #[test]
    fn test_rejects_unbounded_request_size() {
        let mut config = GatewayConfig::default();
        config.listener.max_request_size = usize::MAX;
        assert_eq!(
            key_of(config.validate().unwrap_err()).as_deref(),
            Some("listener.max_request_size")
        );

        config.listener.max_request_size = MAX_REQUEST_SIZE_LIMIT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_leaves_validation_to_caller() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[database]\nnumber_of_pools = 0").unwrap();
        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database.number_of_pools, 0);
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let err = GatewayConfig::load(Some(Path::new("/nonexistent/ibftgate.toml"))).unwrap_err();
        assert!(err.is_fatal_at_startup());
    }
}
