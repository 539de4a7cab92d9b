//! Per-pool connection descriptors.
//!
//! Every logical pool is derived from the one base connection string. Each
//! gets its own application name so the driver and the database side never
//! treat two logical pools as one.

use std::time::Duration;

use ibftgate_core::DatabaseConfig;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::{PoolError, PoolResult};

/// Sizing and identity of one logical pool
#[derive(Debug, Clone)]
pub struct PoolDescriptor {
    /// Pool name (`pool_1`, `pool_2`, ...)
    pub name: String,
    /// Application name reported to the database
    pub application_name: String,
    /// Maximum physical connections
    pub max_size: u32,
    /// Minimum physical connections kept open
    pub min_size: u32,
    /// Growth step hint
    pub incr_size: u32,
    /// Shrink step hint
    pub decr_size: u32,
    /// Maximum lifetime of a physical connection
    pub lifetime: Option<Duration>,
    /// Ping connections before handing them out
    pub validate: bool,
    /// Acquire and statement timeout
    pub command_timeout: Duration,
    connect_options: PgConnectOptions,
}

/// Parse the shared base connection string
pub fn parse_base(connection_string: &str) -> PoolResult<PgConnectOptions> {
    connection_string
        .parse::<PgConnectOptions>()
        .map_err(|e| PoolError::InvalidDescriptor(e.to_string()))
}

impl PoolDescriptor {
    /// Derive the descriptor for `name` from the base options
    #[must_use]
    pub fn derive(base: &PgConnectOptions, config: &DatabaseConfig, name: &str) -> Self {
        let application_name = format!("{}-{}", config.application_name, name);
        let statement_timeout_ms = config.command_timeout().as_millis().to_string();
        let connect_options = base
            .clone()
            .application_name(&application_name)
            .options([("statement_timeout", statement_timeout_ms)]);

        Self {
            name: name.to_string(),
            application_name,
            max_size: config.max_pool_size,
            min_size: config.min_pool_size,
            incr_size: config.incr_pool_size,
            decr_size: config.decr_pool_size,
            lifetime: config.connection_lifetime(),
            validate: config.validate_connection,
            command_timeout: config.command_timeout(),
            connect_options,
        }
    }

    /// Build a lazily connecting pool
    ///
    /// No connection is opened here; the first acquire (or the minimum-size
    /// maintenance task) connects. Must be called within a Tokio runtime.
    #[must_use]
    pub fn build_pool(&self) -> PgPool {
        PgPoolOptions::new()
            .max_connections(self.max_size)
            .min_connections(self.min_size)
            .max_lifetime(self.lifetime)
            .test_before_acquire(self.validate)
            .acquire_timeout(self.command_timeout)
            .connect_lazy_with(self.connect_options.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_base_rejects_garbage() {
        let err = parse_base("not a url at all").unwrap_err();
        assert!(matches!(err, PoolError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_descriptors_have_distinct_identity() {
        let config = DatabaseConfig::default();
        let base = parse_base(&config.connection_string).unwrap();

        let a = PoolDescriptor::derive(&base, &config, "pool_1");
        let b = PoolDescriptor::derive(&base, &config, "pool_2");

        assert_eq!(a.application_name, "ibftgate-pool_1");
        assert_eq!(b.application_name, "ibftgate-pool_2");
        assert_eq!(a.max_size, config.max_pool_size);
        assert_eq!(a.min_size, config.min_pool_size);
        assert_eq!(a.command_timeout, config.command_timeout());
    }
}
