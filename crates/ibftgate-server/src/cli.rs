//! Command-line arguments for the `ibftgate` binary

use std::path::PathBuf;

use clap::Parser;
use ibftgate_core::GatewayConfig;

/// IBFT gateway command line
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "ibftgate",
    version,
    about = "TCP gateway for IBFT transactions with admission control and pooled backends."
)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "IBFTGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the listening port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the bind address
    #[arg(long)]
    pub bind: Option<String>,

    /// Override the connection ceiling
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Override the log filter, e.g. `info` or `ibftgate=debug`
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Load the configuration, apply command-line overrides, then validate
    ///
    /// An override can repair a value the file gets wrong.
    pub fn load_config(&self) -> ibftgate_core::Result<GatewayConfig> {
        let mut config = GatewayConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides to `config`
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(bind) = &self.bind {
            config.listener.bind_address.clone_from(bind);
        }
        if let Some(max) = self.max_connections {
            config.listener.max_connections = max;
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}
