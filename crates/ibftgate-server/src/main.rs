use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use ibftgate_pool::PoolManager;
use ibftgate_server::{Cli, Listener, ServerError, ShutdownCause, init_tracing, wait_for_signal};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // the subscriber may not be installed yet
            eprintln!("ibftgate: {e}");
            tracing::error!(error = %e, "Gateway failed to start");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, ServerError> {
    let config = cli.load_config()?;
    init_tracing(&config.logging)?;
    tracing::info!(
        version = ibftgate_core::SERVICE_VERSION,
        pools = config.database.number_of_pools,
        "Starting {}",
        ibftgate_core::SERVICE_NAME
    );

    let pools = Arc::new(PoolManager::new(config.database.clone()));
    pools.initialize()?;

    let token = CancellationToken::new();
    let probe = pools.spawn_health_probe(token.child_token());

    let listener = Listener::bind(config.listener, Arc::clone(&pools)).await?;

    let signal_token = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    let report = listener.run(token.clone()).await;
    token.cancel();
    if let Some(probe) = probe {
        let _ = probe.await;
    }

    Ok(match report.cause {
        ShutdownCause::Requested => ExitCode::SUCCESS,
        ShutdownCause::ListenerFailed(reason) => {
            tracing::error!(%reason, "Gateway stopped after listener failure");
            ExitCode::FAILURE
        }
    })
}
