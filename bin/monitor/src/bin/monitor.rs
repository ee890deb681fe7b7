//! Main entrypoint for the `evm-monitor` binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use evm_monitor::config::AppConfig;
use evm_monitor::core::ChainCore;
use evm_monitor::{tracing_util, MonitorError};
use tokio_util::sync::CancellationToken;

/// Watches a single chain's head for native and ERC-20 deposits, confirms
/// them, and delivers a webhook once a deposit is deep enough.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Chain to monitor; must be present in the chain catalog.
    chain_name: String,
    /// Path to the chain-catalog TOML file.
    #[arg(long, short = 'c', default_value = "config.toml")]
    config: PathBuf,
    /// Postgres connection string for the deposit/notification outbox.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Verbosity level (0-3).
    #[arg(long, short, action = ArgAction::Count)]
    v: u8,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = tracing_util::init_tracing_subscriber(cli.v) {
        eprintln!("failed to initialize tracing subscriber: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => {
            tracing::info!("evm-monitor exiting cleanly");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "evm-monitor exiting on fatal error");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), MonitorError> {
    let app = AppConfig::load(&cli.config, &cli.chain_name)?;
    let core = ChainCore::build(app, &cli.database_url).await?;

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, starting graceful shutdown");
            ctrl_c_token.cancel();
        }
    });

    core.run(shutdown).await;
    Ok(())
}
