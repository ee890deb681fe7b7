//! Tracing subscriber setup, following `bin/host/src/cli/tracing_util`'s
//! verbosity-count convention.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. `-v`/`-vv`/`-vvv` raise the
/// default level; `RUST_LOG` always takes precedence when set.
pub fn init_tracing_subscriber(verbosity: u8) -> anyhow::Result<()> {
    let default_level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let filter = EnvFilter::builder().with_default_directive(default_level.into()).from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(filter).try_init().map_err(|e| anyhow::anyhow!(e))
}
