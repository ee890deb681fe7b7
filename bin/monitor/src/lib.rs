//! Binary-crate glue: configuration loading, tracing setup and the
//! `ChainCore` that wires every component crate into one running pipeline.

pub mod config;
pub mod core;
pub mod tracing_util;

/// Aggregates the fatal-at-startup errors from every component crate, the
/// same layering the teacher's per-provider errors feed into a
/// pipeline-level error kind.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Rpc(#[from] evm_monitor_rpc::RpcError),
    #[error(transparent)]
    Outbox(#[from] evm_monitor_outbox::OutboxError),
}

impl MonitorError {
    /// Exit code for this error, matching §6: configuration problems exit 2,
    /// everything else that aborts startup exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            MonitorError::Config(_) => 2,
            _ => 1,
        }
    }
}
