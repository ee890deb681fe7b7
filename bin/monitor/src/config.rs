//! Chain-catalog TOML configuration loader.
//!
//! Mirrors `monitor.toml`'s nested tables straight into Rust structs via
//! `serde`, the same shape the teacher's CLI configs use, then converts the
//! raw catalog into the domain types each component crate actually wants
//! (`evm_monitor_primitives::ChainConfig`, `evm_monitor_policy::MonitorPolicy`,
//! `evm_monitor_webhook::WebhookConfig`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use alloy_primitives::Address;
use bigdecimal::BigDecimal;
use evm_monitor_policy::{MonitorPolicy, WatchedSet};
use evm_monitor_primitives::{ChainConfig, TokenConfig};
use evm_monitor_webhook::WebhookConfig;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("unknown chain {0:?}; not present in the chain catalog")]
    UnknownChain(String),
    #[error("invalid token address for {symbol} on {chain}: {reason}")]
    InvalidTokenAddress { chain: String, symbol: String, reason: String },
    #[error("monitor.strategy must be \"large_amount\" or \"watch_address\", got {0:?}")]
    InvalidStrategy(String),
}

#[derive(Debug, Deserialize)]
struct RawChain {
    rpc_url: String,
    #[serde(default)]
    scan_url: String,
    #[serde(default = "default_native_symbol")]
    native_symbol: String,
    #[serde(default = "default_block_time_secs")]
    block_time: u64,
    confirmation_blocks: Option<u64>,
    usdt_contract: Option<String>,
    #[serde(default = "default_token_decimals")]
    usdt_decimals: u32,
    usdc_contract: Option<String>,
    #[serde(default = "default_token_decimals")]
    usdc_decimals: u32,
}

fn default_token_decimals() -> u32 {
    18
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

fn default_block_time_secs() -> u64 {
    12
}

#[derive(Debug, Deserialize, Default)]
struct RawMonitor {
    required_confirmations: Option<u64>,
    #[serde(default = "default_confirmation_check_interval")]
    confirmation_check_interval: u64,
    #[serde(default = "default_cache_ttl")]
    cache_ttl: u64,
    #[serde(default = "default_transaction_timeout")]
    transaction_timeout: u64,
    #[serde(default = "default_max_rpc_per_second")]
    max_rpc_per_second: f64,
    #[serde(default = "default_max_rpc_per_day")]
    max_rpc_per_day: f64,
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default)]
    thresholds: HashMap<String, String>,
    #[serde(default = "default_stats_log_interval")]
    stats_log_interval: u64,
}

fn default_confirmation_check_interval() -> u64 {
    10
}
fn default_cache_ttl() -> u64 {
    2
}
fn default_transaction_timeout() -> u64 {
    3600
}
fn default_max_rpc_per_second() -> f64 {
    10.0
}
fn default_max_rpc_per_day() -> f64 {
    100_000.0
}
fn default_strategy() -> String {
    "large_amount".to_string()
}
fn default_stats_log_interval() -> u64 {
    300
}

#[derive(Debug, Deserialize, Default)]
struct RawRabbitMq {
    #[serde(default = "default_rabbitmq_host")]
    host: String,
    #[serde(default = "default_rabbitmq_port")]
    port: u16,
    #[serde(default = "default_rabbitmq_user")]
    user: String,
    #[serde(default, alias = "pass")]
    password: String,
}

fn default_rabbitmq_host() -> String {
    "localhost".to_string()
}
fn default_rabbitmq_port() -> u16 {
    5672
}
fn default_rabbitmq_user() -> String {
    "guest".to_string()
}

impl RawRabbitMq {
    fn url(&self) -> String {
        format!("amqp://{}:{}@{}:{}/%2f", self.user, self.password, self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawNotification {
    #[serde(default)]
    url: String,
    #[serde(default = "default_notification_timeout")]
    timeout: u64,
    #[serde(default = "default_retry_times")]
    retry_times: i32,
    #[serde(default = "default_retry_delay")]
    retry_delay: u64,
}

fn default_notification_timeout() -> u64 {
    30
}
fn default_retry_times() -> i32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    /// Default chain when none is given on the CLI; the binary always takes
    /// an explicit positional `<chain_name>`, so this is accepted for
    /// catalog-file compatibility but otherwise unused.
    #[serde(default)]
    #[allow(dead_code)]
    active_chain: Option<String>,
    chains: HashMap<String, RawChain>,
    #[serde(default)]
    monitor: RawMonitor,
    #[serde(default)]
    rabbitmq: RawRabbitMq,
    #[serde(default)]
    notification: RawNotification,
}

/// Everything the binary needs to run one chain core, resolved from the
/// catalog for the single chain selected on the command line.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub chain: ChainConfig,
    pub confirmation_check_interval: Duration,
    pub cache_ttl: Duration,
    pub transaction_timeout: Duration,
    pub max_rpc_per_second: f64,
    pub max_rpc_per_day: f64,
    pub stats_log_interval: Duration,
    pub strategy: MonitorStrategy,
    pub amqp_url: String,
    pub webhook: WebhookConfig,
}

/// Resolved policy strategy, not yet turned into a [`MonitorPolicy`] — the
/// `WatchAddress` variant needs a [`WatchedSet`] handle that the binary
/// shares with the registry listener, so construction happens one level up.
#[derive(Debug, Clone)]
pub enum MonitorStrategy {
    LargeAmount(HashMap<String, BigDecimal>),
    WatchAddress,
}

impl MonitorStrategy {
    pub fn into_policy(self, watched: WatchedSet) -> MonitorPolicy {
        match self {
            MonitorStrategy::LargeAmount(thresholds) => MonitorPolicy::large_amount(thresholds),
            MonitorStrategy::WatchAddress => MonitorPolicy::watch_address(watched),
        }
    }
}

impl AppConfig {
    /// Loads `path`, then resolves the catalog down to the single
    /// `chain_name` requested on the CLI. An unknown chain name is a fatal
    /// `ConfigError` (exit code 2 from `main`).
    pub fn load(path: &Path, chain_name: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let raw: RawConfig = toml::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;

        let raw_chain = raw
            .chains
            .get(chain_name)
            .ok_or_else(|| ConfigError::UnknownChain(chain_name.to_string()))?;

        let mut tokens = HashMap::new();
        if let Some(addr) = &raw_chain.usdt_contract {
            insert_token(&mut tokens, chain_name, "USDT", addr, raw_chain.usdt_decimals)?;
        }
        if let Some(addr) = &raw_chain.usdc_contract {
            insert_token(&mut tokens, chain_name, "USDC", addr, raw_chain.usdc_decimals)?;
        }

        let required_confirmations = raw_chain.confirmation_blocks.or(raw.monitor.required_confirmations).unwrap_or(12);

        let chain = ChainConfig {
            chain_name: chain_name.to_string(),
            rpc_url: raw_chain.rpc_url.clone(),
            scan_url: raw_chain.scan_url.clone(),
            native_symbol: raw_chain.native_symbol.clone(),
            block_time: Duration::from_secs(raw_chain.block_time),
            required_confirmations,
            tokens,
        };

        let strategy = match raw.monitor.strategy.as_str() {
            "large_amount" => {
                let mut thresholds = HashMap::new();
                for (symbol, value) in &raw.monitor.thresholds {
                    let parsed: BigDecimal = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidStrategy(format!("threshold {value:?} for {symbol}")))?;
                    thresholds.insert(symbol.clone(), parsed);
                }
                MonitorStrategy::LargeAmount(thresholds)
            }
            "watch_address" => MonitorStrategy::WatchAddress,
            other => return Err(ConfigError::InvalidStrategy(other.to_string())),
        };

        let webhook = WebhookConfig {
            url: raw.notification.url.clone(),
            timeout: Duration::from_secs(raw.notification.timeout),
            max_attempts: raw.notification.retry_times,
            inline_retry_delay: Duration::from_secs(raw.notification.retry_delay),
            background_retry_delay: Duration::from_secs(raw.notification.retry_delay * 60),
            ..WebhookConfig::default()
        };

        Ok(Self {
            chain,
            confirmation_check_interval: Duration::from_secs(raw.monitor.confirmation_check_interval),
            cache_ttl: Duration::from_secs(raw.monitor.cache_ttl),
            transaction_timeout: Duration::from_secs(raw.monitor.transaction_timeout),
            max_rpc_per_second: raw.monitor.max_rpc_per_second,
            max_rpc_per_day: raw.monitor.max_rpc_per_day,
            stats_log_interval: Duration::from_secs(raw.monitor.stats_log_interval),
            strategy,
            amqp_url: raw.rabbitmq.url(),
            webhook,
        })
    }
}

fn insert_token(
    tokens: &mut HashMap<String, TokenConfig>,
    chain_name: &str,
    symbol: &str,
    address_hex: &str,
    decimals: u32,
) -> Result<(), ConfigError> {
    let address: Address = address_hex.parse().map_err(|source| ConfigError::InvalidTokenAddress {
        chain: chain_name.to_string(),
        symbol: symbol.to_string(),
        reason: format!("{source}"),
    })?;
    if decimals > 30 {
        tracing::warn!(chain = chain_name, symbol, decimals, "token decimals look implausible");
    }
    tokens.insert(symbol.to_string(), TokenConfig { symbol: symbol.to_string(), address, decimals });
    Ok(())
}
