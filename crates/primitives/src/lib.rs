//! Shared data types for the EVM transfer monitor.
//!
//! Every other crate in the workspace speaks in terms of [`ChainConfig`],
//! [`RawTx`] and [`Transfer`]; none of them know how blocks are fetched,
//! decoded, filtered or persisted.

use std::{collections::HashMap, time::Duration};

use alloy_primitives::{Address, Bytes, B256, U256};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Returns the lowercased, `0x`-prefixed hex representation of an address.
///
/// The spec requires addresses to be compared and stored lowercased; alloy's
/// default `Display` impl for [`Address`] is EIP-55 checksummed, so callers
/// must go through this helper rather than `to_string()`.
pub fn lower_hex(address: &Address) -> String {
    format!("{address:#x}")
}

/// A single known token contract for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Display symbol, e.g. `"USDT"`.
    pub symbol: String,
    /// Contract address.
    pub address: Address,
    /// Number of decimals used to convert the raw integer amount.
    pub decimals: u32,
}

/// Immutable, per-chain configuration.
///
/// Constructed once at startup from the chain catalog and never mutated; the
/// only mutable runtime state associated with a chain is its
/// [`MonitorPolicy`](https://docs.rs/evm-monitor-policy) and watched set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_name: String,
    pub rpc_url: String,
    pub scan_url: String,
    pub native_symbol: String,
    /// Expected seconds per block; used only for head-loop pacing.
    pub block_time: Duration,
    /// `K` — required confirmations before a transfer is notified.
    pub required_confirmations: u64,
    /// Known ERC-20 contracts, keyed by symbol.
    pub tokens: HashMap<String, TokenConfig>,
}

impl ChainConfig {
    /// Looks up a known token contract by its on-chain address, case-insensitively.
    pub fn token_by_address(&self, address: Address) -> Option<&TokenConfig> {
        self.tokens.values().find(|t| t.address == address)
    }
}

/// Whatever the RPC gateway hands the decoder for one transaction.
///
/// Deliberately narrow: only the fields the decoder and classifier actually
/// read. Everything else the RPC response carries is dropped at the
/// gateway boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTx {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas: u64,
    pub gas_price: Option<U256>,
    pub input: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
}

/// The classifier's output: a candidate transfer, accepted or not yet
/// filtered by policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub tx_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub from: Address,
    pub to: Address,
    pub asset_symbol: String,
    /// Human-scale amount (`raw / 10^decimals`).
    pub amount: BigDecimal,
    pub is_native: bool,
    pub token_contract: Option<Address>,
    pub decimals: u32,
    pub gas_used: Option<u64>,
    pub gas_price: Option<BigDecimal>,
    pub fee: Option<BigDecimal>,
    pub found_at: DateTime<Utc>,
}

impl Transfer {
    /// Lowercased recipient address, the key used by watched-sets, outbox
    /// lookups and the default `user_id` derivation.
    pub fn to_lower(&self) -> String {
        lower_hex(&self.to)
    }

    /// Lowercased sender address.
    pub fn from_lower(&self) -> String {
        lower_hex(&self.from)
    }

    /// `tx_hash` rendered as the `CHAR(66)` form stored in the outbox.
    pub fn tx_hash_hex(&self) -> String {
        format!("{:#x}", self.tx_hash)
    }
}

/// Errors shared across crates that cannot be attributed to a single
/// component (most components define their own narrower error enum).
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("database initialization failed: {0}")]
    DbInit(String),
}
