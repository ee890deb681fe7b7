//! Large-amount and watched-address filtering.
//!
//! A [`MonitorPolicy`] is one of two mutually exclusive strategies, matching
//! `monitor.strategy` in the chain catalog (`large_amount` or
//! `watch_address`). It is hot-swappable: a swap takes effect for the next
//! transfer evaluated, already-pending transfers keep whatever verdict they
//! were given at classification time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bigdecimal::BigDecimal;
use evm_monitor_primitives::Transfer;
use tokio::sync::RwLock;

/// Shared, mutable set of lowercased recipient addresses of interest.
///
/// Written by the address registry listener (C8) and by admin RPC, read by
/// the policy filter (C3). A `tokio::sync::RwLock` gives O(1) average
/// lookups under many concurrent readers and rare writers.
#[derive(Debug, Clone, Default)]
pub struct WatchedSet(Arc<RwLock<HashSet<String>>>);

impl WatchedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_addresses(addresses: impl IntoIterator<Item = String>) -> Self {
        Self(Arc::new(RwLock::new(addresses.into_iter().collect())))
    }

    /// Inserts a lowercased address; returns `true` if it was newly added.
    pub async fn insert(&self, lowercased_address: String) -> bool {
        self.0.write().await.insert(lowercased_address)
    }

    pub async fn contains(&self, lowercased_address: &str) -> bool {
        self.0.read().await.contains(lowercased_address)
    }

    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }
}

/// The active filtering strategy for one chain core.
///
/// Exactly one variant is active at a time; `Arc<RwLock<MonitorPolicy>>` is
/// how callers hot-swap it (see `crates/rpc` head loop wiring).
#[derive(Debug, Clone)]
pub enum MonitorPolicy {
    /// Accept transfers whose amount is at or above the per-symbol
    /// threshold. A symbol with no configured threshold is treated as an
    /// infinite threshold, i.e. always rejected.
    LargeAmount { thresholds: HashMap<String, BigDecimal> },
    /// Accept transfers whose lowercased recipient is in the watched set.
    WatchAddress { watched: WatchedSet },
}

impl MonitorPolicy {
    pub fn large_amount(thresholds: HashMap<String, BigDecimal>) -> Self {
        Self::LargeAmount { thresholds }
    }

    pub fn watch_address(watched: WatchedSet) -> Self {
        Self::WatchAddress { watched }
    }

    /// Evaluates whether `transfer` should proceed to confirmation tracking.
    ///
    /// Self-transfers are rejected regardless of strategy; the decoder
    /// already filters most of these out, this is a second, independent
    /// check per the invariant that `from == to` is never notified.
    pub async fn accept(&self, transfer: &Transfer) -> bool {
        if transfer.from_lower() == transfer.to_lower() {
            return false;
        }
        match self {
            MonitorPolicy::LargeAmount { thresholds } => match thresholds.get(&transfer.asset_symbol) {
                Some(threshold) => &transfer.amount >= threshold,
                None => false,
            },
            MonitorPolicy::WatchAddress { watched } => watched.contains(&transfer.to_lower()).await,
        }
    }
}
