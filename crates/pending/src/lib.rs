//! In-memory index of accepted transfers waiting for confirmation.
//!
//! Non-authoritative: the durable outbox (`evm-monitor-outbox`) is the
//! source of truth, this index only answers "which transfers are waiting
//! for confirmation in which block" cheaply, without a database round
//! trip, for the confirmation tracker's `tick()`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use evm_monitor_primitives::Transfer;

/// A block's worth of pending transfers, in first-seen order.
pub type Bucket = Vec<Transfer>;

/// Single-writer, block-bucketed pending index.
///
/// Not `Send`-shared: owned by the head loop / confirmation tracker, which
/// run on the same chain core and never access it concurrently. Snapshots
/// for read-only consumers are taken by cloning `by_block()`'s output.
#[derive(Debug, Default)]
pub struct PendingIndex {
    by_block: BTreeMap<u64, Bucket>,
}

impl PendingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a transfer into its block's bucket, preserving insertion order.
    pub fn insert(&mut self, transfer: Transfer) {
        self.by_block.entry(transfer.block_number).or_default().push(transfer);
    }

    /// Removes and returns an entire block's bucket, if present.
    pub fn remove_block(&mut self, block_number: u64) -> Option<Bucket> {
        self.by_block.remove(&block_number)
    }

    /// Evicts every transfer older than `age` (measured against `found_at`),
    /// returning the evicted transfers for the caller to log/count.
    ///
    /// Buckets that become empty are removed entirely; buckets with a
    /// partial eviction keep their remaining transfers in order.
    pub fn purge_older_than(&mut self, age: Duration) -> Vec<Transfer> {
        let now = Utc::now();
        let mut evicted = Vec::new();
        self.by_block.retain(|_, bucket| {
            let (stale, fresh): (Vec<_>, Vec<_>) = bucket.drain(..).partition(|t| {
                now.signed_duration_since(t.found_at)
                    .to_std()
                    .map(|elapsed| elapsed > age)
                    .unwrap_or(false)
            });
            evicted.extend(stale);
            *bucket = fresh;
            !bucket.is_empty()
        });
        evicted
    }

    /// Total number of transfers across all blocks.
    pub fn len(&self) -> usize {
        self.by_block.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of `(block_number, bucket)` pairs in ascending block order,
    /// the iteration order the confirmation tracker's ordering guarantee
    /// depends on.
    pub fn by_block(&self) -> impl Iterator<Item = (u64, &Bucket)> {
        self.by_block.iter().map(|(n, b)| (*n, b))
    }

    /// All pending transfers for a given asset symbol, across all blocks.
    pub fn by_type(&self, asset_symbol: &str) -> Vec<&Transfer> {
        self.by_block
            .values()
            .flatten()
            .filter(|t| t.asset_symbol == asset_symbol)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};
    use bigdecimal::BigDecimal;
    use chrono::Duration as ChronoDuration;

    fn transfer_at(block: u64, found_at_secs_ago: i64) -> Transfer {
        Transfer {
            tx_hash: b256!("1111111111111111111111111111111111111111111111111111111111111111"),
            block_number: block,
            block_hash: b256!("2222222222222222222222222222222222222222222222222222222222222222"),
            from: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            to: address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            asset_symbol: "USDT".into(),
            amount: BigDecimal::from(1),
            is_native: false,
            token_contract: Some(address!("cccccccccccccccccccccccccccccccccccccccc")),
            decimals: 18,
            gas_used: None,
            gas_price: None,
            fee: None,
            found_at: Utc::now() - ChronoDuration::seconds(found_at_secs_ago),
        }
    }

    #[test]
    fn insert_buckets_by_block_in_ascending_order() {
        let mut idx = PendingIndex::new();
        idx.insert(transfer_at(200, 0));
        idx.insert(transfer_at(100, 0));
        idx.insert(transfer_at(100, 0));

        let blocks: Vec<u64> = idx.by_block().map(|(n, _)| n).collect();
        assert_eq!(blocks, vec![100, 200]);
        assert_eq!(idx.len(), 3);
    }

    #[test]
    fn remove_block_takes_the_whole_bucket() {
        let mut idx = PendingIndex::new();
        idx.insert(transfer_at(100, 0));
        idx.insert(transfer_at(100, 0));
        let removed = idx.remove_block(100).expect("bucket present");
        assert_eq!(removed.len(), 2);
        assert!(idx.is_empty());
        assert!(idx.remove_block(100).is_none());
    }

    #[test]
    fn purge_older_than_evicts_stale_entries_only() {
        let mut idx = PendingIndex::new();
        idx.insert(transfer_at(100, 400));
        idx.insert(transfer_at(100, 10));
        idx.insert(transfer_at(101, 400));

        let evicted = idx.purge_older_than(Duration::from_secs(300));
        assert_eq!(evicted.len(), 2);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.by_block().next().unwrap().0, 100);
    }
}
