//! Process-local metrics for one monitor run.
//!
//! Registered `prometheus` vectors for scraping, the same crate choice the
//! teacher uses for ambient observability, plus a [`StatsReporter`] that
//! renders the same counters to the log at a fixed interval for operators
//! without a scrape target.
//!
//! Grounded on the teacher's `crates/providers-alloy/src/metrics.rs`
//! (`lazy_static!` + `register_counter_vec!`/`register_histogram_vec!`) and
//! on `evm_transfer_monitor/reports/statistics_reporter.py` for which
//! figures a human-readable report needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    CounterVec, HistogramVec, IntCounter, IntCounterVec,
};

const RESPONSE_TIME_BUCKETS: &[f64; 10] =
    &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

lazy_static! {
    pub static ref BLOCKS_PROCESSED: IntCounter =
        register_int_counter!("evm_monitor_blocks_processed", "Blocks walked by the head loop")
            .expect("blocks_processed registers");

    pub static ref TX_ACCEPTED: IntCounterVec = register_int_counter_vec!(
        "evm_monitor_tx_accepted",
        "Transfers accepted by the policy filter, by asset symbol",
        &["symbol"]
    )
    .expect("tx_accepted registers");

    pub static ref TX_TOTAL: IntCounter =
        register_int_counter!("evm_monitor_tx_total", "Transactions scanned")
            .expect("tx_total registers");

    pub static ref TOKEN_CONTRACTS_DETECTED: IntCounter = register_int_counter!(
        "evm_monitor_token_contracts_detected",
        "Calls to a known token contract address"
    )
    .expect("token_contracts_detected registers");

    pub static ref TOKEN_TRANSACTIONS_PROCESSED: IntCounter = register_int_counter!(
        "evm_monitor_token_transactions_processed",
        "Token contract calls successfully decoded as transfer()"
    )
    .expect("token_transactions_processed registers");

    pub static ref RPC_CALLS: IntCounterVec = register_int_counter_vec!(
        "evm_monitor_rpc_calls",
        "RPC gateway calls, by kind",
        &["kind"]
    )
    .expect("rpc_calls registers");

    pub static ref CACHE_HITS: IntCounter =
        register_int_counter!("evm_monitor_cache_hits", "Head cache hits").expect("cache_hits registers");

    pub static ref CACHE_MISSES: IntCounter =
        register_int_counter!("evm_monitor_cache_misses", "Head cache misses")
            .expect("cache_misses registers");

    pub static ref CONFIRMATIONS: IntCounter = register_int_counter!(
        "evm_monitor_confirmations",
        "Transfers that reached the required confirmation depth"
    )
    .expect("confirmations registers");

    pub static ref TIMEOUTS: IntCounter = register_int_counter!(
        "evm_monitor_timeouts",
        "Pending transfers age-evicted without reaching confirmation"
    )
    .expect("timeouts registers");

    pub static ref NOTIFICATIONS_SENT: IntCounter =
        register_int_counter!("evm_monitor_notifications_sent", "Webhook deliveries that succeeded")
            .expect("notifications_sent registers");

    pub static ref NOTIFICATIONS_FAILED: IntCounter = register_int_counter!(
        "evm_monitor_notifications_failed",
        "Webhook deliveries that exhausted their retry budget"
    )
    .expect("notifications_failed registers");

    pub static ref NOTIFICATION_RETRIES: IntCounter = register_int_counter!(
        "evm_monitor_notification_retries",
        "Webhook delivery attempts beyond the first"
    )
    .expect("notification_retries registers");

    pub static ref PROCESSING_TIME: HistogramVec = register_histogram_vec!(
        "evm_monitor_processing_time_seconds",
        "Wall time to process one batch of new blocks",
        &["chain"],
        RESPONSE_TIME_BUCKETS.to_vec()
    )
    .expect("processing_time registers");

    pub static ref PROVIDER_CALLS: CounterVec = register_counter_vec!(
        "evm_monitor_provider_calls",
        "RPC gateway method calls",
        &["method"]
    )
    .expect("provider_calls registers");
}

/// Increments a registered [`IntCounter`]. Mirrors the teacher's `inc!` macro
/// pattern but as a plain function — this crate has no feature-gated build,
/// so there is nothing for a macro to conditionally compile away.
pub fn inc(counter: &IntCounter) {
    counter.inc();
}

/// Peak tracking the Python reporter keeps (`peak_rpc_rate`,
/// `peak_pending_count`) that doesn't map to a monotone Prometheus counter.
#[derive(Debug, Default)]
pub struct PeakTracker {
    peak_rpc_per_second: AtomicU64,
    peak_pending_count: AtomicU64,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_rpc_rate(&self, rate: f64) {
        self.peak_rpc_per_second.fetch_max(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn observe_pending_count(&self, count: u64) {
        self.peak_pending_count.fetch_max(count, Ordering::Relaxed);
    }

    pub fn peak_rpc_per_second(&self) -> f64 {
        f64::from_bits(self.peak_rpc_per_second.load(Ordering::Relaxed))
    }

    pub fn peak_pending_count(&self) -> u64 {
        self.peak_pending_count.load(Ordering::Relaxed)
    }
}

/// Renders the counters above to the log at a fixed cadence.
///
/// Grounded on `StatisticsReporter.log_performance_stats` /
/// `log_final_stats`: one condensed `info!` line per tick instead of the
/// original's multi-line breakdown, since `tracing` lines are structured
/// fields rather than a free-form report.
#[derive(Debug)]
pub struct StatsReporter {
    started_at: Instant,
    peaks: PeakTracker,
}

impl Default for StatsReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsReporter {
    pub fn new() -> Self {
        Self { started_at: Instant::now(), peaks: PeakTracker::new() }
    }

    pub fn peaks(&self) -> &PeakTracker {
        &self.peaks
    }

    /// Logs one stats line. Called by the head loop at `stats_log_interval`
    /// and once more on graceful shutdown for the final report.
    pub fn log_tick(&self, chain_name: &str, pending_count: u64, current_block: u64) {
        let runtime = self.started_at.elapsed();
        let rpc_calls: u64 = RPC_CALLS.with_label_values(&["head"]).get()
            + RPC_CALLS.with_label_values(&["block"]).get()
            + RPC_CALLS.with_label_values(&["gas_price"]).get()
            + RPC_CALLS.with_label_values(&["other"]).get();
        let cache_hits = CACHE_HITS.get();
        let cache_misses = CACHE_MISSES.get();
        let total_cache_lookups = cache_hits + cache_misses;
        let cache_hit_rate = if total_cache_lookups > 0 {
            cache_hits as f64 / total_cache_lookups as f64 * 100.0
        } else {
            0.0
        };
        self.peaks.observe_pending_count(pending_count);

        tracing::info!(
            chain = chain_name,
            runtime_secs = runtime.as_secs(),
            block = current_block,
            blocks_processed = BLOCKS_PROCESSED.get(),
            tx_total = TX_TOTAL.get(),
            pending = pending_count,
            rpc_calls,
            cache_hit_rate_pct = format!("{cache_hit_rate:.1}"),
            confirmations = CONFIRMATIONS.get(),
            timeouts = TIMEOUTS.get(),
            notifications_sent = NOTIFICATIONS_SENT.get(),
            notifications_failed = NOTIFICATIONS_FAILED.get(),
            "stats"
        );
    }

    pub fn log_final(&self, chain_name: &str) {
        tracing::info!(
            chain = chain_name,
            runtime_secs = self.started_at.elapsed().as_secs(),
            blocks_processed = BLOCKS_PROCESSED.get(),
            tx_total = TX_TOTAL.get(),
            confirmations = CONFIRMATIONS.get(),
            timeouts = TIMEOUTS.get(),
            notifications_sent = NOTIFICATIONS_SENT.get(),
            notifications_failed = NOTIFICATIONS_FAILED.get(),
            peak_rpc_per_second = format!("{:.2}", self.peaks.peak_rpc_per_second()),
            peak_pending_count = self.peaks.peak_pending_count(),
            "final stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracker_keeps_the_maximum() {
        let peaks = PeakTracker::new();
        peaks.observe_rpc_rate(1.5);
        peaks.observe_rpc_rate(0.5);
        assert_eq!(peaks.peak_rpc_per_second(), 1.5);

        peaks.observe_pending_count(3);
        peaks.observe_pending_count(9);
        peaks.observe_pending_count(2);
        assert_eq!(peaks.peak_pending_count(), 9);
    }

    #[test]
    fn reporter_does_not_panic_on_empty_state() {
        let reporter = StatsReporter::new();
        reporter.log_tick("test-chain", 0, 0);
        reporter.log_final("test-chain");
    }
}
