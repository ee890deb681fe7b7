//! Wires the component crates into one running chain core: the head loop,
//! the webhook dispatcher's inline and background tasks, the address
//! registry listener, and a stats reporter, following §5's four
//! cooperating tasks per chain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use evm_monitor_confirmation::ConfirmationTracker;
use evm_monitor_metrics::StatsReporter;
use evm_monitor_outbox::{OutboxStore, PgOutboxStore};
use evm_monitor_pending::PendingIndex;
use evm_monitor_policy::{MonitorPolicy, WatchedSet};
use evm_monitor_primitives::ChainConfig;
use evm_monitor_registry::AddressRegistryListener;
use evm_monitor_rpc::{AlloyRpcGateway, Block, ChainRpc, RpcError};
use evm_monitor_webhook::WebhookDispatcher;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, MonitorStrategy};
use crate::MonitorError;

/// One running instance of the pipeline, scoped to a single chain.
pub struct ChainCore {
    chain_name: String,
    chain_cfg: ChainConfig,
    rpc: Arc<dyn ChainRpc>,
    outbox: Arc<dyn OutboxStore>,
    policy: MonitorPolicy,
    pending: Arc<Mutex<PendingIndex>>,
    confirmation: ConfirmationTracker,
    confirmation_check_interval: Duration,
    webhook: Arc<WebhookDispatcher>,
    notification_rx: Option<mpsc::Receiver<evm_monitor_outbox::NotificationJob>>,
    registry: Option<Arc<AddressRegistryListener>>,
    stats: Arc<StatsReporter>,
    stats_log_interval: Duration,
    current_block: Arc<AtomicU64>,
}

impl ChainCore {
    /// Builds a core backed by the real RPC gateway and a live Postgres
    /// pool. The production entrypoint.
    pub async fn build(app: AppConfig, database_url: &str) -> Result<Self, MonitorError> {
        let rpc: Arc<dyn ChainRpc> =
            Arc::new(AlloyRpcGateway::new(&app.chain.rpc_url, app.max_rpc_per_second, app.max_rpc_per_day)?);

        let outbox_store = PgOutboxStore::connect(database_url).await?;
        outbox_store.migrate().await?;
        let outbox: Arc<dyn OutboxStore> = Arc::new(outbox_store);

        Ok(Self::new(app, rpc, outbox))
    }

    /// Builds a core from already-constructed RPC and outbox
    /// implementations, so scenario tests can substitute mocks for both
    /// without touching a live chain or database.
    pub fn new(app: AppConfig, rpc: Arc<dyn ChainRpc>, outbox: Arc<dyn OutboxStore>) -> Self {
        let watched = WatchedSet::new();
        let policy = app.strategy.clone().into_policy(watched.clone());

        let pending = Arc::new(Mutex::new(PendingIndex::new()));
        let (notification_tx, notification_rx) = mpsc::channel(256);

        let confirmation = ConfirmationTracker::new(
            app.chain.chain_name.clone(),
            rpc.clone(),
            outbox.clone(),
            pending.clone(),
            notification_tx,
            app.chain.required_confirmations,
            app.transaction_timeout,
        );

        let webhook = Arc::new(WebhookDispatcher::new(app.webhook.clone(), outbox.clone()));

        let registry = match app.strategy {
            MonitorStrategy::WatchAddress => {
                Some(Arc::new(AddressRegistryListener::new(app.amqp_url.clone(), app.chain.chain_name.clone(), watched)))
            }
            MonitorStrategy::LargeAmount(_) => None,
        };

        Self {
            chain_name: app.chain.chain_name.clone(),
            chain_cfg: app.chain,
            rpc,
            outbox,
            policy,
            pending,
            confirmation,
            confirmation_check_interval: app.confirmation_check_interval,
            webhook,
            notification_rx: Some(notification_rx),
            registry,
            stats: Arc::new(StatsReporter::new()),
            stats_log_interval: app.stats_log_interval,
            current_block: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Seeds the last-processed-block bookmark directly, so scenario tests
    /// can start ingestion right before the block under test instead of
    /// walking from genesis.
    pub fn seed_last_processed_block(&self, block_number: u64) {
        self.current_block.store(block_number, Ordering::Relaxed);
    }

    /// Hands ownership of the notification channel's receiving half to the
    /// caller, so tests can drive the webhook dispatcher directly instead of
    /// spawning the full `run()` task set.
    pub fn take_notification_receiver(&mut self) -> mpsc::Receiver<evm_monitor_outbox::NotificationJob> {
        self.notification_rx.take().expect("notification receiver already taken")
    }

    pub fn webhook(&self) -> Arc<WebhookDispatcher> {
        self.webhook.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// The watched set backing a `watch_address` strategy, if that's the
    /// active policy. Lets scenario tests grow the set the way C8 would,
    /// without a live AMQP broker.
    pub fn watched_set(&self) -> Option<WatchedSet> {
        match &self.policy {
            MonitorPolicy::WatchAddress { watched } => Some(watched.clone()),
            MonitorPolicy::LargeAmount { .. } => None,
        }
    }

    /// Runs until `shutdown` is cancelled (typically by Ctrl-C), then drains
    /// the head loop and joins every cooperating task.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        let webhook = self.webhook.clone();
        let notification_rx = self.notification_rx.take().expect("ChainCore::run is only called once");
        let dispatch_shutdown = shutdown.clone();
        tasks.spawn(async move { webhook.run(notification_rx, dispatch_shutdown).await });

        let retry_webhook = self.webhook.clone();
        let retry_shutdown = shutdown.clone();
        tasks.spawn(async move { retry_webhook.retry_loop(retry_shutdown).await });

        if let Some(registry) = self.registry.clone() {
            let registry_shutdown = shutdown.clone();
            tasks.spawn(async move { registry.run(registry_shutdown).await });
        } else {
            tracing::info!(chain = %self.chain_name, "large_amount strategy selected, address registry listener not started");
        }

        let stats = self.stats.clone();
        let pending_for_stats = self.pending.clone();
        let current_block_for_stats = self.current_block.clone();
        let chain_name_for_stats = self.chain_name.clone();
        let stats_interval = self.stats_log_interval;
        let stats_shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(stats_interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    biased;
                    _ = stats_shutdown.cancelled() => {
                        stats.log_final(&chain_name_for_stats);
                        return;
                    }
                    _ = ticker.tick() => {
                        let pending_count = pending_for_stats.lock().await.len() as u64;
                        stats.log_tick(&chain_name_for_stats, pending_count, current_block_for_stats.load(Ordering::Relaxed));
                    }
                }
            }
        });

        self.head_loop(shutdown.clone()).await;
        shutdown.cancel();

        while tasks.join_next().await.is_some() {}
    }

    async fn head_loop(&self, shutdown: CancellationToken) {
        // S_init: block until the RPC endpoint answers, or we're told to stop.
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let health = self.rpc.test_connection(&self.chain_name).await;
            if health.success {
                break;
            }
            tracing::warn!(chain = %self.chain_name, error = ?health.error, "rpc connectivity check failed, retrying");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        }

        // S_catchup -> S_tailing: both are the same loop body, distinguished
        // only by how far the last-processed block trails the chain head.
        match self.rpc.head().await {
            Ok(head) => self.current_block.store(head, Ordering::Relaxed),
            Err(err) => {
                tracing::error!(chain = %self.chain_name, error = %err, "failed to read initial chain head, aborting chain core");
                return;
            }
        };

        let mut last_confirmation_tick = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let cycle_start = Instant::now();

            self.ingest_new_blocks().await;

            evm_monitor_metrics::PROCESSING_TIME
                .with_label_values(&[self.chain_name.as_str()])
                .observe(cycle_start.elapsed().as_secs_f64());

            if last_confirmation_tick.elapsed() >= self.confirmation_check_interval {
                self.run_confirmation_tick().await;
                last_confirmation_tick = Instant::now();
            }

            let elapsed = cycle_start.elapsed();
            let sleep_for = if elapsed > self.chain_cfg.block_time {
                tracing::warn!(chain = %self.chain_name, elapsed_ms = elapsed.as_millis(), "head loop cycle exceeded block time");
                Duration::from_millis(100)
            } else {
                Duration::from_secs(1).checked_sub(elapsed).unwrap_or(Duration::from_millis(100)).max(Duration::from_millis(100))
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        // S_draining: one final confirmation pass to catch anything that
        // crossed the confirmation depth between the last tick and shutdown.
        self.run_confirmation_tick().await;
    }

    /// Fetches the current head and walks every block since the
    /// last-processed one in ascending order, per §4.9 step 2. Exposed for
    /// scenario tests to drive deterministically without the loop's
    /// sleep-based pacing.
    pub async fn ingest_new_blocks(&self) {
        let last = self.current_block.load(Ordering::Relaxed);
        match self.rpc.head().await {
            Ok(cur) => {
                let mut n = last + 1;
                while n <= cur {
                    match self.rpc.block(n).await {
                        Ok(block) => {
                            self.ingest_block(&block).await;
                            evm_monitor_metrics::inc(&evm_monitor_metrics::BLOCKS_PROCESSED);
                            self.current_block.store(n, Ordering::Relaxed);
                            n += 1;
                        }
                        Err(RpcError::BlockNotFound(_)) => {
                            tracing::debug!(chain = %self.chain_name, block_number = n, "block not yet produced");
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(chain = %self.chain_name, block_number = n, error = %err, "error fetching block, retrying next tick");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(chain = %self.chain_name, error = %err, "failed to fetch chain head");
            }
        }
    }

    /// Runs one confirmation-depth pass (§4.9 step 3), logging rather than
    /// propagating failures since a single failed tick must not stop the
    /// rest of the pipeline.
    pub async fn run_confirmation_tick(&self) {
        if let Err(err) = self.confirmation.tick().await {
            tracing::error!(chain = %self.chain_name, error = %err, "confirmation tick failed");
        }
    }

    async fn ingest_block(&self, block: &Block) {
        let found_at = Utc::now();
        for tx in &block.transactions {
            let Some(transfer) = evm_monitor_decoder::decode(tx, &self.chain_cfg, found_at) else {
                continue;
            };
            evm_monitor_metrics::inc(&evm_monitor_metrics::TX_TOTAL);
            if !transfer.is_native {
                evm_monitor_metrics::inc(&evm_monitor_metrics::TOKEN_TRANSACTIONS_PROCESSED);
                evm_monitor_metrics::inc(&evm_monitor_metrics::TOKEN_CONTRACTS_DETECTED);
            }

            if !self.policy.accept(&transfer).await {
                continue;
            }
            evm_monitor_metrics::TX_ACCEPTED.with_label_values(&[transfer.asset_symbol.as_str()]).inc();

            if let Err(err) = self.outbox.upsert_pending(&transfer).await {
                tracing::error!(chain = %self.chain_name, tx_hash = %transfer.tx_hash_hex(), error = %err, "failed to upsert deposit record");
                continue;
            }
            self.pending.lock().await.insert(transfer);
        }
    }
}
