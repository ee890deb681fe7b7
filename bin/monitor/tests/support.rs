//! Shared test doubles for the chain-core scenario tests.
//!
//! `MockRpc` and `InMemoryOutbox` stand in for `AlloyRpcGateway` and
//! `PgOutboxStore` so `ChainCore::new` can be driven end to end without a
//! live chain or a Postgres instance, reproducing the same query semantics
//! `PgOutboxStore` implements against real tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evm_monitor_outbox::{
    DepositRecord, NotificationPayload, NotificationRecord, OutboxError, OutboxStore,
};
use evm_monitor_primitives::Transfer;
use evm_monitor_rpc::{Block, CallKind, ChainRpc, Health, RpcError};

/// A chain whose head and block contents are set directly by the test,
/// rather than fetched over JSON-RPC.
#[derive(Default)]
pub struct MockRpc {
    head: AtomicU64,
    blocks: StdMutex<HashMap<u64, Block>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, number: u64) {
        self.head.store(number, Ordering::SeqCst);
    }

    pub fn insert_block(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn head(&self) -> Result<u64, RpcError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<Block, RpcError> {
        self.blocks.lock().unwrap().get(&number).cloned().ok_or(RpcError::BlockNotFound(number))
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        Ok(U256::ZERO)
    }

    async fn test_connection(&self, chain_name: &str) -> Health {
        Health {
            success: true,
            latest_block: Some(self.head.load(Ordering::SeqCst)),
            gas_price_gwei: Some(0.0),
            network: chain_name.to_string(),
            rpc_url: "mock://rpc".to_string(),
            error: None,
        }
    }

    fn call_counts(&self) -> Vec<(CallKind, u64)> {
        vec![]
    }

    fn cache_hits(&self) -> u64 {
        0
    }

    fn cache_misses(&self) -> u64 {
        0
    }
}

#[derive(Default)]
struct OutboxState {
    deposits: Vec<DepositRecord>,
    notifications: Vec<NotificationRecord>,
}

/// Reimplements `PgOutboxStore`'s query semantics over a `Vec`, so tests can
/// assert on exactly-once notification behavior without a database.
#[derive(Default)]
pub struct InMemoryOutbox {
    state: StdMutex<OutboxState>,
    next_deposit_id: AtomicI64,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit_by_tx_hash(&self, tx_hash: &str) -> Option<DepositRecord> {
        self.state.lock().unwrap().deposits.iter().find(|d| d.tx_hash == tx_hash).cloned()
    }

    pub fn notification_count(&self) -> usize {
        self.state.lock().unwrap().notifications.len()
    }

    pub fn notification_for_tx_hash(&self, tx_hash: &str) -> Option<NotificationRecord> {
        self.state.lock().unwrap().notifications.iter().find(|n| n.tx_hash == tx_hash).cloned()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn upsert_pending(&self, transfer: &Transfer) -> Result<DepositRecord, OutboxError> {
        let tx_hash = transfer.tx_hash_hex();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.deposits.iter().find(|d| d.tx_hash == tx_hash) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let token_address = transfer
            .token_contract
            .map(|a| evm_monitor_primitives::lower_hex(&a))
            .unwrap_or_default();
        let record = DepositRecord {
            id: self.next_deposit_id.fetch_add(1, Ordering::SeqCst) + 1,
            tx_hash: tx_hash.clone(),
            block_number: Some(transfer.block_number as i64),
            block_hash: Some(format!("{:#x}", transfer.block_hash)),
            from_address: Some(transfer.from_lower()),
            to_address: Some(transfer.to_lower()),
            amount: Some(transfer.amount.clone()),
            token_address: Some(token_address),
            token_symbol: Some(transfer.asset_symbol.clone()),
            token_decimals: Some(transfer.decimals as i32),
            status: "pending".to_string(),
            confirmations: 0,
            notification_generated: false,
            gas_used: transfer.gas_used.map(|g| g as i64),
            gas_price: transfer.gas_price.clone(),
            transaction_fee: transfer.fee.clone(),
            user_id: Some(transfer.to_lower()),
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.deposits.push(record.clone());
        Ok(record)
    }

    async fn mark_confirmed(&self, tx_hash: &str, confirmations: i32) -> Result<(), OutboxError> {
        let mut state = self.state.lock().unwrap();
        if let Some(deposit) = state.deposits.iter_mut().find(|d| d.tx_hash == tx_hash && d.status == "pending") {
            deposit.status = "confirmed".to_string();
            deposit.confirmations = confirmations;
            deposit.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_confirmed_awaiting_notification(
        &self,
        required_confirmations: i32,
    ) -> Result<Vec<DepositRecord>, OutboxError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<DepositRecord> = state
            .deposits
            .iter()
            .filter(|d| d.status == "confirmed" && d.confirmations >= required_confirmations && !d.notification_generated)
            .filter(|d| {
                !state.notifications.iter().any(|n| n.deposit_record_id == d.id && n.status != "failed_final")
            })
            .cloned()
            .collect();
        rows.sort_by_key(|d| (d.block_number.unwrap_or_default(), d.id));
        Ok(rows)
    }

    async fn create_notification(&self, deposit: &DepositRecord) -> Result<NotificationRecord, OutboxError> {
        let payload = NotificationPayload::from_deposit(deposit);
        let request_data = serde_json::to_string(&payload)?;
        let now = Utc::now();
        let record = NotificationRecord {
            id: uuid::Uuid::new_v4(),
            deposit_record_id: deposit.id,
            tx_hash: deposit.tx_hash.clone(),
            user_id: deposit.user_id.clone(),
            notification_type: "deposit".to_string(),
            status: "pending".to_string(),
            attempt_count: 0,
            max_attempts: 3,
            last_attempt_at: None,
            success_at: None,
            request_data: Some(request_data),
            response_data: None,
            error_message: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().notifications.push(record.clone());
        Ok(record)
    }

    async fn begin_attempt(&self, notification_id: uuid::Uuid) -> Result<i32, OutboxError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .expect("notification exists");
        record.attempt_count += 1;
        record.last_attempt_at = Some(Utc::now());
        record.updated_at = Utc::now();
        Ok(record.attempt_count)
    }

    async fn mark_sent(&self, notification_id: uuid::Uuid, response: Option<&str>) -> Result<(), OutboxError> {
        let mut state = self.state.lock().unwrap();
        let deposit_record_id = {
            let record = state
                .notifications
                .iter_mut()
                .find(|n| n.id == notification_id)
                .expect("notification exists");
            record.status = "sent".to_string();
            record.success_at = Some(Utc::now());
            record.response_data = response.map(|s| s.to_string());
            record.updated_at = Utc::now();
            record.deposit_record_id
        };
        if let Some(deposit) = state.deposits.iter_mut().find(|d| d.id == deposit_record_id) {
            deposit.notification_generated = true;
            deposit.processed_at = Some(Utc::now());
            deposit.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        notification_id: uuid::Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), OutboxError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .expect("notification exists");
        record.error_message = Some(error.to_string());
        record.next_retry_at = next_retry_at;
        record.status = if record.attempt_count >= record.max_attempts { "failed_final" } else { "failed" }.to_string();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn due_retries(&self) -> Result<Vec<NotificationRecord>, OutboxError> {
        let state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut rows: Vec<NotificationRecord> = state
            .notifications
            .iter()
            .filter(|n| {
                (n.status == "pending" || n.status == "failed")
                    && n.attempt_count < n.max_attempts
                    && n.next_retry_at.map(|t| t <= now).unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|n| n.created_at);
        Ok(rows)
    }
}
