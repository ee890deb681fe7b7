//! Durable exactly-once outbox: deposit records and their notifications.
//!
//! Grounded on `force23airr-stableguard`'s `chainwatch-indexer` for the
//! `sqlx`/Postgres wiring (pool construction, migrate-on-startup,
//! transactional batch writes), and on the spec's own §3/§6 schema for the
//! two tables. `mark_sent` flipping `DepositRecord.notification_generated`
//! in the same transaction is the exactly-once gate (invariant I3).

use alloy_primitives::Address;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use evm_monitor_primitives::Transfer;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Derives the `user_id` stamped on a `DepositRecord`.
///
/// The spec's default (policy-independent) strategy is the lowercased
/// recipient address; this is expressed as a trait so a deployment could
/// substitute an account-lookup strategy without touching the store.
pub trait UserIdStrategy: Send + Sync {
    fn user_id_for(&self, transfer: &Transfer) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUserIdStrategy;

impl UserIdStrategy for DefaultUserIdStrategy {
    fn user_id_for(&self, transfer: &Transfer) -> String {
        transfer.to_lower()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DepositRecord {
    pub id: i64,
    pub tx_hash: String,
    pub block_number: Option<i64>,
    pub block_hash: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub amount: Option<BigDecimal>,
    pub token_address: Option<String>,
    pub token_symbol: Option<String>,
    pub token_decimals: Option<i32>,
    pub status: String,
    pub confirmations: i32,
    pub notification_generated: bool,
    pub gas_used: Option<i64>,
    pub gas_price: Option<BigDecimal>,
    pub transaction_fee: Option<BigDecimal>,
    pub user_id: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: uuid::Uuid,
    pub deposit_record_id: i64,
    pub tx_hash: String,
    pub user_id: Option<String>,
    pub notification_type: String,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub success_at: Option<DateTime<Utc>>,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The webhook payload, serialized into `NotificationRecord.request_data`
/// and re-sent verbatim on every retry. Field set matches §4.7/§6 and
/// `notification_service.py`'s payload builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: String,
    pub token_symbol: String,
    pub token_address: Option<String>,
    pub confirmations: i32,
    pub block_number: i64,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub service: &'static str,
}

impl NotificationPayload {
    pub fn from_deposit(deposit: &DepositRecord) -> Self {
        Self {
            kind: "deposit_confirmed",
            tx_hash: deposit.tx_hash.clone(),
            from_address: deposit.from_address.clone().unwrap_or_default(),
            to_address: deposit.to_address.clone().unwrap_or_default(),
            amount: deposit.amount.clone().map(|a| a.to_string()).unwrap_or_default(),
            token_symbol: deposit.token_symbol.clone().unwrap_or_default(),
            token_address: deposit.token_address.clone().filter(|a| !a.is_empty()),
            confirmations: deposit.confirmations,
            block_number: deposit.block_number.unwrap_or_default(),
            user_id: deposit.user_id.clone().unwrap_or_default(),
            timestamp: Utc::now(),
            service: "evm-transfer-monitor",
        }
    }
}

/// Enqueued by the confirmation tracker (C5), consumed by the webhook
/// dispatcher (C7), carried over a bounded `tokio::sync::mpsc` channel.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub notification_id: uuid::Uuid,
    pub payload: NotificationPayload,
}

/// The durable operations the pipeline needs from the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn upsert_pending(&self, transfer: &Transfer) -> Result<DepositRecord, OutboxError>;
    async fn mark_confirmed(&self, tx_hash: &str, confirmations: i32) -> Result<(), OutboxError>;
    async fn list_confirmed_awaiting_notification(
        &self,
        required_confirmations: i32,
    ) -> Result<Vec<DepositRecord>, OutboxError>;
    async fn create_notification(&self, deposit: &DepositRecord) -> Result<NotificationRecord, OutboxError>;
    /// Increments `attempt_count` and stamps `last_attempt_at`, atomically,
    /// before any network I/O for the attempt. Returns the new attempt
    /// count so the caller can stop retrying once the budget is spent even
    /// if the process crashes mid-attempt.
    async fn begin_attempt(&self, notification_id: uuid::Uuid) -> Result<i32, OutboxError>;
    async fn mark_sent(&self, notification_id: uuid::Uuid, response: Option<&str>) -> Result<(), OutboxError>;
    async fn mark_failed(
        &self,
        notification_id: uuid::Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), OutboxError>;
    async fn due_retries(&self) -> Result<Vec<NotificationRecord>, OutboxError>;
}

/// PostgreSQL-backed [`OutboxStore`].
pub struct PgOutboxStore {
    pool: PgPool,
    user_id_strategy: Box<dyn UserIdStrategy>,
}

impl PgOutboxStore {
    pub async fn connect(database_url: &str) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        Ok(Self { pool, user_id_strategy: Box::new(DefaultUserIdStrategy) })
    }

    pub fn with_user_id_strategy(mut self, strategy: Box<dyn UserIdStrategy>) -> Self {
        self.user_id_strategy = strategy;
        self
    }

    pub async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn upsert_pending(&self, transfer: &Transfer) -> Result<DepositRecord, OutboxError> {
        let tx_hash = transfer.tx_hash_hex();
        if let Some(existing) = sqlx::query_as::<_, DepositRecord>(
            "SELECT * FROM deposit_records WHERE tx_hash = $1",
        )
        .bind(&tx_hash)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(existing);
        }

        let user_id = self.user_id_strategy.user_id_for(transfer);
        let token_address = transfer
            .token_contract
            .map(|a: Address| evm_monitor_primitives::lower_hex(&a))
            .unwrap_or_default();

        let record = sqlx::query_as::<_, DepositRecord>(
            r#"
            INSERT INTO deposit_records (
                tx_hash, block_number, block_hash, from_address, to_address,
                amount, token_address, token_symbol, token_decimals,
                status, confirmations, notification_generated,
                gas_used, gas_price, transaction_fee, user_id
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, false, $10, $11, $12, $13
            )
            ON CONFLICT (tx_hash) DO UPDATE SET tx_hash = EXCLUDED.tx_hash
            RETURNING *
            "#,
        )
        .bind(&tx_hash)
        .bind(transfer.block_number as i64)
        .bind(format!("{:#x}", transfer.block_hash))
        .bind(transfer.from_lower())
        .bind(transfer.to_lower())
        .bind(&transfer.amount)
        .bind(token_address)
        .bind(&transfer.asset_symbol)
        .bind(transfer.decimals as i32)
        .bind(transfer.gas_used.map(|g| g as i64))
        .bind(&transfer.gas_price)
        .bind(&transfer.fee)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_confirmed(&self, tx_hash: &str, confirmations: i32) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE deposit_records
            SET status = 'confirmed', confirmations = $2, updated_at = now()
            WHERE tx_hash = $1 AND status = 'pending'
            "#,
        )
        .bind(tx_hash)
        .bind(confirmations)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_confirmed_awaiting_notification(
        &self,
        required_confirmations: i32,
    ) -> Result<Vec<DepositRecord>, OutboxError> {
        let rows = sqlx::query_as::<_, DepositRecord>(
            r#"
            SELECT * FROM deposit_records d
            WHERE d.status = 'confirmed'
              AND d.confirmations >= $1
              AND d.notification_generated = false
              AND NOT EXISTS (
                  SELECT 1 FROM notification_records n
                  WHERE n.deposit_record_id = d.id
                    AND n.status != 'failed_final'
              )
            ORDER BY d.block_number ASC, d.id ASC
            "#,
        )
        .bind(required_confirmations)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_notification(&self, deposit: &DepositRecord) -> Result<NotificationRecord, OutboxError> {
        let payload = NotificationPayload::from_deposit(deposit);
        let request_data = serde_json::to_string(&payload)?;

        let record = sqlx::query_as::<_, NotificationRecord>(
            r#"
            INSERT INTO notification_records (
                deposit_record_id, tx_hash, user_id, notification_type, status,
                attempt_count, max_attempts, request_data
            ) VALUES ($1, $2, $3, 'deposit', 'pending', 0, 3, $4)
            RETURNING *
            "#,
        )
        .bind(deposit.id)
        .bind(&deposit.tx_hash)
        .bind(&deposit.user_id)
        .bind(request_data)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn begin_attempt(&self, notification_id: uuid::Uuid) -> Result<i32, OutboxError> {
        let attempt_count: i32 = sqlx::query_scalar(
            r#"
            UPDATE notification_records
            SET attempt_count = attempt_count + 1, last_attempt_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING attempt_count
            "#,
        )
        .bind(notification_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempt_count)
    }

    async fn mark_sent(&self, notification_id: uuid::Uuid, response: Option<&str>) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await?;

        let deposit_record_id: i64 = sqlx::query_scalar(
            r#"
            UPDATE notification_records
            SET status = 'sent', success_at = now(), response_data = $2, updated_at = now()
            WHERE id = $1
            RETURNING deposit_record_id
            "#,
        )
        .bind(notification_id)
        .bind(response)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE deposit_records
            SET notification_generated = true, processed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(deposit_record_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        notification_id: uuid::Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE notification_records
            SET error_message = $2,
                next_retry_at = $3,
                status = CASE WHEN attempt_count >= max_attempts THEN 'failed_final' ELSE 'failed' END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(notification_id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_retries(&self) -> Result<Vec<NotificationRecord>, OutboxError> {
        let rows = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT * FROM notification_records
            WHERE status IN ('pending', 'failed')
              AND attempt_count < max_attempts
              AND (next_retry_at IS NULL OR next_retry_at <= now())
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    fn sample_transfer() -> Transfer {
        Transfer {
            tx_hash: b256!("1111111111111111111111111111111111111111111111111111111111111111"),
            block_number: 42,
            block_hash: b256!("2222222222222222222222222222222222222222222222222222222222222222"),
            from: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            to: address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            asset_symbol: "USDT".into(),
            amount: "150".parse().unwrap(),
            is_native: false,
            token_contract: Some(address!("cccccccccccccccccccccccccccccccccccccccc")),
            decimals: 18,
            gas_used: Some(21000),
            gas_price: Some("1".parse().unwrap()),
            fee: Some("0.000021".parse().unwrap()),
            found_at: Utc::now(),
        }
    }

    #[test]
    fn default_user_id_strategy_is_lowercased_recipient() {
        let strategy = DefaultUserIdStrategy;
        let t = sample_transfer();
        assert_eq!(strategy.user_id_for(&t), "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
    }

    #[test]
    fn notification_payload_carries_required_fields() {
        let deposit = DepositRecord {
            id: 1,
            tx_hash: "0xabc".into(),
            block_number: Some(42),
            block_hash: None,
            from_address: Some("0xaaa".into()),
            to_address: Some("0xbbb".into()),
            amount: Some("150".parse().unwrap()),
            token_address: Some(String::new()),
            token_symbol: Some("USDT".into()),
            token_decimals: Some(18),
            status: "confirmed".into(),
            confirmations: 12,
            notification_generated: false,
            gas_used: Some(21000),
            gas_price: Some("1".parse().unwrap()),
            transaction_fee: Some("0.000021".parse().unwrap()),
            user_id: Some("0xbbb".into()),
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let payload = NotificationPayload::from_deposit(&deposit);
        assert_eq!(payload.kind, "deposit_confirmed");
        assert_eq!(payload.amount, "150");
        assert_eq!(payload.confirmations, 12);
        assert!(payload.token_address.is_none());
        assert_eq!(payload.service, "evm-transfer-monitor");
    }
}
