//! Bounded-retry webhook delivery (C7).
//!
//! Grounded on `evm_transfer_monitor/services/notification_service.py`'s
//! `send_notification_async`: the inline per-call attempt loop, the
//! `sent_at`/`attempt`/`service` payload fields and the
//! `Content-Type`/`User-Agent` headers are taken from there. The
//! background `retry_loop()` cadence and its `next_retry_at` spacing are
//! grounded on `confirmation_manager.py`'s `retry_delay * 60` ("minute
//! factor") scheduling.

use std::time::Duration;

use evm_monitor_outbox::{NotificationJob, NotificationRecord, OutboxStore};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const USER_AGENT: &str = concat!("evm-transfer-monitor/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("outbox error: {0}")]
    Outbox(#[from] evm_monitor_outbox::OutboxError),
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Per-attempt total request timeout.
    pub timeout: Duration,
    /// Attempts per `deliver()` call, including the first try.
    pub max_attempts: i32,
    /// Wait between attempts within one inline `deliver()` call.
    pub inline_retry_delay: Duration,
    /// Spacing applied to `next_retry_at` when an inline call exhausts its
    /// attempts; the background retry loop picks the job back up after this.
    pub background_retry_delay: Duration,
    /// Cadence of the background `retry_loop()`.
    pub retry_loop_interval: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            inline_retry_delay: Duration::from_secs(5),
            background_retry_delay: Duration::from_secs(5 * 60),
            retry_loop_interval: Duration::from_secs(10),
        }
    }
}

/// Sends webhook deliveries for newly confirmed deposits and retries
/// anything that didn't succeed within its inline attempt budget.
pub struct WebhookDispatcher {
    client: Client,
    config: WebhookConfig,
    outbox: Arc<dyn OutboxStore>,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig, outbox: Arc<dyn OutboxStore>) -> Self {
        let client = Client::builder().timeout(config.timeout).build().expect("reqwest client builds");
        Self { client, config, outbox }
    }

    /// Consumes [`NotificationJob`]s from the confirmation tracker until the
    /// channel closes or `shutdown` fires.
    pub async fn run(&self, mut jobs: mpsc::Receiver<NotificationJob>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("webhook dispatcher shutting down");
                    return;
                }
                job = jobs.recv() => {
                    match job {
                        Some(job) => self.deliver(job).await,
                        None => return,
                    }
                }
            }
        }
    }

    /// Attempts delivery up to `max_attempts` times, waiting
    /// `inline_retry_delay` between attempts. If the url is unconfigured,
    /// the attempt is skipped entirely (matches the source's
    /// "Webhook URL not configured" short-circuit).
    pub async fn deliver(&self, job: NotificationJob) {
        if self.config.url.is_empty() {
            tracing::warn!(notification_id = %job.notification_id, "webhook url not configured, skipping delivery");
            return;
        }

        let mut last_error = String::new();
        loop {
            let attempt = match self.outbox.begin_attempt(job.notification_id).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::error!(notification_id = %job.notification_id, error = %err, "failed to record delivery attempt");
                    return;
                }
            };
            if attempt > 1 {
                evm_monitor_metrics::NOTIFICATION_RETRIES.inc();
            }

            let body = serde_json::json!({
                "type": job.payload.kind,
                "tx_hash": job.payload.tx_hash,
                "from_address": job.payload.from_address,
                "to_address": job.payload.to_address,
                "amount": job.payload.amount,
                "token_symbol": job.payload.token_symbol,
                "token_address": job.payload.token_address,
                "confirmations": job.payload.confirmations,
                "block_number": job.payload.block_number,
                "user_id": job.payload.user_id,
                "timestamp": job.payload.timestamp,
                "sent_at": chrono::Utc::now(),
                "attempt": attempt,
                "service": job.payload.service,
            });

            let result = self
                .client
                .post(&self.config.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    let response_text = response.text().await.unwrap_or_default();
                    if let Err(err) = self.outbox.mark_sent(job.notification_id, Some(&response_text)).await {
                        tracing::error!(notification_id = %job.notification_id, error = %err, "failed to record successful delivery");
                    }
                    evm_monitor_metrics::NOTIFICATIONS_SENT.inc();
                    return;
                }
                Ok(response) => {
                    last_error = format!("http {}: {}", response.status(), response.text().await.unwrap_or_default());
                    tracing::warn!(notification_id = %job.notification_id, attempt, error = %last_error, "webhook delivery failed");
                }
                Err(err) => {
                    last_error = err.to_string();
                    tracing::warn!(notification_id = %job.notification_id, attempt, error = %last_error, "webhook delivery error");
                }
            }

            if attempt >= self.config.max_attempts {
                let next_retry_at = chrono::Utc::now()
                    + chrono::Duration::from_std(self.config.background_retry_delay).unwrap_or_default();
                if let Err(err) = self
                    .outbox
                    .mark_failed(job.notification_id, &last_error, Some(next_retry_at))
                    .await
                {
                    tracing::error!(notification_id = %job.notification_id, error = %err, "failed to record delivery failure");
                }
                evm_monitor_metrics::NOTIFICATIONS_FAILED.inc();
                return;
            }

            tokio::time::sleep(self.config.inline_retry_delay).await;
        }
    }

    /// Background loop: wakes on `retry_loop_interval`, picks up anything
    /// due for retry and re-delivers it through the same `deliver` path, so
    /// inline and background attempts draw from the same `attempt_count`
    /// budget.
    pub async fn retry_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.retry_loop_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let due = match self.outbox.due_retries().await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::error!(error = %err, "failed to list due notification retries");
                    continue;
                }
            };

            for record in due {
                self.deliver(job_from_record(&record)).await;
            }
        }
    }
}

fn job_from_record(record: &NotificationRecord) -> NotificationJob {
    let payload = record
        .request_data
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| fallback_payload(record));
    NotificationJob { notification_id: record.id, payload }
}

fn fallback_payload(record: &NotificationRecord) -> evm_monitor_outbox::NotificationPayload {
    evm_monitor_outbox::NotificationPayload {
        kind: "deposit_confirmed",
        tx_hash: record.tx_hash.clone(),
        from_address: String::new(),
        to_address: String::new(),
        amount: String::new(),
        token_symbol: String::new(),
        token_address: None,
        confirmations: 0,
        block_number: 0,
        user_id: record.user_id.clone().unwrap_or_default(),
        timestamp: chrono::Utc::now(),
        service: "evm-transfer-monitor",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evm_monitor_outbox::{DepositRecord, NotificationPayload, OutboxError};
    use evm_monitor_primitives::Transfer;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex as StdMutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakeOutbox {
        attempts: AtomicI32,
        sent: StdMutex<Option<uuid::Uuid>>,
        failed: StdMutex<Option<(uuid::Uuid, String)>>,
    }

    #[async_trait]
    impl OutboxStore for FakeOutbox {
        async fn upsert_pending(&self, _transfer: &Transfer) -> Result<DepositRecord, OutboxError> {
            unimplemented!()
        }
        async fn mark_confirmed(&self, _tx_hash: &str, _confirmations: i32) -> Result<(), OutboxError> {
            unimplemented!()
        }
        async fn list_confirmed_awaiting_notification(
            &self,
            _required_confirmations: i32,
        ) -> Result<Vec<DepositRecord>, OutboxError> {
            unimplemented!()
        }
        async fn create_notification(&self, _deposit: &DepositRecord) -> Result<evm_monitor_outbox::NotificationRecord, OutboxError> {
            unimplemented!()
        }
        async fn begin_attempt(&self, _notification_id: uuid::Uuid) -> Result<i32, OutboxError> {
            Ok(self.attempts.fetch_add(1, Ordering::SeqCst) + 1)
        }
        async fn mark_sent(&self, notification_id: uuid::Uuid, _response: Option<&str>) -> Result<(), OutboxError> {
            *self.sent.lock().unwrap() = Some(notification_id);
            Ok(())
        }
        async fn mark_failed(
            &self,
            notification_id: uuid::Uuid,
            error: &str,
            _next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<(), OutboxError> {
            *self.failed.lock().unwrap() = Some((notification_id, error.to_string()));
            Ok(())
        }
        async fn due_retries(&self) -> Result<Vec<evm_monitor_outbox::NotificationRecord>, OutboxError> {
            Ok(vec![])
        }
    }

    fn sample_job() -> NotificationJob {
        NotificationJob {
            notification_id: uuid::Uuid::new_v4(),
            payload: NotificationPayload {
                kind: "deposit_confirmed",
                tx_hash: "0xabc".into(),
                from_address: "0x1".into(),
                to_address: "0x2".into(),
                amount: "10".into(),
                token_symbol: "USDT".into(),
                token_address: Some("0x3".into()),
                confirmations: 12,
                block_number: 100,
                user_id: "0x2".into(),
                timestamp: chrono::Utc::now(),
                service: "evm-transfer-monitor",
            },
        }
    }

    #[tokio::test]
    async fn successful_delivery_marks_sent_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let outbox = Arc::new(FakeOutbox::default());
        let mut config = WebhookConfig::default();
        config.url = format!("{}/hook", server.uri());
        let dispatcher = WebhookDispatcher::new(config, outbox.clone());

        let job = sample_job();
        let id = job.notification_id;
        dispatcher.deliver(job).await;

        assert_eq!(*outbox.sent.lock().unwrap(), Some(id));
        assert_eq!(outbox.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outbox = Arc::new(FakeOutbox::default());
        let mut config = WebhookConfig::default();
        config.url = format!("{}/hook", server.uri());
        config.max_attempts = 2;
        config.inline_retry_delay = Duration::from_millis(1);
        let dispatcher = WebhookDispatcher::new(config, outbox.clone());

        let job = sample_job();
        let id = job.notification_id;
        dispatcher.deliver(job).await;

        assert_eq!(outbox.attempts.load(Ordering::SeqCst), 2);
        let failed = outbox.failed.lock().unwrap();
        assert_eq!(failed.as_ref().unwrap().0, id);
    }

    #[tokio::test]
    async fn missing_url_skips_delivery_without_touching_outbox() {
        let outbox = Arc::new(FakeOutbox::default());
        let dispatcher = WebhookDispatcher::new(WebhookConfig::default(), outbox.clone());
        dispatcher.deliver(sample_job()).await;
        assert_eq!(outbox.attempts.load(Ordering::SeqCst), 0);
    }
}
