//! AMQP fanout listener feeding the shared watched-address set (C8).
//!
//! Grounded on `evm_transfer_monitor/managers/queue_manager.py`'s
//! `AsyncRabbitMQConsumer`: a durable fanout exchange bound to an
//! auto-delete, exclusive, server-named queue, auto-ack on successful
//! processing, loose address-format validation that warns but does not
//! always reject. `lapin` has no built-in reconnect (unlike `aio_pika`'s
//! `connect_robust`), so the reconnect loop with capped backoff is
//! hand-rolled here.

use std::time::Duration;

use evm_monitor_policy::WatchedSet;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct WalletUpdateMessage {
    address: String,
}

fn is_valid_address(address: &str) -> bool {
    address.len() == 42 && address.starts_with("0x") && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Listens on `wallet_updates_<chain_name>` and inserts every valid address
/// into the shared [`WatchedSet`].
pub struct AddressRegistryListener {
    amqp_url: String,
    chain_name: String,
    watched: WatchedSet,
}

impl AddressRegistryListener {
    pub fn new(amqp_url: impl Into<String>, chain_name: impl Into<String>, watched: WatchedSet) -> Self {
        Self { amqp_url: amqp_url.into(), chain_name: chain_name.into(), watched }
    }

    fn exchange_name(&self) -> String {
        format!("wallet_updates_{}", self.chain_name)
    }

    /// Runs forever (until `shutdown` fires), reconnecting with capped
    /// exponential backoff on any connection failure. A listener failure
    /// never stops the rest of the pipeline; it just means the watched set
    /// stops growing until reconnection succeeds.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.run_once(&shutdown).await {
                Ok(()) => {
                    tracing::info!(chain = %self.chain_name, "address registry listener stopped cleanly");
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        chain = %self.chain_name,
                        error = %err,
                        backoff_secs = backoff.as_secs(),
                        "address registry listener disconnected, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn run_once(&self, shutdown: &CancellationToken) -> Result<(), lapin::Error> {
        let connection = Connection::connect(&self.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let exchange_name = self.exchange_name();
        channel
            .exchange_declare(
                &exchange_name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(queue.name().as_str(), &exchange_name, "", QueueBindOptions::default(), FieldTable::default())
            .await?;

        tracing::info!(chain = %self.chain_name, exchange = %exchange_name, queue = %queue.name(), "bound to wallet update exchange");

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &format!("evm-monitor-{}", self.chain_name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                next = consumer.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            self.handle_message(&delivery.data).await;
                            delivery.ack(BasicAckOptions::default()).await?;
                        }
                        Some(Err(err)) => return Err(err),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_message(&self, body: &[u8]) {
        let parsed: Result<WalletUpdateMessage, _> = serde_json::from_slice(body);
        let message = match parsed {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(chain = %self.chain_name, error = %err, "dropping malformed wallet update message");
                return;
            }
        };

        if !is_valid_address(&message.address) {
            tracing::warn!(chain = %self.chain_name, address = %message.address, "dropping malformed wallet update address");
            return;
        }

        let lowercased = message.address.to_lowercase();
        if self.watched.insert(lowercased.clone()).await {
            tracing::info!(chain = %self.chain_name, address = %lowercased, "added address to watched set");
        }
    }
}
