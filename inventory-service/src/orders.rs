//! The order lifecycle as seen from the inventory service.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use shared::{Command, CommandType, OrderRef};
use tracing::{debug, info};
use uuid::Uuid;

const PENDING_STATUSES: &[&str] = &["created", "pending", "awaiting_payment"];
const FULFILLABLE_STATUSES: &[&str] = &["approved", "paid", "processing"];

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Whether the order is still waiting for payment.
    async fn is_pending(&self, order_id: Uuid) -> anyhow::Result<bool>;

    /// Whether the order has been paid and may be picked and packed.
    async fn is_fulfillable(&self, order_id: Uuid) -> anyhow::Result<bool>;

    async fn cancel(&self, order_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    status: String,
}

/// Looks orders up over the order service's HTTP API and cancels them by
/// publishing a `CancelOrder` command to its command topic.
pub struct OrderServiceClient {
    client: Client,
    base_url: String,
    producer: FutureProducer,
    command_topic: String,
}

impl OrderServiceClient {
    pub fn new(
        base_url: impl Into<String>,
        producer: FutureProducer,
        command_topic: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            producer,
            command_topic: command_topic.into(),
        })
    }

    async fn status(&self, order_id: Uuid) -> anyhow::Result<Option<String>> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Order {} not known to order service", order_id);
            return Ok(None);
        }

        let body: OrderStatusResponse = response.error_for_status()?.json().await?;
        Ok(Some(body.status))
    }
}

#[async_trait]
impl OrderGateway for OrderServiceClient {
    async fn is_pending(&self, order_id: Uuid) -> anyhow::Result<bool> {
        let status = self.status(order_id).await?;
        Ok(status.is_some_and(|s| PENDING_STATUSES.contains(&s.as_str())))
    }

    async fn is_fulfillable(&self, order_id: Uuid) -> anyhow::Result<bool> {
        let status = self.status(order_id).await?;
        Ok(status.is_some_and(|s| FULFILLABLE_STATUSES.contains(&s.as_str())))
    }

    async fn cancel(&self, order_id: Uuid) -> anyhow::Result<()> {
        let command = Command::new(
            order_id,
            CommandType::CancelOrder,
            serde_json::to_value(OrderRef { order_id })?,
        );
        let json = serde_json::to_string(&command)?;
        let key = order_id.to_string();
        let record = FutureRecord::to(&self.command_topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send cancel command: {}", e))?;

        info!("Requested cancellation of order {}", order_id);
        Ok(())
    }
}
