use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;
use shared::*;
use crate::error::ReservationError;
use crate::models::*;
use crate::schema::*;
use crate::service::ReservationService;
use crate::store::DbPool;

pub struct CommandHandler {
    pool: DbPool,
    service: Arc<ReservationService>,
    producer: FutureProducer,
    reply_topic: String,
    reservation_ttl: chrono::Duration,
}

impl CommandHandler {
    pub fn new(
        pool: DbPool,
        service: Arc<ReservationService>,
        producer: FutureProducer,
        reply_topic: String,
        reservation_ttl: chrono::Duration,
    ) -> Self {
        Self { pool, service, producer, reply_topic, reservation_ttl }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => match serde_json::from_str::<Command>(json_str) {
                                Ok(command) => {
                                    if let Err(e) = self.handle_command(command).await {
                                        error!("Error handling command: {}", e);
                                    }
                                }
                                Err(e) => warn!("Skipping malformed command: {}", e),
                            },
                            Err(e) => error!("Error parsing payload: {}", e),
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn handle_command(&self, command: Command) -> Result<()> {
        let mut conn = self.pool.get().await?;

        if let Some(existing) = self.check_idempotency(&mut conn, &command.idempotency_key).await? {
            info!("Command already processed, returning cached result");
            let reply = CommandReply::success(command.id, command.saga_id, existing.result);
            self.send_reply(reply).await?;
            return Ok(());
        }

        let reply = dispatch(&self.service, &command, self.reservation_ttl).await;

        if reply.status == CommandStatus::Success {
            self.store_processed_command(&mut conn, &command, &reply).await?;
        }
        self.send_reply(reply).await?;

        Ok(())
    }

    async fn check_idempotency(&self, conn: &mut AsyncPgConnection, key: &str) -> Result<Option<ProcessedCommand>> {
        let result = processed_commands::table
            .filter(processed_commands::idempotency_key.eq(key))
            .first::<ProcessedCommand>(conn)
            .await
            .optional()?;
        Ok(result)
    }

    async fn store_processed_command(&self, conn: &mut AsyncPgConnection, command: &Command, reply: &CommandReply) -> Result<()> {
        let processed_command = ProcessedCommand {
            idempotency_key: command.idempotency_key.clone(),
            command_id: command.id,
            result: reply.result.clone(),
            processed_at: Some(chrono::Utc::now()),
        };

        diesel::insert_into(processed_commands::table)
            .values(&processed_command)
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;

        Ok(())
    }

    async fn send_reply(&self, reply: CommandReply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        let key = reply.saga_id.to_string();
        let record = FutureRecord::to(&self.reply_topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send reply: {}", e))?;

        Ok(())
    }
}

/// Run one command against the engine and build its reply. Engine failures
/// become failed replies; nothing here returns early with an error.
pub async fn dispatch(
    service: &ReservationService,
    command: &Command,
    reservation_ttl: chrono::Duration,
) -> CommandReply {
    let result = match command.command_type {
        CommandType::ReserveInventory => reserve(service, command, reservation_ttl).await,
        CommandType::CommitInventory => match order_ref(command) {
            Ok(order) => service
                .commit(order.order_id)
                .await
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::to_value(s).map_err(|e| e.to_string())),
            Err(e) => Err(e),
        },
        CommandType::CompensateInventory => match order_ref(command) {
            Ok(order) => service
                .release(order.order_id)
                .await
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::to_value(s).map_err(|e| e.to_string())),
            Err(e) => Err(e),
        },
        _ => {
            warn!("Unsupported command type: {:?}", command.command_type);
            Err("Unsupported command type".to_string())
        }
    };

    match result {
        Ok(value) => CommandReply::success(command.id, command.saga_id, Some(value)),
        Err(message) => {
            warn!("Command {} failed: {}", command.id, message);
            CommandReply::failed(command.id, command.saga_id, message)
        }
    }
}

fn order_ref(command: &Command) -> std::result::Result<OrderRef, String> {
    serde_json::from_value(command.payload.clone()).map_err(|e| format!("Invalid payload: {}", e))
}

async fn reserve(
    service: &ReservationService,
    command: &Command,
    reservation_ttl: chrono::Duration,
) -> std::result::Result<serde_json::Value, String> {
    let data: ReserveInventoryData = serde_json::from_value(command.payload.clone())
        .map_err(|e| format!("Invalid payload: {}", e))?;
    let expires_at = data.expires_at.unwrap_or_else(|| chrono::Utc::now() + reservation_ttl);

    match service.reserve(data.order_id, &data.items, Some(expires_at)).await {
        Ok(reservations) => {
            let reserved: i32 = reservations.iter().map(|r| r.quantity).sum();
            Ok(serde_json::json!({
                "reserved": true,
                "order_id": data.order_id,
                "quantity": reserved,
                "reservation_ids": reservations.iter().map(|r| r.id).collect::<Vec<Uuid>>(),
                "expires_at": expires_at,
            }))
        }
        Err(ReservationError::InsufficientStock { variant_id, requested, available }) => Err(format!(
            "Insufficient inventory for variant {}: requested {}, available {}",
            variant_id, requested, available
        )),
        Err(e) => Err(e.to_string()),
    }
}
