use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    ReserveInventory,
    CommitInventory,
    CompensateInventory,
    CancelOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub saga_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
    Compensated,
}

/// One line of a reservation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveItem {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveInventoryData {
    pub order_id: Uuid,
    pub items: Vec<ReserveItem>,
    /// Reservation deadline. The inventory service applies its default TTL when absent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Payload for commands that only address an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: Uuid,
}

impl Command {
    pub fn new(saga_id: Uuid, command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            saga_id,
            command_type,
            payload,
            idempotency_key: format!("{}_{}", saga_id, Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }
}

impl CommandReply {
    pub fn success(command_id: Uuid, saga_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            saga_id,
            status: CommandStatus::Success,
            result,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, saga_id: Uuid, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            saga_id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }
}
