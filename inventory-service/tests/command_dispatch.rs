mod common;

use common::{harness, item};
use inventory_service::handlers::dispatch;
use shared::{Command, CommandStatus, CommandType, OrderRef, ReserveInventoryData};
use uuid::Uuid;

fn ttl() -> chrono::Duration {
    chrono::Duration::minutes(15)
}

#[tokio::test]
async fn reserve_command_applies_default_deadline() {
    let h = harness();
    let sku = Uuid::new_v4();
    h.receive(sku, 10, 10).await;
    let order_id = Uuid::new_v4();

    let payload = serde_json::to_value(ReserveInventoryData {
        order_id,
        items: vec![item(sku, 4)],
        expires_at: None,
    })
    .unwrap();
    let command = Command::new(Uuid::new_v4(), CommandType::ReserveInventory, payload);

    let reply = dispatch(&h.service, &command, ttl()).await;
    assert_eq!(reply.status, CommandStatus::Success);
    assert_eq!(reply.command_id, command.id);
    let result = reply.result.unwrap();
    assert_eq!(result["quantity"], 4);

    let reservations = h.service.order_reservations(order_id).await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert!(reservations[0].expires_at.is_some());
}

#[tokio::test]
async fn reserve_command_reports_shortfall() {
    let h = harness();
    let sku = Uuid::new_v4();
    h.receive(sku, 10, 1).await;

    let payload = serde_json::to_value(ReserveInventoryData {
        order_id: Uuid::new_v4(),
        items: vec![item(sku, 2)],
        expires_at: None,
    })
    .unwrap();
    let command = Command::new(Uuid::new_v4(), CommandType::ReserveInventory, payload);

    let reply = dispatch(&h.service, &command, ttl()).await;
    assert_eq!(reply.status, CommandStatus::Failed);
    assert!(reply.error.unwrap().contains("Insufficient inventory"));
}

#[tokio::test]
async fn commit_and_compensate_commands_settle_by_order() {
    let h = harness();
    let sku = Uuid::new_v4();
    h.receive(sku, 10, 10).await;
    let paid = Uuid::new_v4();
    let failed = Uuid::new_v4();
    h.service.reserve(paid, &[item(sku, 2)], None).await.unwrap();
    h.service.reserve(failed, &[item(sku, 3)], None).await.unwrap();

    let commit = Command::new(
        Uuid::new_v4(),
        CommandType::CommitInventory,
        serde_json::to_value(OrderRef { order_id: paid }).unwrap(),
    );
    let reply = dispatch(&h.service, &commit, ttl()).await;
    assert_eq!(reply.status, CommandStatus::Success);

    let compensate = Command::new(
        Uuid::new_v4(),
        CommandType::CompensateInventory,
        serde_json::to_value(OrderRef { order_id: failed }).unwrap(),
    );
    let reply = dispatch(&h.service, &compensate, ttl()).await;
    assert_eq!(reply.status, CommandStatus::Success);

    let stock = h.service.stock(sku).await.unwrap().unwrap();
    assert_eq!((stock.total_quantity, stock.reserved_quantity), (8, 0));
}

#[tokio::test]
async fn commit_command_for_unknown_order_fails() {
    let h = harness();
    let command = Command::new(
        Uuid::new_v4(),
        CommandType::CommitInventory,
        serde_json::to_value(OrderRef { order_id: Uuid::new_v4() }).unwrap(),
    );

    let reply = dispatch(&h.service, &command, ttl()).await;
    assert_eq!(reply.status, CommandStatus::Failed);
}

#[tokio::test]
async fn malformed_and_foreign_commands_fail() {
    let h = harness();

    let malformed = Command::new(Uuid::new_v4(), CommandType::CommitInventory, serde_json::json!({"order": 1}));
    let reply = dispatch(&h.service, &malformed, ttl()).await;
    assert_eq!(reply.status, CommandStatus::Failed);
    assert!(reply.error.unwrap().starts_with("Invalid payload"));

    let foreign = Command::new(Uuid::new_v4(), CommandType::CancelOrder, serde_json::json!({}));
    let reply = dispatch(&h.service, &foreign, ttl()).await;
    assert_eq!(reply.status, CommandStatus::Failed);
}
