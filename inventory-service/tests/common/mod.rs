#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inventory_service::models::{Batch, NewBatch};
use inventory_service::orders::OrderGateway;
use inventory_service::store::{InMemoryInventoryStore, InventoryStore};
use inventory_service::{ReservationConfig, ReservationService};
use shared::ReserveItem;
use uuid::Uuid;

/// Order collaborator whose answers are set by the test.
#[derive(Default)]
pub struct FakeOrders {
    pending: Mutex<HashSet<Uuid>>,
    fulfillable: Mutex<HashSet<Uuid>>,
    cancelled: Mutex<Vec<Uuid>>,
}

impl FakeOrders {
    pub fn mark_pending(&self, order_id: Uuid) {
        self.pending.lock().unwrap().insert(order_id);
    }

    pub fn mark_fulfillable(&self, order_id: Uuid) {
        self.fulfillable.lock().unwrap().insert(order_id);
    }

    pub fn cancelled(&self) -> Vec<Uuid> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderGateway for FakeOrders {
    async fn is_pending(&self, order_id: Uuid) -> anyhow::Result<bool> {
        Ok(self.pending.lock().unwrap().contains(&order_id))
    }

    async fn is_fulfillable(&self, order_id: Uuid) -> anyhow::Result<bool> {
        Ok(self.fulfillable.lock().unwrap().contains(&order_id))
    }

    async fn cancel(&self, order_id: Uuid) -> anyhow::Result<()> {
        self.pending.lock().unwrap().remove(&order_id);
        self.cancelled.lock().unwrap().push(order_id);
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryInventoryStore>,
    pub orders: Arc<FakeOrders>,
    pub service: Arc<ReservationService>,
}

pub fn harness() -> Harness {
    harness_with(ReservationConfig {
        max_attempts: 3,
        retry_backoff: Duration::from_millis(1),
    })
}

pub fn harness_with(config: ReservationConfig) -> Harness {
    let store = Arc::new(InMemoryInventoryStore::new());
    let orders = Arc::new(FakeOrders::default());
    let service = Arc::new(ReservationService::new(store.clone(), orders.clone(), config));
    Harness { store, orders, service }
}

impl Harness {
    /// Receive `quantity` units of `variant_id` expiring `expires_in_days` from today.
    pub async fn receive(&self, variant_id: Uuid, expires_in_days: i64, quantity: i32) -> Batch {
        self.service
            .receive_batch(NewBatch {
                variant_id,
                batch_code: format!("LOT-{}-{}", expires_in_days, Uuid::new_v4()),
                manufacture_date: None,
                expiry_date: Utc::now().date_naive() + chrono::Duration::days(expires_in_days),
                quantity,
                low_stock_threshold: None,
            })
            .await
            .unwrap()
    }

    pub async fn batch(&self, batch_id: Uuid) -> Batch {
        self.store.batch(batch_id).await.unwrap().unwrap()
    }

    /// Aggregate counters match batch sums, batch counters match the open ledger.
    pub async fn assert_conserved(&self, variant_id: Uuid) {
        let report = self.service.reconcile(variant_id).await.unwrap();
        assert!(report.is_consistent(), "counters drifted: {report:?}");

        let open = self.store.open_reservations_for_variant(variant_id).await.unwrap();
        for batch in self.store.batches_for_variant(variant_id).await.unwrap() {
            let ledger: i32 = open
                .iter()
                .filter(|r| r.batch_id == batch.id)
                .map(|r| r.quantity)
                .sum();
            assert_eq!(batch.reserved_quantity, ledger, "batch {} drifted", batch.id);
        }
    }
}

pub fn item(variant_id: Uuid, quantity: i32) -> ReserveItem {
    ReserveItem { variant_id, quantity }
}

pub fn in_hours(hours: i64) -> Option<DateTime<Utc>> {
    Some(Utc::now() + chrono::Duration::hours(hours))
}
