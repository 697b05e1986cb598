//! Persistence seam for batches, stock aggregates and the reservation ledger.
//!
//! Reads are snapshots taken outside any transaction. Every mutation of a
//! logical operation is collected into one [`ChangeSet`] and handed to
//! [`InventoryStore::apply`], which writes it atomically or not at all.

mod memory;
mod postgres;

pub use memory::InMemoryInventoryStore;
pub use postgres::{DbPool, PgInventoryStore};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Batch, Reservation, ReservationStatus, StockAdjustment, StockAggregate};

/// New quantities for a batch, guarded by the version they were computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    pub batch_id: Uuid,
    pub expected_version: i32,
    pub remaining_quantity: i32,
    pub reserved_quantity: i32,
}

/// New totals for a stock aggregate, guarded by the version they were computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct StockWrite {
    pub variant_id: Uuid,
    pub expected_version: i32,
    pub total_quantity: i32,
    pub reserved_quantity: i32,
}

/// Moves a reservation out of `Reserved`. Fails with a conflict if the
/// reservation is no longer `Reserved` when the write happens.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub reservation_id: Uuid,
    pub to: ReservationStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub batches: Vec<BatchWrite>,
    pub stocks: Vec<StockWrite>,
    pub transitions: Vec<StatusTransition>,
    pub reservations: Vec<Reservation>,
    pub adjustments: Vec<StockAdjustment>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
            && self.stocks.is_empty()
            && self.transitions.is_empty()
            && self.reservations.is_empty()
            && self.adjustments.is_empty()
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn batch(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError>;

    /// Every batch of the variant, including expired and exhausted ones.
    async fn batches_for_variant(&self, variant_id: Uuid) -> Result<Vec<Batch>, StoreError>;

    /// Batches of the variant with unreserved units that have not expired by
    /// `today`, ordered by expiry date then id.
    async fn sellable_batches(
        &self,
        variant_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, StoreError>;

    async fn stock(&self, variant_id: Uuid) -> Result<Option<StockAggregate>, StoreError>;

    async fn reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>, StoreError>;

    async fn reservations_for_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, StoreError>;

    /// `Reserved` reservations of the variant.
    async fn open_reservations_for_variant(
        &self,
        variant_id: Uuid,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// `Reserved` reservations whose deadline is at or before `now`, oldest deadline first.
    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn adjustments_for_batch(&self, batch_id: Uuid) -> Result<Vec<StockAdjustment>, StoreError>;

    /// Insert a freshly received batch and add its quantity to the variant's
    /// aggregate, creating the aggregate on first receipt.
    async fn receive_batch(
        &self,
        batch: Batch,
        low_stock_threshold: Option<i32>,
    ) -> Result<(), StoreError>;

    /// Apply all writes in one transaction.
    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError>;
}
