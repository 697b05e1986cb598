use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::{ChangeSet, InventoryStore};
use crate::error::StoreError;
use crate::models::{Batch, Reservation, ReservationStatus, StockAdjustment, StockAggregate};

#[derive(Debug, Default)]
struct State {
    batches: HashMap<Uuid, Batch>,
    stocks: HashMap<Uuid, StockAggregate>,
    reservations: HashMap<Uuid, Reservation>,
    adjustments: Vec<StockAdjustment>,
}

/// In-memory store with the same version and status guards as the
/// PostgreSQL store.
///
/// Intended for tests/dev. `apply` validates the whole change set before
/// touching any row, so a rejected change set leaves no trace.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    state: RwLock<State>,
    injected_conflicts: AtomicU32,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `apply` fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Corrupt("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Corrupt("lock poisoned".to_string()))
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn validate(state: &State, changes: &ChangeSet) -> Result<(), StoreError> {
    for write in &changes.batches {
        let batch = state
            .batches
            .get(&write.batch_id)
            .ok_or_else(|| StoreError::Invariant(format!("batch {} does not exist", write.batch_id)))?;
        if batch.version != write.expected_version {
            return Err(StoreError::Conflict(format!(
                "batch {} is no longer at version {}",
                write.batch_id, write.expected_version
            )));
        }
        if !Batch::quantities_valid(write.remaining_quantity, write.reserved_quantity, batch.import_quantity) {
            return Err(StoreError::Invariant(format!(
                "batch {}: reserved {} remaining {} import {}",
                batch.id, write.reserved_quantity, write.remaining_quantity, batch.import_quantity
            )));
        }
    }

    for write in &changes.stocks {
        let stock = state.stocks.get(&write.variant_id).ok_or_else(|| {
            StoreError::Invariant(format!("stock of variant {} does not exist", write.variant_id))
        })?;
        if stock.version != write.expected_version {
            return Err(StoreError::Conflict(format!(
                "stock of variant {} is no longer at version {}",
                write.variant_id, write.expected_version
            )));
        }
        if write.reserved_quantity < 0 || write.reserved_quantity > write.total_quantity {
            return Err(StoreError::Invariant(format!(
                "stock of variant {}: reserved {} total {}",
                write.variant_id, write.reserved_quantity, write.total_quantity
            )));
        }
    }

    for transition in &changes.transitions {
        match state.reservations.get(&transition.reservation_id) {
            Some(r) if r.status == ReservationStatus::Reserved => {}
            _ => {
                return Err(StoreError::Conflict(format!(
                    "reservation {} is no longer reserved",
                    transition.reservation_id
                )))
            }
        }
    }

    for reservation in &changes.reservations {
        if !state.batches.contains_key(&reservation.batch_id) {
            return Err(StoreError::Invariant(format!(
                "reservation {} references missing batch {}",
                reservation.id, reservation.batch_id
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn batch(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError> {
        Ok(self.read()?.batches.get(&batch_id).cloned())
    }

    async fn batches_for_variant(&self, variant_id: Uuid) -> Result<Vec<Batch>, StoreError> {
        let state = self.read()?;
        let mut rows: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| b.variant_id == variant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.expiry_date.cmp(&b.expiry_date).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn sellable_batches(
        &self,
        variant_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, StoreError> {
        let mut rows = self.batches_for_variant(variant_id).await?;
        rows.retain(|b| !b.is_expired(today) && b.available() > 0);
        Ok(rows)
    }

    async fn stock(&self, variant_id: Uuid) -> Result<Option<StockAggregate>, StoreError> {
        Ok(self.read()?.stocks.get(&variant_id).cloned())
    }

    async fn reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.read()?.reservations.get(&reservation_id).cloned())
    }

    async fn reservations_for_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, StoreError> {
        let state = self.read()?;
        let mut rows: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn open_reservations_for_variant(
        &self,
        variant_id: Uuid,
    ) -> Result<Vec<Reservation>, StoreError> {
        let state = self.read()?;
        Ok(state
            .reservations
            .values()
            .filter(|r| r.variant_id == variant_id && r.is_open())
            .cloned()
            .collect())
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reservation>, StoreError> {
        let state = self.read()?;
        let mut rows: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.is_open() && r.is_expired_at(now))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.expires_at);
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn adjustments_for_batch(&self, batch_id: Uuid) -> Result<Vec<StockAdjustment>, StoreError> {
        let state = self.read()?;
        Ok(state
            .adjustments
            .iter()
            .filter(|a| a.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn receive_batch(
        &self,
        batch: Batch,
        low_stock_threshold: Option<i32>,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let now = Utc::now();

        if state.batches.contains_key(&batch.id) {
            return Err(StoreError::Invariant(format!("batch {} already exists", batch.id)));
        }

        let current = state.stocks.get(&batch.variant_id).map_or(0, |s| s.total_quantity);
        let total = current.checked_add(batch.remaining_quantity).ok_or_else(|| {
            StoreError::Invariant(format!(
                "stock of variant {} cannot hold {} more units",
                batch.variant_id, batch.remaining_quantity
            ))
        })?;

        let stock = state
            .stocks
            .entry(batch.variant_id)
            .or_insert_with(|| StockAggregate {
                variant_id: batch.variant_id,
                total_quantity: 0,
                reserved_quantity: 0,
                low_stock_threshold: 0,
                version: 0,
                updated_at: now,
            });
        stock.total_quantity = total;
        stock.version += 1;
        stock.updated_at = now;
        if let Some(threshold) = low_stock_threshold {
            stock.low_stock_threshold = threshold;
        }

        state.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if self.take_injected_conflict() {
            return Err(StoreError::Conflict("injected conflict".to_string()));
        }

        let mut state = self.write()?;
        validate(&state, &changes)?;

        let now = Utc::now();

        for write in changes.batches {
            if let Some(batch) = state.batches.get_mut(&write.batch_id) {
                batch.remaining_quantity = write.remaining_quantity;
                batch.reserved_quantity = write.reserved_quantity;
                batch.version += 1;
                batch.updated_at = now;
            }
        }

        for write in changes.stocks {
            if let Some(stock) = state.stocks.get_mut(&write.variant_id) {
                stock.total_quantity = write.total_quantity;
                stock.reserved_quantity = write.reserved_quantity;
                stock.version += 1;
                stock.updated_at = now;
            }
        }

        for transition in changes.transitions {
            if let Some(reservation) = state.reservations.get_mut(&transition.reservation_id) {
                reservation.status = transition.to;
                reservation.updated_at = now;
            }
        }

        for reservation in changes.reservations {
            state.reservations.insert(reservation.id, reservation);
        }

        state.adjustments.extend(changes.adjustments);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewBatch;
    use crate::store::{BatchWrite, StatusTransition};

    async fn seeded() -> (InMemoryInventoryStore, Batch) {
        let store = InMemoryInventoryStore::new();
        let batch = NewBatch {
            variant_id: Uuid::new_v4(),
            batch_code: "LOT-A".to_string(),
            manufacture_date: None,
            expiry_date: NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
            quantity: 10,
            low_stock_threshold: Some(2),
        }
        .into_batch(Utc::now());
        store.receive_batch(batch.clone(), Some(2)).await.unwrap();
        (store, batch)
    }

    #[tokio::test]
    async fn receiving_creates_aggregate() {
        let (store, batch) = seeded().await;
        let stock = store.stock(batch.variant_id).await.unwrap().unwrap();
        assert_eq!(stock.total_quantity, 10);
        assert_eq!(stock.reserved_quantity, 0);
        assert_eq!(stock.low_stock_threshold, 2);
    }

    #[tokio::test]
    async fn stale_version_rejects_whole_change_set() {
        let (store, batch) = seeded().await;
        let now = Utc::now();
        let reservation = Reservation::new(Uuid::new_v4(), batch.id, batch.variant_id, 1, None, now);

        let changes = ChangeSet {
            batches: vec![BatchWrite {
                batch_id: batch.id,
                expected_version: batch.version + 1,
                remaining_quantity: 10,
                reserved_quantity: 1,
            }],
            reservations: vec![reservation.clone()],
            ..ChangeSet::default()
        };

        let err = store.apply(changes).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.reservation(reservation.id).await.unwrap().is_none());
        assert_eq!(store.batch(batch.id).await.unwrap().unwrap().reserved_quantity, 0);
    }

    #[tokio::test]
    async fn transition_requires_reserved_status() {
        let (store, batch) = seeded().await;
        let mut reservation = Reservation::new(Uuid::new_v4(), batch.id, batch.variant_id, 1, None, Utc::now());
        reservation.status = ReservationStatus::Committed;
        store
            .apply(ChangeSet {
                reservations: vec![reservation.clone()],
                ..ChangeSet::default()
            })
            .await
            .unwrap();

        let err = store
            .apply(ChangeSet {
                transitions: vec![StatusTransition {
                    reservation_id: reservation.id,
                    to: ReservationStatus::Released,
                }],
                ..ChangeSet::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn invariant_breaking_write_is_rejected() {
        let (store, batch) = seeded().await;
        let err = store
            .apply(ChangeSet {
                batches: vec![BatchWrite {
                    batch_id: batch.id,
                    expected_version: batch.version,
                    remaining_quantity: 2,
                    reserved_quantity: 3,
                }],
                ..ChangeSet::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
    }

    #[tokio::test]
    async fn receipt_overflowing_the_aggregate_is_rejected() {
        let (store, batch) = seeded().await;
        let huge = NewBatch {
            variant_id: batch.variant_id,
            batch_code: "LOT-B".to_string(),
            manufacture_date: None,
            expiry_date: NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
            quantity: i32::MAX,
            low_stock_threshold: None,
        }
        .into_batch(Utc::now());

        let err = store.receive_batch(huge.clone(), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
        assert!(store.batch(huge.id).await.unwrap().is_none());

        let stock = store.stock(batch.variant_id).await.unwrap().unwrap();
        assert_eq!(stock.total_quantity, 10);
        assert_eq!(stock.version, 1);
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let (store, _) = seeded().await;
        store.inject_conflicts(1);
        assert!(store.apply(ChangeSet::default()).await.unwrap_err().is_conflict());
        assert!(store.apply(ChangeSet::default()).await.is_ok());
    }
}
