//! Reservation service: turns allocation plans and settlement requests into
//! guarded change sets and applies them with bounded retries.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::ReserveItem;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::{self, AllocationError};
use crate::error::{ReservationError, ReservationResult, StoreError};
use crate::models::*;
use crate::orders::OrderGateway;
use crate::store::{BatchWrite, ChangeSet, InventoryStore, StatusTransition, StockWrite};

#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// Attempts per logical operation before giving up on conflicts.
    pub max_attempts: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }
}

/// Outcome of a commit or release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub order_id: Uuid,
    pub reservations: usize,
    pub quantity: i32,
}

impl Settlement {
    fn none(order_id: Uuid) -> Self {
        Self {
            order_id,
            reservations: 0,
            quantity: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.reservations == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Substitution {
    pub damaged: Reservation,
    pub adjustment: StockAdjustment,
    pub replacements: Vec<Reservation>,
}

/// Aggregate counters next to the sums they cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub variant_id: Uuid,
    pub aggregate_total: i32,
    pub aggregate_reserved: i32,
    pub batch_remaining: i64,
    pub batch_reserved: i64,
    pub ledger_reserved: i64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        i64::from(self.aggregate_total) == self.batch_remaining
            && i64::from(self.aggregate_reserved) == self.batch_reserved
            && self.batch_reserved == self.ledger_reserved
    }
}

/// Accumulates quantity deltas per row so one operation touching the same
/// batch twice produces a single guarded write.
#[derive(Default)]
struct Draft {
    batches: BTreeMap<Uuid, (Batch, i32, i32)>,
    stocks: BTreeMap<Uuid, (StockAggregate, i32, i32)>,
    transitions: Vec<StatusTransition>,
    reservations: Vec<Reservation>,
    adjustments: Vec<StockAdjustment>,
}

impl Draft {
    fn batch(&mut self, batch: &Batch, remaining_delta: i32, reserved_delta: i32) {
        let entry = self
            .batches
            .entry(batch.id)
            .or_insert_with(|| (batch.clone(), 0, 0));
        entry.1 += remaining_delta;
        entry.2 += reserved_delta;
    }

    fn stock(&mut self, stock: &StockAggregate, total_delta: i32, reserved_delta: i32) {
        let entry = self
            .stocks
            .entry(stock.variant_id)
            .or_insert_with(|| (stock.clone(), 0, 0));
        entry.1 += total_delta;
        entry.2 += reserved_delta;
    }

    fn transition(&mut self, reservation_id: Uuid, to: ReservationStatus) {
        self.transitions.push(StatusTransition { reservation_id, to });
    }

    fn insert(&mut self, reservation: Reservation) {
        self.reservations.push(reservation);
    }

    fn record(&mut self, adjustment: StockAdjustment) {
        self.adjustments.push(adjustment);
    }

    fn finish(self) -> Result<ChangeSet, StoreError> {
        let mut batches = Vec::with_capacity(self.batches.len());
        for (batch, remaining_delta, reserved_delta) in self.batches.into_values() {
            let remaining = batch.remaining_quantity + remaining_delta;
            let reserved = batch.reserved_quantity + reserved_delta;
            if !Batch::quantities_valid(remaining, reserved, batch.import_quantity) {
                return Err(StoreError::Invariant(format!(
                    "batch {} would have reserved {} of remaining {} (import {})",
                    batch.id, reserved, remaining, batch.import_quantity
                )));
            }
            batches.push(BatchWrite {
                batch_id: batch.id,
                expected_version: batch.version,
                remaining_quantity: remaining,
                reserved_quantity: reserved,
            });
        }

        let mut stocks = Vec::with_capacity(self.stocks.len());
        for (stock, total_delta, reserved_delta) in self.stocks.into_values() {
            let total = stock.total_quantity + total_delta;
            let reserved = stock.reserved_quantity + reserved_delta;
            if reserved < 0 || reserved > total {
                return Err(StoreError::Invariant(format!(
                    "stock of variant {} would have reserved {} of total {}",
                    stock.variant_id, reserved, total
                )));
            }
            stocks.push(StockWrite {
                variant_id: stock.variant_id,
                expected_version: stock.version,
                total_quantity: total,
                reserved_quantity: reserved,
            });
        }

        Ok(ChangeSet {
            batches,
            stocks,
            transitions: self.transitions,
            reservations: self.reservations,
            adjustments: self.adjustments,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Commit,
    Release,
}

impl Settle {
    fn status(self) -> ReservationStatus {
        match self {
            Settle::Commit => ReservationStatus::Committed,
            Settle::Release => ReservationStatus::Released,
        }
    }
}

/// Merge repeated variants so each is planned once, keeping first-seen order.
fn merge_items(items: &[ReserveItem]) -> ReservationResult<Vec<ReserveItem>> {
    let mut merged: Vec<ReserveItem> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|m| m.variant_id == item.variant_id) {
            Some(existing) => {
                existing.quantity = existing.quantity.checked_add(item.quantity).ok_or_else(|| {
                    ReservationError::invalid(format!(
                        "total quantity for variant {} is out of range",
                        item.variant_id
                    ))
                })?;
            }
            None => merged.push(item.clone()),
        }
    }
    Ok(merged)
}

fn missing_stock(variant_id: Uuid) -> StoreError {
    StoreError::Invariant(format!("variant {} has batches but no stock aggregate", variant_id))
}

fn missing_batch(batch_id: Uuid) -> StoreError {
    StoreError::Invariant(format!("reservation references missing batch {}", batch_id))
}

pub struct ReservationService {
    store: Arc<dyn InventoryStore>,
    orders: Arc<dyn OrderGateway>,
    config: ReservationConfig,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        orders: Arc<dyn OrderGateway>,
        config: ReservationConfig,
    ) -> Self {
        Self { store, orders, config }
    }

    pub fn orders(&self) -> &Arc<dyn OrderGateway> {
        &self.orders
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> ReservationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReservationResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut tried = 0;
        loop {
            tried += 1;
            match attempt().await {
                Err(ReservationError::Store(e)) if e.is_conflict() => {
                    if tried >= max_attempts {
                        warn!("{} gave up after {} attempts: {}", operation, tried, e);
                        return Err(ReservationError::TransientConflict { attempts: tried });
                    }
                    debug!("{} attempt {} conflicted: {}", operation, tried, e);
                    tokio::time::sleep(self.config.retry_backoff * tried).await;
                }
                result => return result,
            }
        }
    }

    /// Reserve every item for `order_id`, or nothing at all.
    pub async fn reserve(
        &self,
        order_id: Uuid,
        items: &[ReserveItem],
        expires_at: Option<DateTime<Utc>>,
    ) -> ReservationResult<Vec<Reservation>> {
        if items.is_empty() {
            return Err(ReservationError::invalid("no items to reserve"));
        }
        if let Some(item) = items.iter().find(|i| i.quantity <= 0) {
            return Err(ReservationError::invalid(format!(
                "quantity for variant {} must be positive, got {}",
                item.variant_id, item.quantity
            )));
        }
        if expires_at.is_some_and(|deadline| deadline <= Utc::now()) {
            return Err(ReservationError::invalid("reservation deadline is in the past"));
        }

        let items = merge_items(items)?;
        let items = items.as_slice();
        let created = self
            .with_retry("reserve", move || self.try_reserve(order_id, items, expires_at))
            .await?;

        info!(
            "Reserved {} units across {} batches for order {}",
            created.iter().map(|r| r.quantity).sum::<i32>(),
            created.len(),
            order_id
        );
        Ok(created)
    }

    async fn try_reserve(
        &self,
        order_id: Uuid,
        items: &[ReserveItem],
        expires_at: Option<DateTime<Utc>>,
    ) -> ReservationResult<Vec<Reservation>> {
        let now = Utc::now();
        let today = now.date_naive();
        let mut draft = Draft::default();
        let mut created = Vec::new();

        for item in items {
            let batches = self.store.sellable_batches(item.variant_id, today).await?;
            let plan = allocator::allocate(&batches, item.variant_id, item.quantity, today, &HashSet::new())
                .map_err(|e| match e {
                    AllocationError::Shortfall { requested, available } => ReservationError::InsufficientStock {
                        variant_id: item.variant_id,
                        requested,
                        available,
                    },
                    AllocationError::InvalidQuantity(q) => {
                        ReservationError::invalid(format!("invalid quantity {}", q))
                    }
                })?;

            let stock = self
                .store
                .stock(item.variant_id)
                .await?
                .ok_or_else(|| missing_stock(item.variant_id))?;

            for allocation in plan {
                let batch = batches
                    .iter()
                    .find(|b| b.id == allocation.batch_id)
                    .ok_or_else(|| missing_batch(allocation.batch_id))?;
                draft.batch(batch, 0, allocation.quantity);

                let reservation = Reservation::new(
                    order_id,
                    batch.id,
                    item.variant_id,
                    allocation.quantity,
                    expires_at,
                    now,
                );
                draft.insert(reservation.clone());
                created.push(reservation);
            }
            draft.stock(&stock, 0, item.quantity);
        }

        self.store.apply(draft.finish()?).await?;
        Ok(created)
    }

    /// Consume the order's open reservations. Unknown orders are an error;
    /// already-settled orders are a no-op.
    pub async fn commit(&self, order_id: Uuid) -> ReservationResult<Settlement> {
        let settlement = self
            .with_retry("commit", || async move {
                let reservations = self.store.reservations_for_order(order_id).await?;
                if reservations.is_empty() {
                    return Err(ReservationError::OrderNotFound(order_id));
                }
                let open: Vec<Reservation> = reservations.into_iter().filter(|r| r.is_open()).collect();
                self.settle(order_id, open, Settle::Commit).await
            })
            .await?;

        if settlement.is_noop() {
            debug!("Order {} has nothing left to commit", order_id);
        } else {
            info!("Committed {} units for order {}", settlement.quantity, order_id);
        }
        Ok(settlement)
    }

    /// Return the order's open reservations to the available pool. Safe to
    /// call any number of times, including for orders that never reserved.
    pub async fn release(&self, order_id: Uuid) -> ReservationResult<Settlement> {
        let settlement = self
            .with_retry("release", || async move {
                let open: Vec<Reservation> = self
                    .store
                    .reservations_for_order(order_id)
                    .await?
                    .into_iter()
                    .filter(|r| r.is_open())
                    .collect();
                self.settle(order_id, open, Settle::Release).await
            })
            .await?;

        if !settlement.is_noop() {
            info!("Released {} units for order {}", settlement.quantity, order_id);
        }
        Ok(settlement)
    }

    /// Release only the order's open reservations whose deadline is at or before `now`.
    pub async fn release_expired(&self, order_id: Uuid, now: DateTime<Utc>) -> ReservationResult<Settlement> {
        self.with_retry("release_expired", || async move {
            let expired: Vec<Reservation> = self
                .store
                .reservations_for_order(order_id)
                .await?
                .into_iter()
                .filter(|r| r.is_open() && r.is_expired_at(now))
                .collect();
            self.settle(order_id, expired, Settle::Release).await
        })
        .await
    }

    async fn settle(&self, order_id: Uuid, open: Vec<Reservation>, mode: Settle) -> ReservationResult<Settlement> {
        if open.is_empty() {
            return Ok(Settlement::none(order_id));
        }

        // Totals come from the snapshot only; nothing is read back mid-operation.
        let mut per_batch: BTreeMap<Uuid, i32> = BTreeMap::new();
        let mut per_variant: BTreeMap<Uuid, i32> = BTreeMap::new();
        for r in &open {
            *per_batch.entry(r.batch_id).or_default() += r.quantity;
            *per_variant.entry(r.variant_id).or_default() += r.quantity;
        }

        let consumed = matches!(mode, Settle::Commit);
        let mut draft = Draft::default();

        for (batch_id, quantity) in &per_batch {
            let batch = self
                .store
                .batch(*batch_id)
                .await?
                .ok_or_else(|| missing_batch(*batch_id))?;
            let remaining_delta = if consumed { -quantity } else { 0 };
            draft.batch(&batch, remaining_delta, -quantity);
        }

        for (variant_id, quantity) in &per_variant {
            let stock = self
                .store
                .stock(*variant_id)
                .await?
                .ok_or_else(|| missing_stock(*variant_id))?;
            let total_delta = if consumed { -quantity } else { 0 };
            draft.stock(&stock, total_delta, -quantity);
        }

        for r in &open {
            draft.transition(r.id, mode.status());
        }

        self.store.apply(draft.finish()?).await?;

        Ok(Settlement {
            order_id,
            reservations: open.len(),
            quantity: per_variant.values().sum(),
        })
    }

    /// Replace a damaged reserved unit: write it off, then reserve the same
    /// quantity again, preferring what is left of the damaged batch.
    pub async fn substitute_damaged(
        &self,
        order_id: Uuid,
        reservation_id: Uuid,
        note: &str,
    ) -> ReservationResult<Substitution> {
        let reservation = self.checked_open_reservation(order_id, reservation_id).await?;

        let eligible = self
            .orders
            .is_fulfillable(order_id)
            .await
            .map_err(|e| ReservationError::Gateway(e.to_string()))?;
        if !eligible {
            return Err(ReservationError::OrderNotEligible(order_id));
        }

        let substitution = self
            .with_retry("substitute_damaged", move || self.try_substitute(order_id, reservation_id, note))
            .await?;

        info!(
            "Wrote off {} damaged units of batch {} for order {}, replaced from {} batches",
            reservation.quantity,
            reservation.batch_id,
            order_id,
            substitution.replacements.len()
        );
        Ok(substitution)
    }

    async fn checked_open_reservation(&self, order_id: Uuid, reservation_id: Uuid) -> ReservationResult<Reservation> {
        let reservation = self
            .store
            .reservation(reservation_id)
            .await?
            .ok_or(ReservationError::ReservationNotFound(reservation_id))?;

        if reservation.order_id != order_id {
            return Err(ReservationError::invalid(format!(
                "reservation {} does not belong to order {}",
                reservation_id, order_id
            )));
        }
        if !reservation.is_open() {
            return Err(ReservationError::NotReserved {
                reservation_id,
                status: reservation.status,
            });
        }
        Ok(reservation)
    }

    async fn try_substitute(&self, order_id: Uuid, reservation_id: Uuid, note: &str) -> ReservationResult<Substitution> {
        let damaged = self.checked_open_reservation(order_id, reservation_id).await?;
        let now = Utc::now();
        let today = now.date_naive();
        let quantity = damaged.quantity;

        let batch = self
            .store
            .batch(damaged.batch_id)
            .await?
            .ok_or_else(|| missing_batch(damaged.batch_id))?;
        let stock = self
            .store
            .stock(damaged.variant_id)
            .await?
            .ok_or_else(|| missing_stock(damaged.variant_id))?;

        let adjustment = StockAdjustment {
            id: Uuid::new_v4(),
            batch_id: batch.id,
            variant_id: batch.variant_id,
            quantity: -quantity,
            reason: AdjustmentReason::Damage,
            note: Some(note.to_string()),
            reservation_id: Some(damaged.id),
            created_at: now,
        };

        let mut draft = Draft::default();
        draft.transition(damaged.id, ReservationStatus::Released);
        draft.batch(&batch, -quantity, -quantity);
        draft.stock(&stock, -quantity, -quantity);
        draft.record(adjustment.clone());

        // Writing off reserved units leaves the batch's unreserved capacity unchanged.
        let same_batch = if batch.is_expired(today) { 0 } else { batch.available().min(quantity) };
        let mut plan = Vec::new();
        if same_batch > 0 {
            plan.push((batch.clone(), same_batch));
        }

        let rest = quantity - same_batch;
        if rest > 0 {
            let others = self.store.sellable_batches(batch.variant_id, today).await?;
            let excluded: HashSet<Uuid> = [batch.id].into_iter().collect();
            let allocations = allocator::allocate(&others, batch.variant_id, rest, today, &excluded)
                .map_err(|e| {
                    let available = match e {
                        AllocationError::Shortfall { available, .. } => available,
                        AllocationError::InvalidQuantity(_) => 0,
                    };
                    ReservationError::ReplacementUnavailable {
                        variant_id: batch.variant_id,
                        requested: quantity,
                        available: available.saturating_add(same_batch),
                    }
                })?;

            for allocation in allocations {
                let source = others
                    .iter()
                    .find(|b| b.id == allocation.batch_id)
                    .ok_or_else(|| missing_batch(allocation.batch_id))?;
                plan.push((source.clone(), allocation.quantity));
            }
        }

        let mut replacements = Vec::with_capacity(plan.len());
        for (source, take) in &plan {
            draft.batch(source, 0, *take);
            let replacement = Reservation::new(
                order_id,
                source.id,
                source.variant_id,
                *take,
                damaged.expires_at,
                now,
            );
            draft.insert(replacement.clone());
            replacements.push(replacement);
        }
        draft.stock(&stock, 0, quantity);

        self.store.apply(draft.finish()?).await?;

        let mut released = damaged;
        released.status = ReservationStatus::Released;
        released.updated_at = now;

        Ok(Substitution {
            damaged: released,
            adjustment,
            replacements,
        })
    }

    /// Record newly received stock.
    pub async fn receive_batch(&self, new_batch: NewBatch) -> ReservationResult<Batch> {
        if new_batch.quantity <= 0 {
            return Err(ReservationError::invalid("received quantity must be positive"));
        }
        if new_batch.batch_code.trim().is_empty() {
            return Err(ReservationError::invalid("batch code is required"));
        }
        if new_batch.manufacture_date.is_some_and(|made| made > new_batch.expiry_date) {
            return Err(ReservationError::invalid("batch expires before it was manufactured"));
        }
        if new_batch.low_stock_threshold.is_some_and(|t| t < 0) {
            return Err(ReservationError::invalid("low stock threshold must not be negative"));
        }

        let threshold = new_batch.low_stock_threshold;
        let batch = new_batch.into_batch(Utc::now());
        self.store.receive_batch(batch.clone(), threshold).await?;

        info!(
            "Received batch {} ({}) of {} units for variant {}",
            batch.id, batch.batch_code, batch.import_quantity, batch.variant_id
        );
        Ok(batch)
    }

    /// Correct a batch's physical count by `delta` units.
    pub async fn adjust_batch(&self, batch_id: Uuid, delta: i32, note: &str) -> ReservationResult<StockAdjustment> {
        if delta == 0 {
            return Err(ReservationError::invalid("adjustment must change the quantity"));
        }

        let adjustment = self
            .with_retry("adjust_batch", || async move {
                let batch = self
                    .store
                    .batch(batch_id)
                    .await?
                    .ok_or(ReservationError::BatchNotFound(batch_id))?;

                let remaining = batch.remaining_quantity + delta;
                if !Batch::quantities_valid(remaining, batch.reserved_quantity, batch.import_quantity) {
                    return Err(ReservationError::invalid(format!(
                        "batch {} cannot go to {} units with {} reserved of {} imported",
                        batch_id, remaining, batch.reserved_quantity, batch.import_quantity
                    )));
                }

                let stock = self
                    .store
                    .stock(batch.variant_id)
                    .await?
                    .ok_or_else(|| missing_stock(batch.variant_id))?;

                let adjustment = StockAdjustment {
                    id: Uuid::new_v4(),
                    batch_id,
                    variant_id: batch.variant_id,
                    quantity: delta,
                    reason: AdjustmentReason::Correction,
                    note: Some(note.to_string()),
                    reservation_id: None,
                    created_at: Utc::now(),
                };

                let mut draft = Draft::default();
                draft.batch(&batch, delta, 0);
                draft.stock(&stock, delta, 0);
                draft.record(adjustment.clone());
                self.store.apply(draft.finish()?).await?;
                Ok(adjustment)
            })
            .await?;

        info!("Adjusted batch {} by {} units", batch_id, delta);
        Ok(adjustment)
    }

    /// Units of the variant not claimed by open reservations; zero for unknown variants.
    pub async fn available_quantity(&self, variant_id: Uuid) -> ReservationResult<i32> {
        Ok(self
            .store
            .stock(variant_id)
            .await?
            .map(|s| s.available())
            .unwrap_or(0))
    }

    pub async fn stock(&self, variant_id: Uuid) -> ReservationResult<Option<StockAggregate>> {
        Ok(self.store.stock(variant_id).await?)
    }

    pub async fn order_reservations(&self, order_id: Uuid) -> ReservationResult<Vec<Reservation>> {
        Ok(self.store.reservations_for_order(order_id).await?)
    }

    pub async fn expired_reservations(&self, now: DateTime<Utc>, limit: i64) -> ReservationResult<Vec<Reservation>> {
        Ok(self.store.expired_reservations(now, limit).await?)
    }

    pub async fn batch_adjustments(&self, batch_id: Uuid) -> ReservationResult<Vec<StockAdjustment>> {
        Ok(self.store.adjustments_for_batch(batch_id).await?)
    }

    pub async fn batches(&self, variant_id: Uuid) -> ReservationResult<Vec<Batch>> {
        Ok(self.store.batches_for_variant(variant_id).await?)
    }

    /// Compare the variant's cached counters with the batch and ledger sums.
    pub async fn reconcile(&self, variant_id: Uuid) -> ReservationResult<Reconciliation> {
        let stock = self.store.stock(variant_id).await?;
        let batches = self.store.batches_for_variant(variant_id).await?;
        let open = self.store.open_reservations_for_variant(variant_id).await?;

        let report = Reconciliation {
            variant_id,
            aggregate_total: stock.as_ref().map(|s| s.total_quantity).unwrap_or(0),
            aggregate_reserved: stock.as_ref().map(|s| s.reserved_quantity).unwrap_or(0),
            batch_remaining: batches.iter().map(|b| i64::from(b.remaining_quantity)).sum(),
            batch_reserved: batches.iter().map(|b| i64::from(b.reserved_quantity)).sum(),
            ledger_reserved: open.iter().map(|r| i64::from(r.quantity)).sum(),
        };

        if !report.is_consistent() {
            warn!("Stock counters for variant {} drifted: {:?}", variant_id, report);
        }
        Ok(report)
    }
}
