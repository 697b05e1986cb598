use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::debug;
use uuid::Uuid;

use super::{ChangeSet, InventoryStore};
use crate::error::StoreError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

const RESERVED: &str = "reserved";

/// PostgreSQL store. Version tokens are compared in the `WHERE` clause of each
/// update; a row count other than one rolls the transaction back as a conflict.
#[derive(Clone)]
pub struct PgInventoryStore {
    pool: DbPool,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn into_reservations(rows: Vec<DbReservation>) -> Result<Vec<Reservation>, StoreError> {
    rows.into_iter().map(Reservation::try_from).collect()
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn batch(&self, batch_id: Uuid) -> Result<Option<Batch>, StoreError> {
        let mut conn = self.pool.get().await?;
        let batch = batches::table
            .filter(batches::id.eq(batch_id))
            .first::<Batch>(&mut conn)
            .await
            .optional()?;
        Ok(batch)
    }

    async fn batches_for_variant(&self, variant_id: Uuid) -> Result<Vec<Batch>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = batches::table
            .filter(batches::variant_id.eq(variant_id))
            .order((batches::expiry_date.asc(), batches::id.asc()))
            .load::<Batch>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn sellable_batches(
        &self,
        variant_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = batches::table
            .filter(batches::variant_id.eq(variant_id))
            .filter(batches::expiry_date.ge(today))
            .filter(batches::remaining_quantity.gt(batches::reserved_quantity))
            .order((batches::expiry_date.asc(), batches::id.asc()))
            .load::<Batch>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn stock(&self, variant_id: Uuid) -> Result<Option<StockAggregate>, StoreError> {
        let mut conn = self.pool.get().await?;
        let stock = stock_aggregates::table
            .filter(stock_aggregates::variant_id.eq(variant_id))
            .first::<StockAggregate>(&mut conn)
            .await
            .optional()?;
        Ok(stock)
    }

    async fn reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row = reservations::table
            .filter(reservations::id.eq(reservation_id))
            .first::<DbReservation>(&mut conn)
            .await
            .optional()?;
        row.map(Reservation::try_from).transpose()
    }

    async fn reservations_for_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .order(reservations::created_at.asc())
            .load::<DbReservation>(&mut conn)
            .await?;
        into_reservations(rows)
    }

    async fn open_reservations_for_variant(
        &self,
        variant_id: Uuid,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = reservations::table
            .filter(reservations::variant_id.eq(variant_id))
            .filter(reservations::status.eq(RESERVED))
            .load::<DbReservation>(&mut conn)
            .await?;
        into_reservations(rows)
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = reservations::table
            .filter(reservations::status.eq(RESERVED))
            .filter(reservations::expires_at.le(now))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .load::<DbReservation>(&mut conn)
            .await?;
        into_reservations(rows)
    }

    async fn adjustments_for_batch(&self, batch_id: Uuid) -> Result<Vec<StockAdjustment>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = stock_adjustments::table
            .filter(stock_adjustments::batch_id.eq(batch_id))
            .order(stock_adjustments::created_at.asc())
            .load::<DbStockAdjustment>(&mut conn)
            .await?;
        rows.into_iter().map(StockAdjustment::try_from).collect()
    }

    async fn receive_batch(
        &self,
        batch: Batch,
        low_stock_threshold: Option<i32>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, StoreError, _>(move |conn| {
            Box::pin(async move {
                let now = Utc::now();
                let quantity = batch.remaining_quantity;

                diesel::insert_into(batches::table)
                    .values(&batch)
                    .execute(conn)
                    .await?;

                let aggregate = StockAggregate {
                    variant_id: batch.variant_id,
                    total_quantity: quantity,
                    reserved_quantity: 0,
                    low_stock_threshold: low_stock_threshold.unwrap_or(0),
                    version: 1,
                    updated_at: now,
                };

                diesel::insert_into(stock_aggregates::table)
                    .values(&aggregate)
                    .on_conflict(stock_aggregates::variant_id)
                    .do_update()
                    .set((
                        stock_aggregates::total_quantity.eq(stock_aggregates::total_quantity + quantity),
                        stock_aggregates::version.eq(stock_aggregates::version + 1),
                        stock_aggregates::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                if let Some(threshold) = low_stock_threshold {
                    diesel::update(stock_aggregates::table.filter(stock_aggregates::variant_id.eq(batch.variant_id)))
                        .set(stock_aggregates::low_stock_threshold.eq(threshold))
                        .execute(conn)
                        .await?;
                }

                Ok(())
            })
        })
        .await
    }

    async fn apply(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get().await?;

        conn.transaction::<_, StoreError, _>(move |conn| {
            Box::pin(async move {
                let now = Utc::now();

                for write in &changes.batches {
                    let updated = diesel::update(
                        batches::table
                            .filter(batches::id.eq(write.batch_id))
                            .filter(batches::version.eq(write.expected_version)),
                    )
                    .set((
                        batches::remaining_quantity.eq(write.remaining_quantity),
                        batches::reserved_quantity.eq(write.reserved_quantity),
                        batches::version.eq(write.expected_version + 1),
                        batches::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                    if updated != 1 {
                        return Err(StoreError::Conflict(format!(
                            "batch {} is no longer at version {}",
                            write.batch_id, write.expected_version
                        )));
                    }
                }

                for write in &changes.stocks {
                    let updated = diesel::update(
                        stock_aggregates::table
                            .filter(stock_aggregates::variant_id.eq(write.variant_id))
                            .filter(stock_aggregates::version.eq(write.expected_version)),
                    )
                    .set((
                        stock_aggregates::total_quantity.eq(write.total_quantity),
                        stock_aggregates::reserved_quantity.eq(write.reserved_quantity),
                        stock_aggregates::version.eq(write.expected_version + 1),
                        stock_aggregates::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                    if updated != 1 {
                        return Err(StoreError::Conflict(format!(
                            "stock of variant {} is no longer at version {}",
                            write.variant_id, write.expected_version
                        )));
                    }
                }

                for transition in &changes.transitions {
                    let updated = diesel::update(
                        reservations::table
                            .filter(reservations::id.eq(transition.reservation_id))
                            .filter(reservations::status.eq(RESERVED)),
                    )
                    .set((
                        reservations::status.eq(transition.to.as_str()),
                        reservations::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                    if updated != 1 {
                        return Err(StoreError::Conflict(format!(
                            "reservation {} is no longer reserved",
                            transition.reservation_id
                        )));
                    }
                }

                if !changes.reservations.is_empty() {
                    let rows: Vec<DbReservation> =
                        changes.reservations.iter().map(DbReservation::from).collect();
                    diesel::insert_into(reservations::table)
                        .values(&rows)
                        .execute(conn)
                        .await?;
                }

                if !changes.adjustments.is_empty() {
                    let rows: Vec<DbStockAdjustment> =
                        changes.adjustments.iter().map(DbStockAdjustment::from).collect();
                    diesel::insert_into(stock_adjustments::table)
                        .values(&rows)
                        .execute(conn)
                        .await?;
                }

                debug!(
                    batches = changes.batches.len(),
                    stocks = changes.stocks.len(),
                    transitions = changes.transitions.len(),
                    inserted = changes.reservations.len(),
                    "applied change set"
                );

                Ok(())
            })
        })
        .await
    }
}
