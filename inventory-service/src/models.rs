use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;

use crate::error::StoreError;

/// A physical lot of one variant received on a given date.
#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::batches)]
pub struct Batch {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub batch_code: String,
    pub manufacture_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
    pub import_quantity: i32,
    pub remaining_quantity: i32,
    pub reserved_quantity: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// Units that can still be reserved from this batch.
    pub fn available(&self) -> i32 {
        self.remaining_quantity - self.reserved_quantity
    }

    /// A batch expiring today is still sellable today.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date < today
    }

    pub fn quantities_valid(remaining: i32, reserved: i32, import: i32) -> bool {
        0 <= reserved && reserved <= remaining && remaining <= import
    }
}

/// Per-variant totals across all batches.
#[derive(Debug, Clone, PartialEq, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock_aggregates)]
pub struct StockAggregate {
    pub variant_id: Uuid,
    pub total_quantity: i32,
    pub reserved_quantity: i32,
    pub low_stock_threshold: i32,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

impl StockAggregate {
    pub fn available(&self) -> i32 {
        self.total_quantity - self.reserved_quantity
    }

    pub fn is_low_stock(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Committed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reserved" => Some(ReservationStatus::Reserved),
            "committed" => Some(ReservationStatus::Committed),
            "released" => Some(ReservationStatus::Released),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim of one order on part of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub batch_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(
        order_id: Uuid,
        batch_id: Uuid,
        variant_id: Uuid,
        quantity: i32,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            batch_id,
            variant_id,
            quantity,
            status: ReservationStatus::Reserved,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct DbReservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub batch_id: Uuid,
    pub variant_id: Uuid,
    pub reserved_quantity: i32,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Reservation> for DbReservation {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            order_id: r.order_id,
            batch_id: r.batch_id,
            variant_id: r.variant_id,
            reserved_quantity: r.quantity,
            status: r.status.as_str().to_string(),
            expires_at: r.expires_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl TryFrom<DbReservation> for Reservation {
    type Error = StoreError;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        let status = ReservationStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("reservation {} has status '{}'", row.id, row.status))
        })?;

        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            batch_id: row.batch_id,
            variant_id: row.variant_id,
            quantity: row.reserved_quantity,
            status,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    Damage,
    Correction,
}

impl AdjustmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentReason::Damage => "damage",
            AdjustmentReason::Correction => "correction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "damage" => Some(AdjustmentReason::Damage),
            "correction" => Some(AdjustmentReason::Correction),
            _ => None,
        }
    }
}

/// Audit entry for a change to a batch's physical quantity outside of order settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub reason: AdjustmentReason,
    pub note: Option<String>,
    pub reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::stock_adjustments)]
pub struct DbStockAdjustment {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub reason: String,
    pub note: Option<String>,
    pub reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<&StockAdjustment> for DbStockAdjustment {
    fn from(a: &StockAdjustment) -> Self {
        Self {
            id: a.id,
            batch_id: a.batch_id,
            variant_id: a.variant_id,
            quantity: a.quantity,
            reason: a.reason.as_str().to_string(),
            note: a.note.clone(),
            reservation_id: a.reservation_id,
            created_at: a.created_at,
        }
    }
}

impl TryFrom<DbStockAdjustment> for StockAdjustment {
    type Error = StoreError;

    fn try_from(row: DbStockAdjustment) -> Result<Self, Self::Error> {
        let reason = AdjustmentReason::parse(&row.reason).ok_or_else(|| {
            StoreError::Corrupt(format!("adjustment {} has reason '{}'", row.id, row.reason))
        })?;

        Ok(Self {
            id: row.id,
            batch_id: row.batch_id,
            variant_id: row.variant_id,
            quantity: row.quantity,
            reason,
            note: row.note,
            reservation_id: row.reservation_id,
            created_at: row.created_at,
        })
    }
}

/// Stock received into the warehouse as a new batch.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBatch {
    pub variant_id: Uuid,
    pub batch_code: String,
    #[serde(default)]
    pub manufacture_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
    pub quantity: i32,
    /// Applied to the variant's aggregate when present.
    #[serde(default)]
    pub low_stock_threshold: Option<i32>,
}

impl NewBatch {
    pub fn into_batch(self, now: DateTime<Utc>) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            variant_id: self.variant_id,
            batch_code: self.batch_code,
            manufacture_date: self.manufacture_date,
            expiry_date: self.expiry_date,
            import_quantity: self.quantity,
            remaining_quantity: self.quantity,
            reserved_quantity: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_commands)]
pub struct ProcessedCommand {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub result: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(remaining: i32, reserved: i32) -> Batch {
        let now = Utc::now();
        Batch {
            id: Uuid::new_v4(),
            variant_id: Uuid::new_v4(),
            batch_code: "LOT-1".to_string(),
            manufacture_date: None,
            expiry_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            import_quantity: 10,
            remaining_quantity: remaining,
            reserved_quantity: reserved,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn available_is_remaining_minus_reserved() {
        assert_eq!(batch(10, 3).available(), 7);
        assert_eq!(batch(3, 3).available(), 0);
    }

    #[test]
    fn batch_expiring_today_is_not_expired() {
        let b = batch(10, 0);
        assert!(!b.is_expired(b.expiry_date));
        assert!(b.is_expired(b.expiry_date.succ_opt().unwrap()));
    }

    #[test]
    fn quantity_invariant() {
        assert!(Batch::quantities_valid(7, 3, 10));
        assert!(Batch::quantities_valid(0, 0, 10));
        assert!(!Batch::quantities_valid(3, 4, 10));
        assert!(!Batch::quantities_valid(11, 0, 10));
        assert!(!Batch::quantities_valid(5, -1, 10));
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let now = Utc::now();
        let row = DbReservation {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            variant_id: Uuid::new_v4(),
            reserved_quantity: 1,
            status: "cancelled".to_string(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        };

        assert!(matches!(Reservation::try_from(row), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn reservation_without_deadline_never_expires() {
        let now = Utc::now();
        let r = Reservation::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 1, None, now);
        assert!(!r.is_expired_at(now + chrono::Duration::days(365)));

        let r = Reservation::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 1, Some(now), now);
        assert!(r.is_expired_at(now));
    }

    #[test]
    fn low_stock_uses_available_quantity() {
        let aggregate = StockAggregate {
            variant_id: Uuid::new_v4(),
            total_quantity: 20,
            reserved_quantity: 15,
            low_stock_threshold: 5,
            version: 1,
            updated_at: Utc::now(),
        };
        assert_eq!(aggregate.available(), 5);
        assert!(aggregate.is_low_stock());
    }
}
