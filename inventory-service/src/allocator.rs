//! First-expiry-first-out batch selection.
//!
//! Planning only: nothing here touches storage. The service turns a plan into
//! guarded writes.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use crate::models::Batch;

/// Quantity to draw from one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub batch_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    InvalidQuantity(i32),
    Shortfall { requested: i32, available: i32 },
}

/// Batches of `variant_id` that can be drawn from on `today`, in draw order.
///
/// Ties on expiry date are broken by batch id so that plans are reproducible.
pub fn eligible<'a>(
    batches: &'a [Batch],
    variant_id: Uuid,
    today: NaiveDate,
    excluded: &HashSet<Uuid>,
) -> Vec<&'a Batch> {
    let mut candidates: Vec<&Batch> = batches
        .iter()
        .filter(|b| b.variant_id == variant_id)
        .filter(|b| !excluded.contains(&b.id))
        .filter(|b| !b.is_expired(today))
        .filter(|b| b.available() > 0)
        .collect();

    candidates.sort_by(|a, b| a.expiry_date.cmp(&b.expiry_date).then(a.id.cmp(&b.id)));
    candidates
}

/// Plan `quantity` units of `variant_id` across `batches`.
///
/// Either the whole quantity is covered or nothing is planned.
pub fn allocate(
    batches: &[Batch],
    variant_id: Uuid,
    quantity: i32,
    today: NaiveDate,
    excluded: &HashSet<Uuid>,
) -> Result<Vec<Allocation>, AllocationError> {
    if quantity <= 0 {
        return Err(AllocationError::InvalidQuantity(quantity));
    }

    let candidates = eligible(batches, variant_id, today, excluded);

    let available: i64 = candidates.iter().map(|b| i64::from(b.available())).sum();
    if available < i64::from(quantity) {
        return Err(AllocationError::Shortfall {
            requested: quantity,
            available: i32::try_from(available).unwrap_or(i32::MAX),
        });
    }

    let mut need = quantity;
    let mut plan = Vec::new();
    for batch in candidates {
        if need == 0 {
            break;
        }
        let take = need.min(batch.available());
        plan.push(Allocation {
            batch_id: batch.id,
            quantity: take,
        });
        need -= take;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn batch(variant_id: Uuid, expires_in_days: i64, remaining: i32, reserved: i32) -> Batch {
        let now = Utc::now();
        Batch {
            id: Uuid::new_v4(),
            variant_id,
            batch_code: format!("LOT-{expires_in_days}"),
            manufacture_date: None,
            expiry_date: today() + Duration::days(expires_in_days),
            import_quantity: remaining.max(1),
            remaining_quantity: remaining,
            reserved_quantity: reserved,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn draws_earliest_expiry_first() {
        let sku = Uuid::new_v4();
        let late = batch(sku, 30, 5, 0);
        let early = batch(sku, 10, 5, 0);
        let middle = batch(sku, 20, 5, 0);
        let batches = vec![late.clone(), early.clone(), middle.clone()];

        let plan = allocate(&batches, sku, 7, today(), &HashSet::new()).unwrap();

        assert_eq!(
            plan,
            vec![
                Allocation { batch_id: early.id, quantity: 5 },
                Allocation { batch_id: middle.id, quantity: 2 },
            ]
        );
    }

    #[test]
    fn skips_expired_and_fully_reserved_batches() {
        let sku = Uuid::new_v4();
        let expired = batch(sku, -1, 10, 0);
        let full = batch(sku, 5, 4, 4);
        let usable = batch(sku, 6, 4, 1);
        let batches = vec![expired, full, usable.clone()];

        let plan = allocate(&batches, sku, 3, today(), &HashSet::new()).unwrap();
        assert_eq!(plan, vec![Allocation { batch_id: usable.id, quantity: 3 }]);
    }

    #[test]
    fn batch_expiring_today_is_eligible() {
        let sku = Uuid::new_v4();
        let b = batch(sku, 0, 2, 0);
        let plan = allocate(std::slice::from_ref(&b), sku, 2, today(), &HashSet::new()).unwrap();
        assert_eq!(plan, vec![Allocation { batch_id: b.id, quantity: 2 }]);
    }

    #[test]
    fn shortfall_reports_total_available() {
        let sku = Uuid::new_v4();
        let batches = vec![batch(sku, 1, 3, 1), batch(sku, 2, 4, 0)];

        let err = allocate(&batches, sku, 10, today(), &HashSet::new()).unwrap_err();
        assert_eq!(err, AllocationError::Shortfall { requested: 10, available: 6 });
    }

    #[test]
    fn excluded_batches_are_ignored() {
        let sku = Uuid::new_v4();
        let first = batch(sku, 1, 5, 0);
        let second = batch(sku, 2, 5, 0);
        let excluded: HashSet<Uuid> = [first.id].into_iter().collect();

        let plan = allocate(&[first, second.clone()], sku, 5, today(), &excluded).unwrap();
        assert_eq!(plan, vec![Allocation { batch_id: second.id, quantity: 5 }]);
    }

    #[test]
    fn other_variants_are_ignored() {
        let sku = Uuid::new_v4();
        let other = batch(Uuid::new_v4(), 1, 100, 0);

        let err = allocate(&[other], sku, 1, today(), &HashSet::new()).unwrap_err();
        assert_eq!(err, AllocationError::Shortfall { requested: 1, available: 0 });
    }

    #[test]
    fn equal_expiry_breaks_ties_by_id() {
        let sku = Uuid::new_v4();
        let a = batch(sku, 3, 2, 0);
        let b = batch(sku, 3, 2, 0);
        let (low, high) = if a.id < b.id { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };

        let plan = allocate(&[high.clone(), low.clone()], sku, 3, today(), &HashSet::new()).unwrap();
        assert_eq!(plan[0].batch_id, low.id);
        assert_eq!(plan[1], Allocation { batch_id: high.id, quantity: 1 });
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let sku = Uuid::new_v4();
        assert_eq!(
            allocate(&[], sku, 0, today(), &HashSet::new()),
            Err(AllocationError::InvalidQuantity(0))
        );
    }
}
