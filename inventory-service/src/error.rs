//! Error model for the reservation engine.

use thiserror::Error;
use uuid::Uuid;

use crate::models::ReservationStatus;

/// Storage-level failure.
///
/// `Conflict` is the only variant the service retries: it means a version
/// token or a reservation status changed between the snapshot and the write,
/// and the whole transaction was rolled back.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("quantity invariant violated: {0}")]
    Invariant(String),

    #[error("stored value is unreadable: {0}")]
    Corrupt(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for StoreError {
    fn from(err: bb8::RunError<E>) -> Self {
        StoreError::Pool(err.to_string())
    }
}

/// Result type of the reservation service.
pub type ReservationResult<T> = Result<T, ReservationError>;

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("gave up after {attempts} attempts on concurrent modification")]
    TransientConflict { attempts: u32 },

    #[error("order {0} has no reservations")]
    OrderNotFound(Uuid),

    #[error("reservation {0} not found")]
    ReservationNotFound(Uuid),

    #[error("batch {0} not found")]
    BatchNotFound(Uuid),

    #[error("reservation {reservation_id} is {status}, not reserved")]
    NotReserved {
        reservation_id: Uuid,
        status: ReservationStatus,
    },

    #[error("order {0} is not in a fulfillment-eligible state")]
    OrderNotEligible(Uuid),

    #[error("no replacement stock for variant {variant_id}: requested {requested}, available {available}")]
    ReplacementUnavailable {
        variant_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("order service error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReservationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReservationError::TransientConflict { .. } | ReservationError::Gateway(_)
        )
    }
}
