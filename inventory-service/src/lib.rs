pub mod allocator;
pub mod api;
pub mod error;
pub mod handlers;
pub mod models;
pub mod orders;
pub mod schema;
pub mod service;
pub mod store;
pub mod sweeper;

pub use error::{ReservationError, ReservationResult, StoreError};
pub use service::{ReservationConfig, ReservationService};
