use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ReservationResult;
use crate::service::ReservationService;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Upper bound on expired reservations picked up per pass.
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub orders_swept: usize,
    pub reservations_released: usize,
    pub orders_cancelled: usize,
    pub failures: usize,
}

/// Releases reservations whose deadline passed without a commit, and cancels
/// orders that were still waiting for payment when they lapsed.
pub struct ExpirySweeper {
    service: Arc<ReservationService>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(service: Arc<ReservationService>, config: SweeperConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.interval);

        loop {
            interval.tick().await;

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.orders_swept > 0 => info!(
                    "Expiry sweep released {} reservations over {} orders, cancelled {}, {} failed",
                    report.reservations_released,
                    report.orders_swept,
                    report.orders_cancelled,
                    report.failures
                ),
                Ok(_) => {}
                Err(e) => error!("Error querying expired reservations: {}", e),
            }
        }
    }

    /// One pass over reservations expired at `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> ReservationResult<SweepReport> {
        let expired = self
            .service
            .expired_reservations(now, self.config.batch_size)
            .await?;

        let mut by_order: BTreeMap<Uuid, usize> = BTreeMap::new();
        for reservation in &expired {
            *by_order.entry(reservation.order_id).or_default() += 1;
        }

        let mut report = SweepReport::default();
        for order_id in by_order.into_keys() {
            report.orders_swept += 1;

            let settlement = match self.service.release_expired(order_id, now).await {
                Ok(settlement) => settlement,
                Err(e) => {
                    report.failures += 1;
                    error!("Failed to release expired reservations of order {}: {}", order_id, e);
                    continue;
                }
            };

            if settlement.is_noop() {
                // Settled by someone else between the query and the release.
                continue;
            }
            report.reservations_released += settlement.reservations;

            match self.cancel_if_pending(order_id).await {
                Ok(true) => report.orders_cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!("Released order {} but could not cancel it: {}", order_id, e);
                }
            }
        }

        Ok(report)
    }

    async fn cancel_if_pending(&self, order_id: Uuid) -> anyhow::Result<bool> {
        let orders = self.service.orders();
        if !orders.is_pending(order_id).await? {
            return Ok(false);
        }
        orders.cancel(order_id).await?;
        Ok(true)
    }
}
