use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::ReserveItem;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ReservationError;
use crate::models::{Batch, NewBatch, Reservation, StockAdjustment};
use crate::service::{ReservationService, Settlement, Substitution};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReservationService>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub variant_id: Uuid,
    pub total_quantity: i32,
    pub reserved_quantity: i32,
    pub available_quantity: i32,
    pub low_stock: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub items: Vec<ReserveItem>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct DamageRequest {
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub delta: i32,
    pub note: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stock/:variant_id", get(get_stock))
        .route("/batches", post(receive_batch))
        .route("/batches/:batch_id/adjustments", post(adjust_batch))
        .route("/orders/:order_id/reservations", post(reserve))
        .route("/orders/:order_id/commit", post(commit))
        .route("/orders/:order_id/release", post(release))
        .route(
            "/orders/:order_id/reservations/:reservation_id/damage",
            post(substitute_damaged),
        )
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn error_response(err: ReservationError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        ReservationError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ReservationError::OrderNotFound(_)
        | ReservationError::ReservationNotFound(_)
        | ReservationError::BatchNotFound(_) => StatusCode::NOT_FOUND,
        ReservationError::InsufficientStock { .. }
        | ReservationError::NotReserved { .. }
        | ReservationError::OrderNotEligible(_)
        | ReservationError::ReplacementUnavailable { .. } => StatusCode::CONFLICT,
        ReservationError::TransientConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ReservationError::Gateway(_) => StatusCode::BAD_GATEWAY,
        ReservationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }

    (status, Json(ErrorResponse { error: err.to_string() }))
}

pub async fn get_stock(
    State(state): State<AppState>,
    Path(variant_id): Path<Uuid>,
) -> ApiResult<StockResponse> {
    match state.service.stock(variant_id).await.map_err(error_response)? {
        Some(stock) => Ok(Json(StockResponse {
            variant_id,
            total_quantity: stock.total_quantity,
            reserved_quantity: stock.reserved_quantity,
            available_quantity: stock.available(),
            low_stock: stock.is_low_stock(),
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no stock recorded for variant {}", variant_id),
            }),
        )),
    }
}

pub async fn receive_batch(
    State(state): State<AppState>,
    Json(request): Json<NewBatch>,
) -> ApiResult<Batch> {
    state.service.receive_batch(request).await.map(Json).map_err(error_response)
}

pub async fn adjust_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Json(request): Json<AdjustmentRequest>,
) -> ApiResult<StockAdjustment> {
    state
        .service
        .adjust_batch(batch_id, request.delta, &request.note)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn reserve(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<ReserveRequest>,
) -> ApiResult<Vec<Reservation>> {
    state
        .service
        .reserve(order_id, &request.items, request.expires_at)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn commit(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<Settlement> {
    state.service.commit(order_id).await.map(Json).map_err(error_response)
}

pub async fn release(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<Settlement> {
    state.service.release(order_id).await.map(Json).map_err(error_response)
}

pub async fn substitute_damaged(
    State(state): State<AppState>,
    Path((order_id, reservation_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<DamageRequest>,
) -> ApiResult<Substitution> {
    state
        .service
        .substitute_damaged(order_id, reservation_id, &request.note)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn health_check() -> &'static str {
    "OK"
}
