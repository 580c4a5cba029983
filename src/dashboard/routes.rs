//! Operations API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<OpsState>`; each
//! component is optional because a process only hosts the components of its
//! role, and a request for a missing one answers 503.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::engine::intake::Intake;
use crate::engine::orders::{OrderEngine, OrderOutcome, OrderRejection, OrderRequest};
use crate::engine::reconciler::{ReconcileOutcome, Reconciler};
use crate::market::{SharedTierBook, TierStatus};
use crate::storage::queue::QueueStats;
use crate::storage::QueueStore;
use crate::types::{EngineError, Purpose, QueueEntry};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct OpsState {
    pub role: String,
    pub started_at: DateTime<Utc>,
    pub book: SharedTierBook,
    pub queue: Option<QueueStore>,
    pub intake: Option<Intake>,
    pub orders: Option<OrderEngine>,
    pub reconciler: Option<Arc<Reconciler>>,
}

impl OpsState {
    pub fn new(role: impl Into<String>, book: SharedTierBook) -> Self {
        Self {
            role: role.into(),
            started_at: Utc::now(),
            book,
            queue: None,
            intake: None,
            orders: None,
            reconciler: None,
        }
    }
}

pub type AppState = Arc<OpsState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// JSON error response.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Unavailable(&'static str),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unavailable(component) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                format!("{component} is not hosted by this process"),
            ),
            ApiError::Engine(e) => {
                let (status, code) = match &e {
                    EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                    EngineError::DuplicateKey(_) => (StatusCode::CONFLICT, "duplicate_key"),
                    EngineError::InvalidTransition { .. } => {
                        (StatusCode::CONFLICT, "invalid_transition")
                    }
                    EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    EngineError::ConcurrentUpdate(_) => {
                        (StatusCode::CONFLICT, "concurrent_update")
                    }
                    EngineError::PartialResolve { .. } => {
                        (StatusCode::CONFLICT, "partial_resolve")
                    }
                    EngineError::Decode(_) | EngineError::Database(_) => {
                        warn!(error = %e, "Internal error serving ops request");
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                    }
                };
                (status, code, e.to_string())
            }
        };
        (status, Json(json!({ "status": "failed", "error": error, "message": message })))
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn queue(state: &OpsState) -> ApiResult<&QueueStore> {
    state.queue.as_ref().ok_or(ApiError::Unavailable("queue"))
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub uuid: Uuid,
    #[serde(alias = "accountid")]
    pub account_id: String,
    pub amount: Decimal,
    pub purpose: Purpose,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRequest {
    /// Rewind the watermark to this instant before the pass.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub role: String,
    pub uptime_secs: i64,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        role: state.role.clone(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/v1/queue/stats
pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(queue(&state)?.stats().await?))
}

/// GET /api/v1/queue/:uuid
pub async fn get_entry(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<QueueEntry>> {
    queue(&state)?
        .get(uuid)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("queue entry {uuid}")).into())
}

/// POST /api/v1/queue
pub async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<QueueEntry>)> {
    let intake = state.intake.as_ref().ok_or(ApiError::Unavailable("intake"))?;
    let entry = intake
        .submit(req.uuid, &req.account_id, req.amount, req.purpose)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// POST /api/v1/queue/:uuid/retry
pub async fn retry_entry(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<QueueEntry>> {
    Ok(Json(queue(&state)?.retry(uuid).await?))
}

/// POST /api/v1/queue/:uuid/cancel
pub async fn cancel_entry(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<QueueEntry>> {
    Ok(Json(queue(&state)?.cancel(uuid).await?))
}

/// GET /api/v1/tier-status
pub async fn get_tier_status(State(state): State<AppState>) -> Json<TierStatus> {
    Json(TierStatus::from(state.book.snapshot().await))
}

/// POST /api/v1/tier-status
pub async fn update_tier_status(
    State(state): State<AppState>,
    Json(patch): Json<TierStatus>,
) -> ApiResult<Json<TierStatus>> {
    if patch.has_negative() {
        return Err(EngineError::Validation("tier values must be non-negative".into()).into());
    }
    let values = state.book.update(&patch).await;
    Ok(Json(TierStatus::from(values)))
}

/// POST /api/v1/execute-order
///
/// 200 when the order fills, 400 with the rejection reason otherwise.
pub async fn execute_order(
    State(state): State<AppState>,
    Json(req): Json<OrderRequest>,
) -> ApiResult<(StatusCode, Json<OrderOutcome>)> {
    let orders = state.orders.as_ref().ok_or(ApiError::Unavailable("order engine"))?;
    let outcome = orders.execute(&req).await?;
    let status = match outcome.rejection() {
        None => StatusCode::OK,
        Some(OrderRejection::Conflict) => StatusCode::CONFLICT,
        Some(_) => StatusCode::BAD_REQUEST,
    };
    Ok((status, Json(outcome)))
}

/// POST /api/v1/consistency/trigger
pub async fn trigger_reconcile(
    State(state): State<AppState>,
    body: Option<Json<TriggerRequest>>,
) -> ApiResult<Response> {
    let reconciler = state
        .reconciler
        .as_ref()
        .ok_or(ApiError::Unavailable("reconciler"))?;
    let req = body.map(|Json(r)| r).unwrap_or_default();

    match reconciler.run_cycle_from(req.since).await? {
        ReconcileOutcome::Busy => Ok(busy()),
        ReconcileOutcome::Completed(report) => Ok(Json(json!({
            "status": "completed",
            "report": report,
        }))
        .into_response()),
    }
}

fn busy() -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "status": "busy", "message": "a reconcile pass is already running" })),
    )
        .into_response()
}
