//! Operations API: Axum server exposing queue, tier and reconcile controls.
//!
//! Every role serves it. CORS enabled for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use routes::AppState;

/// Bind the ops port and serve in a background task.
///
/// Binding happens before returning, so a taken port is reported to the
/// caller instead of failing silently inside the task.
pub async fn spawn_ops_server(state: AppState, port: u16) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind ops port {port}"))?;
    info!(port, "Ops API listening on http://localhost:{port}");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Ops API server error");
        }
    }))
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        // Queue
        .route("/api/v1/queue", post(routes::submit))
        .route("/api/v1/queue/stats", get(routes::queue_stats))
        .route("/api/v1/queue/:uuid", get(routes::get_entry))
        .route("/api/v1/queue/:uuid/retry", post(routes::retry_entry))
        .route("/api/v1/queue/:uuid/cancel", post(routes::cancel_entry))
        // Tiers and orders
        .route(
            "/api/v1/tier-status",
            get(routes::get_tier_status).post(routes::update_tier_status),
        )
        .route("/api/v1/execute-order", post(routes::execute_order))
        // Reconciler
        .route("/api/v1/consistency/trigger", post(routes::trigger_reconcile))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
