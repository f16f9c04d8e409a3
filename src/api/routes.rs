//! HTTP route handlers.
//!
//! Three read-only endpoints: liveness, current call load (consumed by the
//! external admission gate), and breaker states. Call control itself comes
//! in through the telephony boundary, not HTTP.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::breaker::BreakerSnapshot;
use crate::session::CallEngine;

/// Shared application state.
pub struct AppState {
    pub engine: Arc<CallEngine>,
}

/// Build the ops router.
pub fn router(engine: Arc<CallEngine>) -> Router {
    let state = Arc::new(AppState { engine });
    Router::new()
        .route("/api/health", get(health))
        .route("/api/load", get(load))
        .route("/api/breakers", get(breakers))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the ops surface until the process exits.
pub async fn serve(engine: Arc<CallEngine>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("ops surface listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct LoadResponse {
    active_calls: usize,
}

async fn load(State(state): State<Arc<AppState>>) -> Json<LoadResponse> {
    Json(LoadResponse {
        active_calls: state.engine.active_calls().await,
    })
}

async fn breakers(State(state): State<Arc<AppState>>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.engine.breaker_snapshots())
}
