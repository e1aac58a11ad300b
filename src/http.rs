//! Operational status endpoint (feature `http`).
//!
//! GET /status - ledger snapshot as JSON; 404 when the coordinator is disabled

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::residency::ResidencyCoordinator;

/// GET /status
///
/// Reads the ledger only; never waits on an in-flight load or unload.
pub async fn status(State(coordinator): State<Arc<ResidencyCoordinator>>) -> impl IntoResponse {
    if !coordinator.is_enabled() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "residency coordinator is disabled" })),
        )
            .into_response();
    }
    (StatusCode::OK, Json(coordinator.status())).into_response()
}

/// Build the status router.
pub fn status_router(coordinator: Arc<ResidencyCoordinator>) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(coordinator)
}
