//! Liveness and readiness handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::AppState;
use crate::health::HealthState;

/// Liveness response
#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
}

/// GET /v1/status/healthz - process liveness.
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// Readiness checks, each reported individually
#[derive(Debug, Serialize)]
pub struct ReadyzResponse {
    pub status: &'static str,
    pub catalog_fresh: bool,
    pub usage_below_high_water: bool,
    pub backend_available: bool,
}

/// GET /v1/status/readyz - 200 iff the catalog is fresh, the usage
/// pipeline is below its high-water mark, and at least one routable
/// backend is healthy.
pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let catalog_fresh = state.catalog.is_fresh();
    let usage_below_high_water = state.usage.below_high_water();

    let snapshot = state.catalog.snapshot();
    let view = state.health.view();
    let backend_available = snapshot
        .backends()
        .any(|b| view.state(&b.id) == HealthState::Healthy);

    let ready = catalog_fresh && usage_below_high_water && backend_available;
    let response = ReadyzResponse {
        status: if ready { "ready" } else { "degraded" },
        catalog_fresh,
        usage_below_high_water,
        backend_available,
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
