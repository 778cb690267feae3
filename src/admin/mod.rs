//! Operator-facing admin surface.
//!
//! Binds its own listener so operator traffic never shares the ingress
//! handler tree. Reads expose catalog, health, limiter, and spool state;
//! mutations (pins, forced reprobes) require the shared admin token and
//! always produce an audit event.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::api::AppState;
use crate::audit::{AuditAction, AuditEvent};
use crate::catalog::RoutingPolicy;
use crate::health::HealthView;
use crate::routing::Pin;

/// Create the admin router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/admin/policies", get(list_policies))
        .route("/v1/admin/backends", get(list_backends))
        .route("/v1/admin/health", get(health_snapshot))
        .route("/v1/admin/status", get(gateway_status))
        .route(
            "/v1/admin/pins",
            get(list_pins).post(create_pin).delete(clear_pin),
        )
        .route("/v1/admin/reprobe", post(reprobe))
        .with_state(state)
}

/// Constant-time check of the shared admin token.
///
/// An empty configured token disables mutations outright; the TLS client
/// auth in front of this listener is the deployment's concern.
fn authorize_mutation(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let configured = state.config.admin.token.as_bytes();
    if configured.is_empty() {
        return Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "admin mutations are disabled"})),
        )
            .into_response());
    }

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .unwrap_or("");

    if bool::from(presented.as_bytes().ct_eq(configured)) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid admin token"})),
        )
            .into_response())
    }
}

#[derive(Debug, Serialize)]
struct PoliciesResponse {
    version: i64,
    stale: bool,
    policies: Vec<RoutingPolicy>,
}

async fn list_policies(State(state): State<Arc<AppState>>) -> Json<PoliciesResponse> {
    let snapshot = state.catalog.snapshot();
    let mut policies: Vec<RoutingPolicy> = snapshot.policies().cloned().collect();
    policies.sort_by(|a, b| (&a.org, &a.model).cmp(&(&b.org, &b.model)));

    Json(PoliciesResponse {
        version: snapshot.version(),
        stale: state.catalog.is_stale(),
        policies,
    })
}

#[derive(Debug, Serialize)]
struct BackendRow {
    id: String,
    url: String,
    health: crate::health::HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier: Option<String>,
}

async fn list_backends(State(state): State<Arc<AppState>>) -> Json<Vec<BackendRow>> {
    let snapshot = state.catalog.snapshot();
    let view = state.health.view();

    let rows = snapshot
        .backends()
        .map(|b| BackendRow {
            id: b.id.clone(),
            url: b.url.clone(),
            health: view.state(&b.id),
            region: b.labels.region.clone(),
            tier: b.labels.tier.clone(),
        })
        .collect();
    Json(rows)
}

async fn health_snapshot(State(state): State<Arc<AppState>>) -> Json<HealthView> {
    Json(state.health.view())
}

#[derive(Debug, Serialize)]
struct GatewayStatus {
    catalog_version: i64,
    catalog_stale: bool,
    limiter_degraded: bool,
    usage_spool_depth: u64,
    usage_enqueue_drops: u64,
}

async fn gateway_status(State(state): State<Arc<AppState>>) -> Json<GatewayStatus> {
    Json(GatewayStatus {
        catalog_version: state.catalog.version(),
        catalog_stale: state.catalog.is_stale(),
        limiter_degraded: state.limiter.is_degraded(),
        usage_spool_depth: state.usage.depth(),
        usage_enqueue_drops: state.usage.enqueue_drops(),
    })
}

async fn list_pins(State(state): State<Arc<AppState>>) -> Json<Vec<Pin>> {
    Json(state.router.pins().list())
}

#[derive(Debug, Deserialize)]
struct CreatePinRequest {
    org_id: String,
    model: String,
    backend_id: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

async fn create_pin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreatePinRequest>,
) -> Response {
    if let Err(denied) = authorize_mutation(&state, &headers) {
        return denied;
    }

    // Pinning a backend the catalog does not know is an operator mistake.
    let snapshot = state.catalog.snapshot();
    if snapshot.backend(&request.backend_id).is_err() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": format!("unknown backend '{}'", request.backend_id)
            })),
        )
            .into_response();
    }

    let ttl = request
        .ttl_seconds
        .unwrap_or(state.config.admin.default_pin_ttl_seconds);
    let pin = Pin {
        org_id: request.org_id.clone(),
        model: request.model.clone(),
        backend_id: request.backend_id.clone(),
        expires_at: Utc::now() + Duration::seconds(ttl as i64),
    };
    state.router.pins().set(pin.clone());

    state.audit.record(
        AuditEvent::new("admin", AuditAction::BackendPinned)
            .with("org_id", &request.org_id)
            .with("model", &request.model)
            .with("backend_id", &request.backend_id)
            .with("ttl_seconds", ttl.to_string()),
    );
    tracing::info!(
        org_id = %request.org_id,
        model = %request.model,
        backend_id = %request.backend_id,
        ttl_seconds = ttl,
        "Backend pinned"
    );

    (StatusCode::CREATED, Json(pin)).into_response()
}

#[derive(Debug, Deserialize)]
struct ClearPinRequest {
    org_id: String,
    model: String,
}

async fn clear_pin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ClearPinRequest>,
) -> Response {
    if let Err(denied) = authorize_mutation(&state, &headers) {
        return denied;
    }

    match state.router.pins().clear(&request.org_id, &request.model) {
        Some(pin) => {
            state.audit.record(
                AuditEvent::new("admin", AuditAction::PinCleared)
                    .with("org_id", &request.org_id)
                    .with("model", &request.model)
                    .with("backend_id", &pin.backend_id),
            );
            (StatusCode::OK, Json(pin)).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no pin for this org and model"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ReprobeRequest {
    backend_id: String,
}

async fn reprobe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ReprobeRequest>,
) -> Response {
    if let Err(denied) = authorize_mutation(&state, &headers) {
        return denied;
    }

    state.audit.record(
        AuditEvent::new("admin", AuditAction::ReprobeForced)
            .with("backend_id", &request.backend_id),
    );

    match state.health.force_probe(&request.backend_id).await {
        Some(health) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "backend_id": request.backend_id,
                "state": health,
            })),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("unknown backend '{}'", request.backend_id)
            })),
        )
            .into_response(),
    }
}
