//! # Ingress API
//!
//! Caller-facing HTTP surface and the request orchestrator.
//!
//! Two handler trees keep concerns apart: the status tree (health,
//! readiness, metrics) runs no authentication, while `/v1/inference` runs
//! the full pipeline inside its handler in a fixed order: body buffering,
//! authentication, rate limiting, budget gating, routing, forwarding, and
//! usage emission.
//!
//! ## Endpoints
//!
//! - `POST /v1/inference` - Forward an inference payload to a backend
//! - `GET /v1/status/healthz` - Liveness
//! - `GET /v1/status/readyz` - Readiness
//! - `GET /metrics` - Prometheus exposition

mod context;
mod error;
mod inference;
mod status;

pub use context::{RequestState, TokenLedger, UsageDraft};
pub use error::{ApiError, ApiErrorBody, ErrorCode};

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::CredentialValidator;
use crate::budget::BudgetGate;
use crate::catalog::CatalogCache;
use crate::config::GatewayConfig;
use crate::health::HealthMonitor;
use crate::ratelimit::RateLimiter;
use crate::routing::RoutingEngine;
use crate::upstream::UpstreamClient;
use crate::usage::UsagePipeline;

/// Emitted-token memoization window
const LEDGER_TTL: Duration = Duration::from_secs(60);

/// Headroom above the payload cap so the typed 413 check runs before the
/// transport layer's limit
const BODY_LIMIT_HEADROOM: usize = 16 * 1024;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub catalog: Arc<CatalogCache>,
    pub health: Arc<HealthMonitor>,
    pub validator: Arc<dyn CredentialValidator>,
    pub limiter: Arc<RateLimiter>,
    pub budget: Arc<BudgetGate>,
    pub router: Arc<RoutingEngine>,
    pub upstream: Arc<UpstreamClient>,
    pub usage: UsagePipeline,
    pub audit: crate::audit::SharedAuditSink,
    pub ledger: Arc<TokenLedger>,
    pub prometheus: PrometheusHandle,
    /// Server startup time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Assemble application state from the wired collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<GatewayConfig>,
        catalog: Arc<CatalogCache>,
        health: Arc<HealthMonitor>,
        validator: Arc<dyn CredentialValidator>,
        limiter: Arc<RateLimiter>,
        budget: Arc<BudgetGate>,
        router: Arc<RoutingEngine>,
        usage: UsagePipeline,
        audit: crate::audit::SharedAuditSink,
    ) -> Self {
        let upstream = Arc::new(UpstreamClient::new(&config.upstream));
        let prometheus = crate::metrics::recorder_handle();

        Self {
            config,
            catalog,
            health,
            validator,
            limiter,
            budget,
            router,
            upstream,
            usage,
            audit,
            ledger: Arc::new(TokenLedger::new(LEDGER_TTL)),
            prometheus,
            start_time: Instant::now(),
        }
    }
}

/// Create the caller-facing router: status tree plus the inference
/// pipeline. Authentication never runs for the status tree.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_bytes + BODY_LIMIT_HEADROOM;

    let status_routes = Router::new()
        .route("/v1/status/healthz", get(status::healthz))
        .route("/v1/status/readyz", get(status::readyz))
        .route("/metrics", get(crate::metrics::handler::metrics_handler));

    let ingress_routes = Router::new()
        .route("/v1/inference", post(inference::handle))
        .layer(RequestBodyLimitLayer::new(body_limit));

    status_routes.merge(ingress_routes).with_state(state)
}
