//! Shared test utilities for Gantry integration tests.
//!
//! Provides a fully wired in-process gateway with stubbed collaborators:
//! a scripted credential validator, an in-memory rate-limit store, a
//! memory usage publisher, and a memory audit sink. Backends and
//! authorities are wiremock servers started by each test.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use gantry::api::{create_router, AppState};
use gantry::audit::{MemoryAuditSink, SharedAuditSink};
use gantry::auth::{AuthError, CredentialValidator, KeyStatus, Principal};
use gantry::budget::BudgetGate;
use gantry::catalog::{
    BackendEndpoint, BackendLabels, CatalogCache, CatalogDocument, LimitOverride, RoutingPolicy,
    WILDCARD_ORG,
};
use gantry::config::GatewayConfig;
use gantry::health::HealthMonitor;
use gantry::ratelimit::{MemoryRateLimitStore, RateLimiter};
use gantry::routing::{PinStore, RoutingEngine};
use gantry::usage::{MemoryPublisher, UsagePipeline, UsageRecord};

pub const VALID_BEARER: &str = "sk-test-valid";
pub const TEST_ORG: &str = "acme";
pub const TEST_KEY: &str = "key-1";

/// Scripted credential validator keyed by bearer value.
pub struct StubValidator {
    results: DashMap<String, Result<Principal, AuthError>>,
}

impl StubValidator {
    pub fn new() -> Self {
        let results = DashMap::new();
        results.insert(VALID_BEARER.to_string(), Ok(make_principal(TEST_ORG, TEST_KEY)));
        Self { results }
    }

    pub fn script(&self, bearer: &str, result: Result<Principal, AuthError>) {
        self.results.insert(bearer.to_string(), result);
    }
}

#[async_trait]
impl CredentialValidator for StubValidator {
    async fn validate(
        &self,
        bearer: &str,
        _org_hint: Option<&str>,
    ) -> Result<Principal, AuthError> {
        self.results
            .get(bearer)
            .map(|r| r.clone())
            .unwrap_or(Err(AuthError::KeyMissing))
    }
}

pub fn make_principal(org_id: &str, key_id: &str) -> Principal {
    Principal {
        org_id: org_id.to_string(),
        key_id: key_id.to_string(),
        scopes: BTreeSet::new(),
        status: KeyStatus::Active,
        expires_at: None,
        signing_key: None,
    }
}

pub fn make_backend(id: &str, url: &str) -> BackendEndpoint {
    BackendEndpoint {
        id: id.to_string(),
        url: url.to_string(),
        timeout_seconds: Some(5),
        probe_path: None,
        labels: BackendLabels::default(),
    }
}

pub fn make_policy(model: &str, weights: &[(&str, u32)]) -> RoutingPolicy {
    RoutingPolicy {
        org: WILDCARD_ORG.to_string(),
        model: model.to_string(),
        weights: weights
            .iter()
            .map(|(id, w)| (id.to_string(), *w))
            .collect::<BTreeMap<_, _>>(),
        failover_threshold: 3,
        allow_keys: None,
        deny_keys: BTreeSet::new(),
        limit: None,
        version: 1,
    }
}

pub fn make_limited_policy(
    model: &str,
    weights: &[(&str, u32)],
    burst: u32,
    rate: f64,
) -> RoutingPolicy {
    let mut policy = make_policy(model, weights);
    policy.limit = Some(LimitOverride {
        burst,
        rate_per_second: rate,
        cost: 1,
    });
    policy
}

pub fn make_catalog(policies: Vec<RoutingPolicy>, backends: Vec<BackendEndpoint>) -> CatalogDocument {
    CatalogDocument {
        version: 1,
        policies,
        backends,
        revoked_keys: vec![],
    }
}

/// A wired gateway with inspectable collaborators.
pub struct TestGateway {
    pub app: axum::Router,
    pub state: Arc<AppState>,
    pub catalog: Arc<CatalogCache>,
    pub validator: Arc<StubValidator>,
    pub audit: Arc<MemoryAuditSink>,
    pub publisher: Arc<MemoryPublisher>,
    pub cancel: CancellationToken,
    _spool_dir: tempfile::TempDir,
}

impl TestGateway {
    pub async fn start(doc: CatalogDocument) -> Self {
        Self::start_with(doc, GatewayConfig::default()).await
    }

    pub async fn start_with(doc: CatalogDocument, mut config: GatewayConfig) -> Self {
        let spool_dir = tempfile::tempdir().unwrap();
        config.usage.spool_dir = spool_dir.path().to_path_buf();
        config.usage.batch_linger_ms = 10;
        let config = Arc::new(config);

        let catalog = Arc::new(CatalogCache::new(Duration::from_secs(
            config.control_plane.max_staleness_seconds,
        )));
        catalog.install(doc, false).unwrap();

        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&catalog),
            config.health.clone(),
        ));
        let validator = Arc::new(StubValidator::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            config.rate_limit.clone(),
            audit.clone() as SharedAuditSink,
        ));
        let budget = Arc::new(BudgetGate::new(config.budget.clone()));
        let router = Arc::new(RoutingEngine::new(Arc::new(PinStore::new())));

        let publisher = Arc::new(MemoryPublisher::new());
        let (usage, worker) = UsagePipeline::new(&config.usage, publisher.clone()).unwrap();

        let cancel = CancellationToken::new();
        worker.start(cancel.clone());

        let state = Arc::new(AppState::new(
            Arc::clone(&config),
            Arc::clone(&catalog),
            health,
            validator.clone() as Arc<dyn CredentialValidator>,
            limiter,
            budget,
            router,
            usage,
            audit.clone() as SharedAuditSink,
        ));
        let app = create_router(Arc::clone(&state));

        Self {
            app,
            state,
            catalog,
            validator,
            audit,
            publisher,
            cancel,
            _spool_dir: spool_dir,
        }
    }

    /// POST /v1/inference with the standard test credential.
    pub async fn infer(&self, body: serde_json::Value) -> TestResponse {
        self.infer_with(Some(VALID_BEARER), None, body.to_string().into_bytes())
            .await
    }

    /// POST /v1/inference with an explicit idempotency token.
    pub async fn infer_token(&self, token: Uuid, body: serde_json::Value) -> TestResponse {
        self.infer_with(
            Some(VALID_BEARER),
            Some(token),
            body.to_string().into_bytes(),
        )
        .await
    }

    pub async fn infer_with(
        &self,
        bearer: Option<&str>,
        token: Option<Uuid>,
        body: Vec<u8>,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/inference")
            .header("content-type", "application/json");
        if let Some(bearer) = bearer {
            builder = builder.header("authorization", format!("Bearer {bearer}"));
        }
        if let Some(token) = token {
            builder = builder.header("x-request-id", token.to_string());
        }

        let request = builder.body(Body::from(body)).unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Wait until at least `count` usage records have been published.
    pub async fn wait_for_usage(&self, count: usize) -> Vec<UsageRecord> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let published = self.publisher.published();
            if published.len() >= count {
                return published;
            }
            if std::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {count} usage records (have {})",
                    published.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Buffered response for assertions
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: bytes::Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// An expired-pin helper used by admin/routing tests.
pub fn expired_at() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(1)
}
