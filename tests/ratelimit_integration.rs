//! Rate limiting through the full pipeline.

mod common;

use axum::http::StatusCode;
use common::*;
use gantry::audit::AuditAction;
use gantry::usage::UsageOutcome;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/inference"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn third_call_hits_the_policy_bucket() {
    let upstream = upstream().await;
    // Policy bucket: burst 2, no refill.
    let doc = make_catalog(
        vec![make_limited_policy("m1", &[("b1", 1)], 2, 0.0)],
        vec![make_backend("b1", &upstream.uri())],
    );
    let gateway = TestGateway::start(doc).await;

    let first = gateway.infer(json!({"model": "m1"})).await;
    let second = gateway.infer(json!({"model": "m1"})).await;
    let third = gateway.infer(json!({"model": "m1"})).await;

    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(third.status, StatusCode::TOO_MANY_REQUESTS);

    // Retry-After is present and positive.
    let retry_after: u64 = third
        .headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);
    assert_eq!(third.json()["code"], "RATE_LIMIT_EXCEEDED");

    // All three calls produced usage records with the right outcomes.
    let records = gateway.wait_for_usage(3).await;
    let outcomes: Vec<UsageOutcome> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            UsageOutcome::Allowed,
            UsageOutcome::Allowed,
            UsageOutcome::RateLimited
        ]
    );

    // Denied request carries no backend.
    assert!(records[2].backend_id.is_none());
    assert_eq!(records[2].decision_reason.as_deref(), Some("rate_limited"));
}

#[tokio::test]
async fn denial_emits_an_audit_event() {
    let upstream = upstream().await;
    let doc = make_catalog(
        vec![make_limited_policy("m1", &[("b1", 1)], 1, 0.0)],
        vec![make_backend("b1", &upstream.uri())],
    );
    let gateway = TestGateway::start(doc).await;

    gateway.infer(json!({"model": "m1"})).await;
    gateway.infer(json!({"model": "m1"})).await;

    let events = gateway.audit.events();
    assert!(events
        .iter()
        .any(|e| e.action == AuditAction::RateLimitDenied && e.actor == TEST_ORG));
}

#[tokio::test]
async fn default_limits_apply_without_policy_override() {
    let upstream = upstream().await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("b1", 1)])],
        vec![make_backend("b1", &upstream.uri())],
    );

    let mut config = gantry::config::GatewayConfig::default();
    config.rate_limit.default_burst = 1;
    config.rate_limit.default_rate_per_second = 0.0;
    let gateway = TestGateway::start_with(doc, config).await;

    assert_eq!(
        gateway.infer(json!({"model": "m1"})).await.status,
        StatusCode::OK
    );
    assert_eq!(
        gateway.infer(json!({"model": "m1"})).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}
