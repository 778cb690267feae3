//! Health monitor transitions driven by real probe traffic.

mod common;

use axum::http::StatusCode;
use common::*;
use gantry::health::HealthState;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn backend_server(inference_body: &str, probe_status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/inference"))
        .respond_with(ResponseTemplate::new(200).set_body_string(inference_body.to_string()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(probe_status))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn failing_probes_degrade_then_exclude() {
    let failing = backend_server("never", 500).await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("b1", 1)])],
        vec![make_backend("b1", &failing.uri())],
    );
    let gateway = TestGateway::start(doc).await;
    let monitor = &gateway.state.health;

    monitor.probe_all().await;
    assert_eq!(monitor.state("b1"), HealthState::Healthy); // one failure is tolerated

    monitor.probe_all().await;
    assert_eq!(monitor.state("b1"), HealthState::Degraded);

    for _ in 0..3 {
        monitor.probe_all().await;
    }
    assert_eq!(monitor.state("b1"), HealthState::Unavailable);
}

#[tokio::test]
async fn unavailable_backend_yields_503_and_degraded_serves_failover() {
    let failing = backend_server("from-a", 500).await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("a", 1)])],
        vec![make_backend("a", &failing.uri())],
    );
    let gateway = TestGateway::start(doc).await;
    let monitor = &gateway.state.health;

    // Drive to unavailable: every request now fails with 503.
    for _ in 0..5 {
        monitor.probe_all().await;
    }
    assert_eq!(monitor.state("a"), HealthState::Unavailable);

    let response = gateway.infer(json!({"model": "m1"})).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json()["code"], "NO_BACKEND_AVAILABLE");
}

#[tokio::test]
async fn degraded_backend_is_selected_with_failover_reason() {
    let degraded = backend_server("from-a", 500).await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("a", 1)])],
        vec![make_backend("a", &degraded.uri())],
    );
    let gateway = TestGateway::start(doc).await;
    let monitor = &gateway.state.health;

    // Two failures: degraded, still eligible for fallback use.
    monitor.probe_all().await;
    monitor.probe_all().await;
    assert_eq!(monitor.state("a"), HealthState::Degraded);

    let response = gateway.infer(json!({"model": "m1"})).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref(), b"from-a");

    let records = gateway.wait_for_usage(1).await;
    assert_eq!(records[0].decision_reason.as_deref(), Some("failover"));
}

#[tokio::test]
async fn unavailable_primary_fails_over_to_healthy_sibling() {
    let dead = backend_server("from-a", 500).await;
    let live = backend_server("from-b", 200).await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("a", 3), ("b", 1)])],
        vec![
            make_backend("a", &dead.uri()),
            make_backend("b", &live.uri()),
        ],
    );
    let gateway = TestGateway::start(doc).await;
    let monitor = &gateway.state.health;

    for _ in 0..5 {
        monitor.probe_all().await;
    }
    assert_eq!(monitor.state("a"), HealthState::Unavailable);
    assert_eq!(monitor.state("b"), HealthState::Healthy);

    for _ in 0..5 {
        let response = gateway.infer(json!({"model": "m1"})).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.as_ref(), b"from-b");
    }

    let records = gateway.wait_for_usage(1).await;
    assert!(records
        .iter()
        .all(|r| r.decision_reason.as_deref() == Some("failover")));
}

#[tokio::test]
async fn recovery_needs_sustained_successes() {
    let server = MockServer::start().await;
    // Five failing probes, then permanent success.
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(5)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let doc = make_catalog(
        vec![make_policy("m1", &[("a", 1)])],
        vec![make_backend("a", &server.uri())],
    );
    let gateway = TestGateway::start(doc).await;
    let monitor = &gateway.state.health;

    for _ in 0..5 {
        monitor.probe_all().await;
    }
    assert_eq!(monitor.state("a"), HealthState::Unavailable);

    // One success is not enough to rejoin.
    monitor.probe_all().await;
    assert_eq!(monitor.state("a"), HealthState::Unavailable);

    // The second consecutive success recovers.
    monitor.probe_all().await;
    assert_eq!(monitor.state("a"), HealthState::Healthy);
}

#[tokio::test]
async fn probe_state_is_dropped_for_removed_backends() {
    let failing = backend_server("x", 500).await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("a", 1)])],
        vec![make_backend("a", &failing.uri())],
    );
    let gateway = TestGateway::start(doc).await;
    let monitor = &gateway.state.health;

    for _ in 0..5 {
        monitor.probe_all().await;
    }
    assert_eq!(monitor.state("a"), HealthState::Unavailable);

    // New catalog without the backend: its probe state disappears, and a
    // re-added backend starts fresh.
    let healthy = backend_server("y", 200).await;
    let mut doc = make_catalog(
        vec![make_policy("m1", &[("b", 1)])],
        vec![make_backend("b", &healthy.uri())],
    );
    doc.version = 2;
    gateway.catalog.install(doc, false).unwrap();

    monitor.probe_all().await;
    assert!(monitor.view().backends.get("a").is_none());
    assert_eq!(monitor.state("b"), HealthState::Healthy);
}
