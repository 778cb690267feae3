//! Usage accounting through the full pipeline.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/inference"))
        .respond_with(ResponseTemplate::new(200).set_body_string("answer"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn each_request_yields_exactly_one_record() {
    let upstream = upstream().await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("b1", 1)])],
        vec![make_backend("b1", &upstream.uri())],
    );
    let gateway = TestGateway::start(doc).await;

    for _ in 0..5 {
        let response = gateway.infer(json!({"model": "m1"})).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    let records = gateway.wait_for_usage(5).await;
    assert_eq!(records.len(), 5);

    // Record ids are unique; tokens are distinct per request.
    let record_ids: BTreeSet<Uuid> = records.iter().map(|r| r.record_id).collect();
    assert_eq!(record_ids.len(), 5);
    let tokens: BTreeSet<Uuid> = records.iter().map(|r| r.idempotency_token).collect();
    assert_eq!(tokens.len(), 5);
}

#[tokio::test]
async fn records_carry_size_and_latency_estimates() {
    let upstream = upstream().await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("b1", 1)])],
        vec![make_backend("b1", &upstream.uri())],
    );
    let gateway = TestGateway::start(doc).await;

    let body = json!({"model": "m1", "prompt": "tell me things"});
    let body_len = body.to_string().len() as u64;
    gateway.infer(body).await;

    let records = gateway.wait_for_usage(1).await;
    assert_eq!(records[0].input_bytes, body_len);
    assert_eq!(records[0].output_bytes, "answer".len() as u64);
    assert_eq!(records[0].model, "m1");
    assert_eq!(records[0].policy_version, Some(1));
    assert!(!records[0].trace_id.is_empty());
    assert!(!records[0].span_id.is_empty());
}

#[tokio::test]
async fn publish_outage_buffers_and_drains_without_request_failures() {
    let upstream = upstream().await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("b1", 1)])],
        vec![make_backend("b1", &upstream.uri())],
    );
    let gateway = TestGateway::start(doc).await;

    gateway.publisher.set_failing(true);

    let mut expected = BTreeSet::new();
    for _ in 0..4 {
        let token = Uuid::new_v4();
        let response = gateway.infer_token(token, json!({"model": "m1"})).await;
        // The bus outage never fails request serving.
        assert_eq!(response.status, StatusCode::OK);
        expected.insert(token);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.publisher.published().is_empty());
    assert!(gateway.state.usage.depth() > 0);

    gateway.publisher.set_failing(false);
    // Keep traffic flowing so the worker retries past its backoff.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let published: BTreeSet<Uuid> = gateway
            .publisher
            .published()
            .iter()
            .filter(|r| expected.contains(&r.idempotency_token))
            .map(|r| r.idempotency_token)
            .collect();
        if published == expected {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "buffered records never drained"
        );
        gateway.infer(json!({"model": "m1"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Each buffered record was published exactly once.
    let all = gateway.publisher.published();
    for token in &expected {
        let count = all
            .iter()
            .filter(|r| r.idempotency_token == *token)
            .count();
        assert_eq!(count, 1, "token {token} published {count} times");
    }
}

#[tokio::test]
async fn replayed_token_emits_at_most_one_record() {
    let upstream = upstream().await;
    let doc = make_catalog(
        vec![make_policy("m1", &[("b1", 1)])],
        vec![make_backend("b1", &upstream.uri())],
    );
    let gateway = TestGateway::start(doc).await;

    let token = Uuid::new_v4();
    for _ in 0..3 {
        let response = gateway.infer_token(token, json!({"model": "m1"})).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    // Give the worker time to drain everything that was emitted.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let count = gateway
        .publisher
        .published()
        .iter()
        .filter(|r| r.idempotency_token == token)
        .count();
    assert_eq!(count, 1);
}
