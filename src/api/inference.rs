//! Inference forwarding handler: the request orchestrator.
//!
//! Stage order is fixed: the body is buffered once up front so signature
//! verification, model extraction, and the bounded retry all see the same
//! bytes; authentication, rate limiting, and budget gating run before any
//! routing work; usage emission is guaranteed by the draft guard on every
//! exit path, including caller disconnect.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::context::{RequestState, UsageDraft};
use super::error::ApiError;
use super::AppState;
use crate::audit::{AuditAction, AuditEvent};
use crate::auth::{signature, AuthError};
use crate::budget::BudgetDecision;
use crate::ratelimit::RateLimitOutcome;
use crate::routing::RoutingError;
use crate::upstream::{Correlation, ForwardedResponse, UpstreamError};
use crate::usage::UsageOutcome;

/// Header carrying the client-supplied idempotency token
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Gateway trace id returned on every response
pub const TRACE_ID_HEADER: &str = "x-gantry-trace-id";

/// Minimal view of the opaque payload: only the model alias is read.
#[derive(Debug, Deserialize)]
struct InferenceEnvelope {
    model: String,
}

fn bearer_from(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

fn map_auth_error(error: AuthError, trace_id: &str) -> ApiError {
    match error {
        AuthError::KeyRevoked => ApiError::auth_revoked(trace_id),
        AuthError::KeyExpired => ApiError::auth_expired(trace_id),
        // Authority outage denies new principals; cached ones were already
        // honored before the authority was consulted.
        AuthError::KeyMissing
        | AuthError::KeyInvalid
        | AuthError::SignatureInvalid
        | AuthError::ServiceUnavailable(_) => ApiError::auth_invalid(trace_id),
    }
}

/// POST /v1/inference - run the pipeline and relay the upstream response.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let token = match headers.get(REQUEST_ID_HEADER) {
        Some(value) => match value.to_str().ok().and_then(|s| Uuid::parse_str(s).ok()) {
            Some(token) => token,
            None => {
                return ApiError::invalid_request(
                    &Uuid::new_v4().to_string(),
                    "X-Request-ID must be a UUID",
                )
                .into_response()
            }
        },
        None => Uuid::new_v4(),
    };

    let draft = UsageDraft::new(
        state.usage.clone(),
        Arc::clone(&state.ledger),
        token,
        body.len() as u64,
    );

    let response = run(&state, &headers, body, draft).await;

    let status = response.status();
    metrics::counter!("gantry_requests_total",
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!("gantry_request_duration_seconds",
        "outcome" => if status.is_success() { "ok" } else { "error" }
    )
    .record(started.elapsed().as_secs_f64());

    response
}

async fn run(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: Bytes,
    mut draft: UsageDraft,
) -> Response {
    // Body buffering happened in the extractor; enforce the payload cap
    // before touching anything else.
    let cap = state.config.server.max_body_bytes;
    if body.len() > cap {
        return ApiError::payload_too_large(&draft.trace_id, cap).into_response();
    }

    let envelope: InferenceEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(_) => {
            return ApiError::invalid_request(
                &draft.trace_id,
                "Body must be JSON carrying a 'model' field",
            )
            .into_response()
        }
    };
    draft.set_model(&envelope.model);

    // --- Authentication ---
    let bearer = match bearer_from(headers) {
        Some(bearer) => bearer,
        None => return ApiError::auth_invalid(&draft.trace_id).into_response(),
    };

    let org_hint = headers
        .get("x-gantry-org-hint")
        .and_then(|v| v.to_str().ok());
    let principal = match state.validator.validate(bearer, org_hint).await {
        Ok(principal) => principal,
        Err(error) => {
            tracing::debug!(trace_id = %draft.trace_id, error = %error, "Authentication failed");
            return map_auth_error(error, &draft.trace_id).into_response();
        }
    };
    draft.set_principal(&principal.org_id, &principal.key_id);
    draft.advance(RequestState::Authenticated);

    // --- Request signature (when the principal carries a signing key) ---
    if let Some(signing_key) = &principal.signing_key {
        let provided = headers
            .get(signature::SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        let required = state.config.auth.enforce_signatures || provided.is_some();
        if required {
            let verified = provided
                .map(|p| signature::verify_signature(signing_key, &body, p).is_ok())
                .unwrap_or(false);
            if !verified {
                tracing::warn!(
                    trace_id = %draft.trace_id,
                    org_id = %principal.org_id,
                    "Request signature verification failed"
                );
                return ApiError::auth_invalid(&draft.trace_id).into_response();
            }
        }
    }

    // One consistent (policies, backends) pair for the whole request.
    let snapshot = state.catalog.snapshot();
    let health_view = state.health.view();

    // --- Rate limiting ---
    let limit = snapshot
        .policy(&principal.org_id, &envelope.model)
        .ok()
        .and_then(|p| p.limit.clone());

    if let RateLimitOutcome::Denied { retry_after } = state
        .limiter
        .check(&principal.org_id, &principal.key_id, limit.as_ref())
        .await
    {
        state.audit.record(
            AuditEvent::new(&principal.org_id, AuditAction::RateLimitDenied)
                .with("key_id", &principal.key_id)
                .with("model", &envelope.model),
        );
        draft.note_denial_reason("rate_limited");
        draft.finish(RequestState::Denied, UsageOutcome::RateLimited);
        return ApiError::rate_limited(&draft.trace_id, retry_after).into_response();
    }

    // --- Budget gating ---
    match state.budget.check(&principal.org_id).await {
        BudgetDecision::Allow | BudgetDecision::AllowDegraded => {}
        BudgetDecision::Deny { reset_at } => {
            state.audit.record(
                AuditEvent::new(&principal.org_id, AuditAction::BudgetDenied)
                    .with("model", &envelope.model),
            );
            draft.note_denial_reason("budget_exceeded");
            draft.finish(RequestState::Denied, UsageOutcome::BudgetExceeded);
            return ApiError::budget_exceeded(&draft.trace_id, reset_at).into_response();
        }
    }
    draft.advance(RequestState::Admitted);

    // --- Routing ---
    let decision = match state.router.select(
        &snapshot,
        &health_view,
        &principal.org_id,
        &envelope.model,
        &principal.key_id,
        &draft.token,
    ) {
        Ok(decision) => decision,
        Err(RoutingError::Forbidden { .. }) => {
            state.audit.record(
                AuditEvent::new(&principal.org_id, AuditAction::RoutingDenied)
                    .with("key_id", &principal.key_id)
                    .with("model", &envelope.model),
            );
            draft.note_denial_reason("denied");
            draft.finish(RequestState::Denied, UsageOutcome::BackendFailed);
            return ApiError::routing_forbidden(&draft.trace_id).into_response();
        }
        Err(RoutingError::PolicyMissing { .. } | RoutingError::NoBackendAvailable { .. }) => {
            draft.note_denial_reason("no_backend_available");
            draft.finish(RequestState::Failed, UsageOutcome::BackendFailed);
            return ApiError::no_backend_available(&draft.trace_id).into_response();
        }
    };
    draft.set_decision(&decision);
    draft.advance(RequestState::Routed);

    tracing::info!(
        trace_id = %draft.trace_id,
        org_id = %principal.org_id,
        model = %envelope.model,
        backend_id = %decision.backend_id,
        reason = %decision.reason,
        policy_version = decision.policy_version,
        "Routing decision made"
    );

    // --- Forwarding ---
    let backend = match snapshot.backend(&decision.backend_id) {
        Ok(backend) => backend.clone(),
        Err(_) => {
            // A live policy referenced a backend the snapshot validation
            // should have caught; fail loudly.
            draft.finish(RequestState::Failed, UsageOutcome::BackendFailed);
            return ApiError::internal(&draft.trace_id).into_response();
        }
    };

    let correlation = Correlation {
        request_id: draft.token,
        trace_id: draft.trace_id.clone(),
        org_id: principal.org_id.clone(),
        policy_version: decision.policy_version,
        reason: decision.reason,
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    draft.start_forwarding();
    let mut attempt = state
        .upstream
        .forward(&backend, &correlation, body.clone(), content_type.as_deref())
        .await;

    // Bounded retry: one alternate healthy backend, pre-response connect
    // failures only. Anything that may have streamed bytes is final.
    if matches!(&attempt, Err(e) if e.is_retryable()) {
        if let Some(alt_id) = state.router.retry_candidate(
            &snapshot,
            &health_view,
            &principal.org_id,
            &envelope.model,
            &decision.backend_id,
            &draft.token,
        ) {
            if let Ok(alt) = snapshot.backend(&alt_id) {
                tracing::warn!(
                    trace_id = %draft.trace_id,
                    failed_backend = %decision.backend_id,
                    retry_backend = %alt_id,
                    "Retrying forward on alternate backend"
                );
                metrics::counter!("gantry_forward_retries_total").increment(1);
                attempt = state
                    .upstream
                    .forward(alt, &correlation, body.clone(), content_type.as_deref())
                    .await;
                if attempt.is_ok() {
                    draft.set_backend(&alt_id);
                }
            }
        }
    }

    let forwarded = match attempt {
        Ok(forwarded) => forwarded,
        Err(UpstreamError::Timeout(_)) => {
            draft.finish(RequestState::Failed, UsageOutcome::BackendFailed);
            return ApiError::backend_timeout(&draft.trace_id).into_response();
        }
        Err(UpstreamError::Connect(_)) => {
            draft.finish(RequestState::Failed, UsageOutcome::BackendFailed);
            return ApiError::backend_failed(&draft.trace_id).into_response();
        }
    };

    draft.set_upstream_latency(forwarded.latency);
    let upstream_status = forwarded.response.status();

    if upstream_status.is_server_error() {
        draft.finish(RequestState::Failed, UsageOutcome::UpstreamError);
        return ApiError::upstream_error(&draft.trace_id).into_response();
    }

    // 2xx is success; upstream 4xx is surfaced as-is and classified
    // allowed, since the gateway did not deny.
    relay(state, draft, forwarded, upstream_status).await
}

fn response_headers(upstream: &reqwest::Response, draft: &UsageDraft) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream.headers() {
        // Hop-by-hop and length framing are recomputed by the server.
        if *name == header::CONNECTION
            || *name == header::TRANSFER_ENCODING
            || *name == header::CONTENT_LENGTH
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&draft.token.to_string()) {
        out.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&draft.trace_id) {
        out.insert(TRACE_ID_HEADER, value);
    }
    out
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Relay the upstream body: buffered when small and sized, streamed with
/// byte counting otherwise.
async fn relay(
    state: &Arc<AppState>,
    mut draft: UsageDraft,
    forwarded: ForwardedResponse,
    status: StatusCode,
) -> Response {
    let headers_out = response_headers(&forwarded.response, &draft);
    let cap = state.config.upstream.max_response_bytes;

    if let Some(len) = forwarded.response.content_length() {
        if len as usize <= cap {
            return match forwarded.response.bytes().await {
                Ok(bytes) => {
                    draft.add_output_bytes(bytes.len() as u64);
                    draft.finish(RequestState::Completed, UsageOutcome::Allowed);
                    build_response(status, headers_out, Body::from(bytes))
                }
                Err(e) => {
                    tracing::warn!(trace_id = %draft.trace_id, error = %e, "Upstream body read failed");
                    draft.finish(RequestState::Failed, UsageOutcome::BackendFailed);
                    ApiError::backend_failed(&draft.trace_id).into_response()
                }
            };
        }
    }

    // Unknown or large body: stream through. The draft rides inside the
    // stream so an aborted relay still emits its record with the bytes
    // delivered so far.
    draft.set_streaming(UsageOutcome::Allowed);
    let stream = async_stream::stream! {
        let mut draft = draft;
        let mut byte_stream = forwarded.response.bytes_stream();
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    draft.add_output_bytes(bytes.len() as u64);
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream stream read error");
                    break;
                }
            }
        }
        draft.finish(RequestState::Completed, UsageOutcome::Allowed);
    };

    build_response(status, headers_out, Body::from_stream(stream))
}
