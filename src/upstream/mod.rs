//! Upstream forwarding client.
//!
//! Forwards the buffered inference payload to the selected backend with the
//! per-backend timeout, gateway correlation headers, and inbound credential
//! headers stripped. Dropping the returned future propagates cancellation
//! into the in-flight call.

use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::BackendEndpoint;
use crate::config::UpstreamConfig;
use crate::routing::SelectionReason;

/// Correlation headers the gateway stamps onto forwarded requests
pub mod headers {
    pub const REQUEST_ID: &str = "x-request-id";
    pub const TRACE_ID: &str = "x-gantry-trace-id";
    pub const ORG: &str = "x-gantry-org";
    pub const POLICY_VERSION: &str = "x-gantry-policy-version";
    pub const ROUTE_REASON: &str = "x-gantry-route-reason";
}

/// Errors raised before an upstream response arrives
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Pre-response socket error; eligible for the bounded retry
    #[error("Backend connection failed: {0}")]
    Connect(String),

    /// The per-backend timeout elapsed
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Only pre-response connection failures are retried, exactly once,
    /// against a different healthy backend.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Connect(_))
    }
}

/// Correlation identity carried onto the forwarded request
#[derive(Debug, Clone)]
pub struct Correlation {
    pub request_id: Uuid,
    pub trace_id: String,
    pub org_id: String,
    pub policy_version: i64,
    pub reason: SelectionReason,
}

/// A successful upstream exchange, pre-body
pub struct ForwardedResponse {
    pub response: reqwest::Response,
    pub latency: Duration,
}

/// HTTP client for backend forwarding.
pub struct UpstreamClient {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        // Per-call timeouts come from the backend; the client itself only
        // pools connections.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .expect("Failed to build upstream HTTP client");

        Self {
            client,
            default_timeout: Duration::from_secs(config.default_timeout_seconds),
        }
    }

    /// Forward the buffered payload to one backend.
    ///
    /// The returned response has not had its body consumed; the caller
    /// relays or buffers it. Cancellation is propagated by dropping the
    /// future this method returns.
    pub async fn forward(
        &self,
        backend: &BackendEndpoint,
        correlation: &Correlation,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<ForwardedResponse, UpstreamError> {
        let url = format!("{}/v1/inference", backend.url.trim_end_matches('/'));
        let timeout = backend.timeout(self.default_timeout);
        let start = Instant::now();

        let mut request = self
            .client
            .post(&url)
            .timeout(timeout)
            .header(headers::REQUEST_ID, correlation.request_id.to_string())
            .header(headers::TRACE_ID, &correlation.trace_id)
            .header(headers::ORG, &correlation.org_id)
            .header(
                headers::POLICY_VERSION,
                correlation.policy_version.to_string(),
            )
            .header(headers::ROUTE_REASON, correlation.reason.to_string())
            .body(body);

        if let Some(ct) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, ct);
        }

        // Inbound `Authorization` and signature headers are never built
        // into the forwarded request in the first place.
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(timeout)
            } else {
                UpstreamError::Connect(e.to_string())
            }
        })?;

        let latency = start.elapsed();
        metrics::histogram!("gantry_upstream_latency_seconds",
            "backend" => backend.id.clone()
        )
        .record(latency.as_secs_f64());

        Ok(ForwardedResponse { response, latency })
    }
}
