//! Outward error taxonomy.
//!
//! Every error leaves the gateway with a stable code and the request's
//! trace id; raw dependency error text never reaches the caller.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;

/// Stable outward error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthInvalid,
    AuthRevoked,
    AuthExpired,
    RoutingForbidden,
    PayloadTooLarge,
    RateLimitExceeded,
    BudgetExceeded,
    NoBackendAvailable,
    BackendFailed,
    UpstreamError,
    InvalidRequest,
    InternalError,
}

/// JSON error envelope
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub code: ErrorCode,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_context: Option<serde_json::Value>,
}

/// A structured gateway error ready to become a response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: &str, trace_id: &str) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                error: message.to_string(),
                code,
                trace_id: trace_id.to_string(),
                retry_after_seconds: None,
                limit_context: None,
            },
        }
    }

    pub fn auth_invalid(trace_id: &str) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AuthInvalid,
            "Missing or invalid credential",
            trace_id,
        )
    }

    pub fn auth_revoked(trace_id: &str) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AuthRevoked,
            "Credential has been revoked",
            trace_id,
        )
    }

    pub fn auth_expired(trace_id: &str) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AuthExpired,
            "Credential has expired",
            trace_id,
        )
    }

    pub fn routing_forbidden(trace_id: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            ErrorCode::RoutingForbidden,
            "Key is not permitted to use this model",
            trace_id,
        )
    }

    pub fn payload_too_large(trace_id: &str, cap: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::PayloadTooLarge,
            &format!("Request payload exceeds {cap} bytes"),
            trace_id,
        )
    }

    pub fn rate_limited(trace_id: &str, retry_after: Duration) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RateLimitExceeded,
            "Rate limit exceeded",
            trace_id,
        );
        // Round up so callers never retry early
        err.body.retry_after_seconds = Some(retry_after.as_secs_f64().ceil().max(1.0) as u64);
        err.body.limit_context = Some(serde_json::json!({ "limit": "requests" }));
        err
    }

    pub fn budget_exceeded(trace_id: &str, reset_at: Option<chrono::DateTime<chrono::Utc>>) -> Self {
        let mut err = Self::new(
            StatusCode::PAYMENT_REQUIRED,
            ErrorCode::BudgetExceeded,
            "Organization budget exceeded",
            trace_id,
        );
        if let Some(reset_at) = reset_at {
            err.body.limit_context =
                Some(serde_json::json!({ "reset_at": reset_at.to_rfc3339() }));
        }
        err
    }

    pub fn no_backend_available(trace_id: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::NoBackendAvailable,
            "No backend available for this model",
            trace_id,
        )
    }

    pub fn backend_failed(trace_id: &str) -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::BackendFailed,
            "Backend connection failed",
            trace_id,
        )
    }

    pub fn backend_timeout(trace_id: &str) -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::BackendFailed,
            "Backend timed out",
            trace_id,
        )
    }

    pub fn upstream_error(trace_id: &str) -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamError,
            "Backend returned an error",
            trace_id,
        )
    }

    pub fn invalid_request(trace_id: &str, message: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            message,
            trace_id,
        )
    }

    pub fn internal(trace_id: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            "Internal gateway error",
            trace_id,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = self.body.retry_after_seconds;
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"RATE_LIMIT_EXCEEDED\"");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = ApiError::rate_limited("t-1", Duration::from_millis(2500));
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.body.retry_after_seconds, Some(3));
        assert!(err.body.limit_context.is_some());
    }

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(ApiError::auth_invalid("t").status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::budget_exceeded("t", None).status,
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::payload_too_large("t", 1).status,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::no_backend_available("t").status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::backend_timeout("t").status,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ApiError::upstream_error("t").status, StatusCode::BAD_GATEWAY);
    }
}
