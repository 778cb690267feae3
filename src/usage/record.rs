//! Billable usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal classification of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    /// The gateway did not deny; includes upstream 4xx surfaced as-is
    Allowed,
    RateLimited,
    BudgetExceeded,
    /// Connect failure or timeout before/while reaching the backend
    BackendFailed,
    /// Upstream returned 5xx
    UpstreamError,
}

/// Post-request event summarizing the billing-relevant outcome.
///
/// Immutable once built. `record_id` is the downstream dedup key under the
/// bus's at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub record_id: Uuid,
    pub idempotency_token: Uuid,
    pub org_id: String,
    pub key_id: String,
    pub model: String,
    /// Empty for requests denied before routing
    pub backend_id: Option<String>,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub upstream_latency_ms: u64,
    pub outcome: UsageOutcome,
    pub decision_reason: Option<String>,
    pub policy_version: Option<i64>,
    pub timestamp_utc: DateTime<Utc>,
    pub trace_id: String,
    pub span_id: String,
}
