//! Per-request context: lifecycle state, usage draft, token ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::routing::RoutingDecision;
use crate::usage::{UsageOutcome, UsagePipeline, UsageRecord};

/// Request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    Received,
    Authenticated,
    Admitted,
    Routed,
    Forwarding,
    Completed,
    Denied,
    Failed,
}

/// Memoization of emitted idempotency tokens.
///
/// Guards the at-most-once usage emission per token while an entry is
/// fresh. Entries are swept opportunistically on insert.
pub struct TokenLedger {
    seen: DashMap<Uuid, Instant>,
    ttl: Duration,
}

impl TokenLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Claim the token for emission. Returns false when a record for this
    /// token was already emitted within the TTL.
    pub fn try_claim(&self, token: Uuid) -> bool {
        if self.seen.len() > 65_536 {
            let ttl = self.ttl;
            self.seen.retain(|_, at| at.elapsed() < ttl);
        }

        // Read guard must drop before the insert below touches the shard.
        let fresh = match self.seen.get(&token) {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };
        if !fresh {
            return false;
        }
        self.seen.insert(token, Instant::now());
        true
    }
}

/// Accumulates the usage record across the pipeline and guarantees exactly
/// one emission per request.
///
/// The handler finishes the draft on every terminal path; the `Drop` impl
/// covers caller disconnects, so emission survives cancellation without a
/// detached task.
pub struct UsageDraft {
    pipeline: UsagePipeline,
    ledger: Arc<TokenLedger>,

    pub token: Uuid,
    pub trace_id: String,
    pub span_id: String,
    pub input_bytes: u64,

    org_id: Option<String>,
    key_id: Option<String>,
    model: Option<String>,
    backend_id: Option<String>,
    decision_reason: Option<String>,
    policy_version: Option<i64>,
    output_bytes: u64,
    upstream_started: Option<Instant>,
    upstream_latency: Option<Duration>,

    state: RequestState,
    /// Default outcome for an implicit (drop) emission in this state
    streaming_outcome: Option<UsageOutcome>,
    emitted: bool,
}

impl UsageDraft {
    pub fn new(pipeline: UsagePipeline, ledger: Arc<TokenLedger>, token: Uuid, input_bytes: u64) -> Self {
        Self {
            pipeline,
            ledger,
            token,
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            input_bytes,
            org_id: None,
            key_id: None,
            model: None,
            backend_id: None,
            decision_reason: None,
            policy_version: None,
            output_bytes: 0,
            upstream_started: None,
            upstream_latency: None,
            state: RequestState::Received,
            streaming_outcome: None,
            emitted: false,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn advance(&mut self, state: RequestState) {
        self.state = state;
    }

    pub fn set_principal(&mut self, org_id: &str, key_id: &str) {
        self.org_id = Some(org_id.to_string());
        self.key_id = Some(key_id.to_string());
    }

    pub fn set_model(&mut self, model: &str) {
        self.model = Some(model.to_string());
    }

    pub fn set_decision(&mut self, decision: &RoutingDecision) {
        self.backend_id = Some(decision.backend_id.clone());
        self.decision_reason = Some(decision.reason.to_string());
        self.policy_version = Some(decision.policy_version);
    }

    /// The bounded retry landed on a different backend.
    pub fn set_backend(&mut self, backend_id: &str) {
        self.backend_id = Some(backend_id.to_string());
    }

    pub fn note_denial_reason(&mut self, reason: &str) {
        self.decision_reason = Some(reason.to_string());
    }

    /// Mark the start of the upstream call so an aborted request still
    /// records a latency.
    pub fn start_forwarding(&mut self) {
        self.state = RequestState::Forwarding;
        self.upstream_started = Some(Instant::now());
    }

    pub fn set_upstream_latency(&mut self, latency: Duration) {
        self.upstream_latency = Some(latency);
    }

    pub fn add_output_bytes(&mut self, bytes: u64) {
        self.output_bytes += bytes;
    }

    /// The response body is streaming; an interrupted stream still counts
    /// as this outcome.
    pub fn set_streaming(&mut self, outcome: UsageOutcome) {
        self.streaming_outcome = Some(outcome);
    }

    fn effective_latency_ms(&self) -> u64 {
        let latency = self
            .upstream_latency
            .or_else(|| self.upstream_started.map(|s| s.elapsed()));
        latency.map_or(0, |d| d.as_millis() as u64)
    }

    fn build(&self, outcome: UsageOutcome) -> UsageRecord {
        UsageRecord {
            record_id: Uuid::new_v4(),
            idempotency_token: self.token,
            org_id: self.org_id.clone().unwrap_or_default(),
            key_id: self.key_id.clone().unwrap_or_default(),
            model: self.model.clone().unwrap_or_default(),
            backend_id: self.backend_id.clone(),
            input_bytes: self.input_bytes,
            output_bytes: self.output_bytes,
            upstream_latency_ms: self.effective_latency_ms(),
            outcome,
            decision_reason: self.decision_reason.clone(),
            policy_version: self.policy_version,
            timestamp_utc: Utc::now(),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
        }
    }

    /// Emit the usage record for this request. Idempotent per draft and
    /// guarded per token by the ledger.
    pub fn finish(&mut self, state: RequestState, outcome: UsageOutcome) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        self.state = state;

        // Requests that never passed authentication carry no principal and
        // are not billable events.
        if self.org_id.is_none() {
            return;
        }

        if !self.ledger.try_claim(self.token) {
            metrics::counter!("gantry_usage_duplicate_suppressed_total").increment(1);
            tracing::debug!(token = %self.token, "Duplicate usage emission suppressed");
            return;
        }

        self.pipeline.emit(self.build(outcome));
    }
}

impl Drop for UsageDraft {
    fn drop(&mut self) {
        if self.emitted {
            return;
        }

        match (self.state, self.streaming_outcome) {
            // Stream aborted mid-relay: bill what was delivered.
            (_, Some(outcome)) => self.finish(RequestState::Completed, outcome),
            // Caller vanished while the upstream call was in flight.
            (RequestState::Forwarding, None) => {
                self.finish(RequestState::Failed, UsageOutcome::BackendFailed)
            }
            // Disconnected before admission: nothing billable happened.
            _ => {}
        }
    }
}
