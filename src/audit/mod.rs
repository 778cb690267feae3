//! Audit event emission.
//!
//! Every limit denial and every admin mutation produces an [`AuditEvent`].
//! Sinks are pluggable; the default sink writes structured log records so
//! the events ride the deployment's log shipping.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classes of audited actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RateLimitDenied,
    BudgetDenied,
    RoutingDenied,
    LimiterModeChanged,
    BackendPinned,
    PinCleared,
    ReprobeForced,
}

/// A single audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Org id, key id, or operator identity that triggered the event
    pub actor: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(actor: impl Into<String>, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            action,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: one structured log line per event.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "gantry::audit",
            audit_id = %event.id,
            actor = %event.actor,
            action = ?event.action,
            metadata = ?event.metadata,
            "audit event"
        );
        metrics::counter!("gantry_audit_events_total",
            "action" => format!("{:?}", event.action)
        )
        .increment(1);
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience alias used across the pipeline
pub type SharedAuditSink = Arc<dyn AuditSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects_events() {
        let sink = MemoryAuditSink::new();
        sink.record(
            AuditEvent::new("org-1", AuditAction::RateLimitDenied).with("limit", "requests"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "org-1");
        assert_eq!(events[0].metadata.get("limit").unwrap(), "requests");
    }

    #[test]
    fn audit_event_serializes_snake_case_action() {
        let event = AuditEvent::new("op", AuditAction::BackendPinned);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("backend_pinned"));
    }
}
