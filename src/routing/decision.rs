//! Routing decision types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a backend was (or was not) selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionReason {
    /// Weighted draw over healthy backends
    Primary,
    /// No healthy candidate; drawn from degraded backends
    Failover,
    /// Admin pin short-circuited selection
    Override,
    /// Selection was refused (allow/deny lists)
    Denied,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SelectionReason::Primary => "primary",
            SelectionReason::Failover => "failover",
            SelectionReason::Override => "override",
            SelectionReason::Denied => "denied",
        };
        write!(f, "{s}")
    }
}

/// The routing engine's output for one request.
///
/// Transient: logged, stamped onto the usage record, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub backend_id: String,
    pub policy_version: i64,
    pub reason: SelectionReason,
    /// Time spent inside the engine
    pub elapsed: Duration,
}
