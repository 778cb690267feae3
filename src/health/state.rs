//! Per-backend probe state tracking with hysteresis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::HealthConfig;

/// Routing eligibility of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Last probe succeeded; eligible for primary selection
    Healthy,
    /// Failing but below the exclusion threshold; fallback use only
    Degraded,
    /// Excluded from routing until it recovers
    Unavailable,
}

/// Tracks probe history for a single backend.
///
/// A backend new to the catalog starts `Healthy` so a fresh snapshot can
/// route immediately; the first probe result takes over.
#[derive(Debug, Clone)]
pub struct ProbeState {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub state: HealthState,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ProbeState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            state: HealthState::Healthy,
            last_probe_at: None,
            last_error: None,
        }
    }
}

impl ProbeState {
    /// Apply a probe result; returns the new state when a transition occurs.
    pub fn apply(&mut self, success: bool, config: &HealthConfig) -> Option<HealthState> {
        self.last_probe_at = Some(Utc::now());

        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            self.last_error = None;

            match self.state {
                HealthState::Degraded => {
                    self.state = HealthState::Healthy;
                    Some(HealthState::Healthy)
                }
                // Recovery from full exclusion needs sustained successes
                // to avoid flapping.
                HealthState::Unavailable
                    if self.consecutive_successes >= config.recovery_threshold =>
                {
                    self.state = HealthState::Healthy;
                    Some(HealthState::Healthy)
                }
                _ => None,
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;

            let next = if self.consecutive_failures >= config.unavailable_threshold {
                HealthState::Unavailable
            } else if self.consecutive_failures >= config.degraded_threshold {
                HealthState::Degraded
            } else {
                return None;
            };

            if next != self.state {
                self.state = next;
                Some(next)
            } else {
                None
            }
        }
    }
}

/// Immutable copy of the health map handed to readers.
#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub backends: std::collections::BTreeMap<String, BackendHealth>,
}

/// One backend's health as seen by readers
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub state: HealthState,
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthView {
    /// State for a backend; unknown ids read as healthy (optimistic start).
    pub fn state(&self, backend_id: &str) -> HealthState {
        self.backends
            .get(backend_id)
            .map_or(HealthState::Healthy, |h| h.state)
    }

    /// Whether any backend is currently healthy.
    pub fn any_healthy(&self) -> bool {
        self.backends
            .values()
            .any(|h| h.state == HealthState::Healthy)
    }
}
