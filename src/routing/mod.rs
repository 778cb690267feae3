//! Policy-driven backend selection.
//!
//! Selection is deterministic per idempotency token: the token hash drives
//! the weighted draw, so a retried request lands on the same backend while
//! the policy version and health set are unchanged.

mod decision;
mod error;
mod pins;

pub use decision::{RoutingDecision, SelectionReason};
pub use error::RoutingError;
pub use pins::{Pin, PinStore};

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::catalog::{CatalogError, RoutingPolicy, Snapshot};
use crate::health::{HealthState, HealthView};

/// Stateless selection engine; pins are its only mutable collaborator.
pub struct RoutingEngine {
    pins: Arc<PinStore>,
}

/// Reduce an idempotency token to the draw point for a given weight sum.
fn draw_point(token: &Uuid, weight_sum: u64) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) % weight_sum
}

impl RoutingEngine {
    pub fn new(pins: Arc<PinStore>) -> Self {
        Self { pins }
    }

    pub fn pins(&self) -> &Arc<PinStore> {
        &self.pins
    }

    /// Weighted deterministic draw over candidate (id, weight) pairs.
    ///
    /// Candidates must arrive in a stable order; weights are interpreted
    /// modulo their sum, so no normalization is needed.
    fn weighted_draw<'a>(candidates: &[(&'a str, u32)], token: &Uuid) -> Option<&'a str> {
        let weight_sum: u64 = candidates.iter().map(|(_, w)| u64::from(*w)).sum();
        if weight_sum == 0 {
            return None;
        }

        let point = draw_point(token, weight_sum);
        let mut cumulative = 0u64;
        for (id, weight) in candidates {
            cumulative += u64::from(*weight);
            if point < cumulative {
                return Some(id);
            }
        }
        None
    }

    fn partition<'a>(
        policy: &'a RoutingPolicy,
        health: &HealthView,
        state: HealthState,
    ) -> Vec<(&'a str, u32)> {
        policy
            .weights
            .iter()
            .filter(|(_, weight)| **weight > 0)
            .filter(|(id, _)| health.state(id) == state)
            .map(|(id, weight)| (id.as_str(), *weight))
            .collect()
    }

    /// Select a backend for (org, model, key) under the given snapshot and
    /// health view.
    pub fn select(
        &self,
        snapshot: &Snapshot,
        health: &HealthView,
        org_id: &str,
        model: &str,
        key_id: &str,
        token: &Uuid,
    ) -> Result<RoutingDecision, RoutingError> {
        let start = Instant::now();

        let policy = snapshot.policy(org_id, model).map_err(|e| match e {
            CatalogError::PolicyMissing { org, model } => {
                RoutingError::PolicyMissing { org, model }
            }
            _ => RoutingError::PolicyMissing {
                org: org_id.to_string(),
                model: model.to_string(),
            },
        })?;

        if !policy.permits_key(key_id) {
            tracing::debug!(org_id, model, key_id, "Routing denied by policy key lists");
            return Err(RoutingError::Forbidden {
                key_id: key_id.to_string(),
                model: model.to_string(),
            });
        }

        // A valid pin short-circuits health partitioning entirely.
        if let Some(pin) = self.pins.get(org_id, model) {
            if snapshot.backend(&pin.backend_id).is_ok() {
                return Ok(RoutingDecision {
                    backend_id: pin.backend_id,
                    policy_version: policy.version,
                    reason: SelectionReason::Override,
                    elapsed: start.elapsed(),
                });
            }
            tracing::warn!(
                org_id,
                model,
                backend_id = %pin.backend_id,
                "Ignoring pin for backend absent from snapshot"
            );
        }

        let weighted_count = policy.weights.values().filter(|w| **w > 0).count();
        let healthy = Self::partition(policy, health, HealthState::Healthy);
        if let Some(backend_id) = Self::weighted_draw(&healthy, token) {
            // Losing any weighted backend to health exclusion makes the
            // selection a failover even when a healthy candidate serves.
            let reason = if healthy.len() == weighted_count {
                SelectionReason::Primary
            } else {
                SelectionReason::Failover
            };
            if reason == SelectionReason::Failover {
                metrics::counter!("gantry_routing_failovers_total",
                    "model" => model.to_string()
                )
                .increment(1);
            }
            return Ok(RoutingDecision {
                backend_id: backend_id.to_string(),
                policy_version: policy.version,
                reason,
                elapsed: start.elapsed(),
            });
        }

        let degraded = Self::partition(policy, health, HealthState::Degraded);
        if let Some(backend_id) = Self::weighted_draw(&degraded, token) {
            metrics::counter!("gantry_routing_failovers_total",
                "model" => model.to_string()
            )
            .increment(1);
            return Ok(RoutingDecision {
                backend_id: backend_id.to_string(),
                policy_version: policy.version,
                reason: SelectionReason::Failover,
                elapsed: start.elapsed(),
            });
        }

        Err(RoutingError::NoBackendAvailable {
            model: model.to_string(),
        })
    }

    /// Alternate healthy backend for the bounded forward retry, excluding
    /// the one that just failed.
    pub fn retry_candidate(
        &self,
        snapshot: &Snapshot,
        health: &HealthView,
        org_id: &str,
        model: &str,
        failed_backend: &str,
        token: &Uuid,
    ) -> Option<String> {
        let policy = snapshot.policy(org_id, model).ok()?;
        let healthy: Vec<(&str, u32)> = Self::partition(policy, health, HealthState::Healthy)
            .into_iter()
            .filter(|(id, _)| *id != failed_backend)
            .collect();
        Self::weighted_draw(&healthy, token).map(str::to_string)
    }
}
