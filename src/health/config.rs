//! Health monitor configuration

use serde::{Deserialize, Serialize};

/// Probe cadence and hysteresis thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    /// Consecutive failures before a backend is `degraded`
    pub degraded_threshold: u32,
    /// Consecutive failures before a backend is `unavailable`
    pub unavailable_threshold: u32,
    /// Consecutive successes an `unavailable` backend needs to recover
    pub recovery_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 15,
            timeout_seconds: 5,
            degraded_threshold: 2,
            unavailable_threshold: 5,
            recovery_threshold: 2,
        }
    }
}
