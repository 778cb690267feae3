//! Upstream forwarding configuration

use serde::{Deserialize, Serialize};

/// Defaults for the upstream HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Timeout applied when a backend declares none
    pub default_timeout_seconds: u64,
    /// Cap on a buffered (non-streaming) upstream response body
    pub max_response_bytes: usize,
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 120,
            max_response_bytes: 8 * 1024 * 1024,
            pool_max_idle_per_host: 10,
        }
    }
}
