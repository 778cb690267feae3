//! Budget authority configuration

use serde::{Deserialize, Serialize};

/// Settings for the budget gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Base URL of the budget authority
    pub url: String,
    pub request_timeout_seconds: u64,
    /// TTL for cached budget states
    pub cache_ttl_seconds: u64,
    /// Deny requests when the authority is unreachable (default allows)
    pub fail_closed: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7200".to_string(),
            request_timeout_seconds: 3,
            cache_ttl_seconds: 5,
            fail_closed: false,
        }
    }
}
