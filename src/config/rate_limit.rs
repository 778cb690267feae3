//! Rate limiter configuration

use serde::{Deserialize, Serialize};

/// Token-bucket defaults and store settings.
///
/// Per-org bucket parameters come from routing policies in the catalog;
/// these values apply when a policy declares no limit of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Redis URL of the shared bucket store; empty selects the in-process store
    pub store_url: String,
    /// Key prefix so gateway fleets can share one store
    pub key_prefix: String,
    /// Default burst capacity per (org, key)
    pub default_burst: u32,
    /// Default refill rate in tokens per second
    pub default_rate_per_second: f64,
    /// Deny requests while the store is unreachable
    pub fail_closed: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            store_url: String::new(),
            key_prefix: "gantry".to_string(),
            default_burst: 60,
            default_rate_per_second: 1.0,
            fail_closed: false,
        }
    }
}
