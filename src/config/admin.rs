//! Admin listener configuration

use serde::{Deserialize, Serialize};

/// Operator-facing admin listener.
///
/// The admin surface binds its own port so ingress traffic and operator
/// traffic never share a handler tree. `token` is the shared secret the
/// deployment distributes alongside its client certificates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Shared bearer token; empty disables mutations
    pub token: String,
    /// Default TTL for backend pins when the request omits one
    pub default_pin_ttl_seconds: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 9090,
            token: String::new(),
            default_pin_ttl_seconds: 300,
        }
    }
}
