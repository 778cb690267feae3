//! Credential authority configuration

use serde::{Deserialize, Serialize};

/// Settings for the credential validation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the credential authority
    pub url: String,
    pub request_timeout_seconds: u64,
    /// TTL for cached positive validations
    pub positive_ttl_seconds: u64,
    /// TTL for cached denials (shorter, to bound stuffing amplification)
    pub negative_ttl_seconds: u64,
    /// Hard cap on cached fingerprints
    pub cache_capacity: usize,
    /// Require an HMAC body signature when the principal carries a signing key
    pub enforce_signatures: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7100".to_string(),
            request_timeout_seconds: 5,
            positive_ttl_seconds: 30,
            negative_ttl_seconds: 5,
            cache_capacity: 10_000,
            enforce_signatures: false,
        }
    }
}
