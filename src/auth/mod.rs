//! Credential validation against the external authority.
//!
//! The hot path hits the fingerprint cache; misses call the authority's
//! `/validate` endpoint. A revoked or expired key is always a denial even
//! when the authority reports a principal.

mod cache;
mod error;
mod principal;
pub mod signature;

pub use cache::{fingerprint, CredentialCache};
pub use error::AuthError;
pub use principal::{KeyStatus, Principal};

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

/// Validates caller-presented bearer credentials.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, bearer: &str, org_hint: Option<&str>)
        -> Result<Principal, AuthError>;

    /// Revocation signal: drop any cached state for the key id.
    fn invalidate_key(&self, _key_id: &str) {}
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    bearer: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    org_hint: Option<&'a str>,
}

#[derive(Deserialize)]
struct DenialBody {
    code: String,
}

/// HTTP client for the credential authority, with the fingerprint cache.
pub struct HttpCredentialValidator {
    client: reqwest::Client,
    url: String,
    cache: CredentialCache,
}

impl HttpCredentialValidator {
    pub fn new(config: &AuthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .expect("Failed to build auth HTTP client");

        Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            cache: CredentialCache::new(
                config.cache_capacity,
                Duration::from_secs(config.positive_ttl_seconds),
                Duration::from_secs(config.negative_ttl_seconds),
            ),
        }
    }

    /// Cached entry count, exposed for the admin surface.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    async fn call_authority(
        &self,
        bearer: &str,
        org_hint: Option<&str>,
    ) -> Result<Principal, AuthError> {
        let response = self
            .client
            .post(format!("{}/validate", self.url))
            .json(&ValidateRequest { bearer, org_hint })
            .send()
            .await
            .map_err(|e| AuthError::ServiceUnavailable(e.to_string()))?;

        match response.status().as_u16() {
            200 => response
                .json::<Principal>()
                .await
                .map_err(|e| AuthError::ServiceUnavailable(e.to_string())),
            404 => Err(AuthError::KeyMissing),
            401 | 403 => {
                let code = response
                    .json::<DenialBody>()
                    .await
                    .map(|b| b.code)
                    .unwrap_or_default();
                match code.as_str() {
                    "key_revoked" => Err(AuthError::KeyRevoked),
                    "key_expired" => Err(AuthError::KeyExpired),
                    _ => Err(AuthError::KeyInvalid),
                }
            }
            status => Err(AuthError::ServiceUnavailable(format!(
                "authority returned {status}"
            ))),
        }
    }

    /// Re-check principal state locally so a stale authority row cannot
    /// admit a revoked or expired key.
    fn screen(principal: Principal) -> Result<Principal, AuthError> {
        match principal.status {
            KeyStatus::Revoked => Err(AuthError::KeyRevoked),
            KeyStatus::Expired => Err(AuthError::KeyExpired),
            KeyStatus::Active if !principal.is_active(Utc::now()) => Err(AuthError::KeyExpired),
            KeyStatus::Active => Ok(principal),
        }
    }
}

#[async_trait]
impl CredentialValidator for HttpCredentialValidator {
    async fn validate(
        &self,
        bearer: &str,
        org_hint: Option<&str>,
    ) -> Result<Principal, AuthError> {
        if bearer.is_empty() {
            return Err(AuthError::KeyMissing);
        }

        let fp = fingerprint(bearer);

        if let Some(cached) = self.cache.get(&fp) {
            metrics::counter!("gantry_auth_cache_hits_total").increment(1);
            return cached;
        }
        metrics::counter!("gantry_auth_cache_misses_total").increment(1);

        let result = self
            .call_authority(bearer, org_hint)
            .await
            .and_then(Self::screen);

        self.cache.put(fp, result.clone());
        result
    }

    fn invalidate_key(&self, key_id: &str) {
        self.cache.invalidate_key(key_id);
        tracing::info!(key_id = %key_id, "Credential cache purged by revocation signal");
    }
}
