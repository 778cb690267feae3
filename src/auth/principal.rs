//! Authenticated caller identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle state of an API key as reported by the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Expired,
}

/// Authentication result shared read-only by all pipeline stages.
///
/// Lives for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub org_id: String,
    pub key_id: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub status: KeyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Per-org shared secret for request-signature verification, when issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
}

impl Principal {
    /// Whether the key is usable right now.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == KeyStatus::Active
            && self.expires_at.map_or(true, |expiry| expiry > now)
    }
}
