//! Immutable catalog snapshot: routing policies and the backend registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use super::error::CatalogError;

/// Org value that matches any organization
pub const WILDCARD_ORG: &str = "*";

/// Per-policy rate-limit override.
///
/// Policies may declare their own bucket parameters; requests under policies
/// without one fall back to the gateway-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOverride {
    pub burst: u32,
    pub rate_per_second: f64,
    /// Cost charged per request (default 1); lets heavy models weigh more
    #[serde(default = "default_cost")]
    pub cost: u32,
}

fn default_cost() -> u32 {
    1
}

/// A weighted routing policy for one (org, model) pair.
///
/// `org` is either an organization id or [`WILDCARD_ORG`]. Weights map
/// backend ids to non-negative draw weights; zero-weight backends are kept
/// for visibility but never selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub org: String,
    pub model: String,
    pub weights: BTreeMap<String, u32>,
    /// Consecutive upstream failures before the engine prefers other backends
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,
    /// When present, only these key ids may route under this policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_keys: Option<BTreeSet<String>>,
    /// Key ids denied under this policy
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_keys: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitOverride>,
    /// Monotonic per-policy revision assigned by the config service
    pub version: i64,
}

fn default_failover_threshold() -> u32 {
    3
}

impl RoutingPolicy {
    /// Sum of all weights; a valid policy has a positive sum.
    pub fn weight_sum(&self) -> u64 {
        self.weights.values().map(|w| u64::from(*w)).sum()
    }

    /// Whether the given key id may route under this policy.
    pub fn permits_key(&self, key_id: &str) -> bool {
        if self.deny_keys.contains(key_id) {
            return false;
        }
        match &self.allow_keys {
            Some(allowed) => allowed.contains(key_id),
            None => true,
        }
    }
}

/// Region/tier labels attached to a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendLabels {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

/// An upstream inference endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    /// Stable identifier referenced by policy weights
    pub id: String,
    /// Base URL for forwarded requests
    pub url: String,
    /// Per-call timeout; the gateway default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Liveness probe path (default `/healthz`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_path: Option<String>,
    #[serde(default)]
    pub labels: BackendLabels,
}

impl BackendEndpoint {
    /// Effective per-call timeout given the gateway default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds.map_or(default, Duration::from_secs)
    }

    /// Effective probe path.
    pub fn probe_path(&self) -> &str {
        self.probe_path.as_deref().unwrap_or("/healthz")
    }
}

/// Wire document delivered by the config service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub version: i64,
    pub policies: Vec<RoutingPolicy>,
    pub backends: Vec<BackendEndpoint>,
    /// Key ids revoked since the previous version; consumers purge caches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revoked_keys: Vec<String>,
}

/// Immutable point-in-time view of (policies, backends).
///
/// Built once per catalog update and published behind an `Arc`; readers
/// capture the pointer at pipeline entry and see one consistent pair for
/// the whole request.
#[derive(Debug)]
pub struct Snapshot {
    version: i64,
    fetched_at: DateTime<Utc>,
    backends: BTreeMap<String, BackendEndpoint>,
    policies: HashMap<(String, String), RoutingPolicy>,
    revoked_keys: Vec<String>,
}

impl Snapshot {
    /// Build a snapshot from a catalog document, dropping invalid policies.
    ///
    /// A policy is invalid when its weight sum is zero or it references a
    /// backend absent from the document; each drop is logged. A document
    /// with no backends is rejected wholesale.
    pub fn from_document(
        doc: CatalogDocument,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, CatalogError> {
        if doc.backends.is_empty() {
            return Err(CatalogError::EmptyCatalog);
        }

        let backends: BTreeMap<String, BackendEndpoint> = doc
            .backends
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect();

        let mut policies = HashMap::new();
        for policy in doc.policies {
            if policy.weight_sum() == 0 {
                tracing::warn!(
                    org = %policy.org,
                    model = %policy.model,
                    "Dropping policy with zero weight sum"
                );
                continue;
            }
            if let Some(unknown) = policy.weights.keys().find(|id| !backends.contains_key(*id)) {
                tracing::warn!(
                    org = %policy.org,
                    model = %policy.model,
                    backend_id = %unknown,
                    "Dropping policy referencing unknown backend"
                );
                continue;
            }
            policies.insert((policy.org.clone(), policy.model.clone()), policy);
        }

        Ok(Self {
            version: doc.version,
            fetched_at,
            backends,
            policies,
            revoked_keys: doc.revoked_keys,
        })
    }

    /// An empty pre-hydration snapshot (version 0, no backends).
    pub fn empty() -> Self {
        Self {
            version: 0,
            fetched_at: Utc::now(),
            backends: BTreeMap::new(),
            policies: HashMap::new(),
            revoked_keys: Vec::new(),
        }
    }

    /// Monotonic version of this snapshot.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// When the document behind this snapshot was fetched.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Highest-precedence policy for (org, model): exact org beats wildcard.
    pub fn policy(&self, org: &str, model: &str) -> Result<&RoutingPolicy, CatalogError> {
        self.policies
            .get(&(org.to_string(), model.to_string()))
            .or_else(|| {
                self.policies
                    .get(&(WILDCARD_ORG.to_string(), model.to_string()))
            })
            .ok_or_else(|| CatalogError::PolicyMissing {
                org: org.to_string(),
                model: model.to_string(),
            })
    }

    /// Backend lookup by id.
    pub fn backend(&self, id: &str) -> Result<&BackendEndpoint, CatalogError> {
        self.backends
            .get(id)
            .ok_or_else(|| CatalogError::BackendUnknown(id.to_string()))
    }

    /// All backends in stable (id) order.
    pub fn backends(&self) -> impl Iterator<Item = &BackendEndpoint> {
        self.backends.values()
    }

    /// Number of registered backends.
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Number of installed policies.
    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    /// All installed policies (iteration order unspecified).
    pub fn policies(&self) -> impl Iterator<Item = &RoutingPolicy> {
        self.policies.values()
    }

    /// Key ids revoked in the document behind this snapshot.
    pub fn revoked_keys(&self) -> &[String] {
        &self.revoked_keys
    }
}
