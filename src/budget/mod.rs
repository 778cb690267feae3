//! Budget gating against the external budget authority.
//!
//! Budget is a soft financial boundary: the gate denies only on a
//! definitive `exceeded` answer. A cold authority outage keeps traffic
//! flowing (observable via a counter) unless the deployment opts into
//! fail-closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;

/// Budget standing as reported by the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStanding {
    Within,
    Exceeded,
}

/// Snapshot of one org's budget state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub state: BudgetStanding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

/// Gate decision for one request
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Allow,
    /// Authority unreachable; allowed under fail-open
    AllowDegraded,
    Deny { reset_at: Option<DateTime<Utc>> },
}

struct CachedBudget {
    state: BudgetState,
    fetched_at: Instant,
}

/// TTL-cached client for the budget authority.
pub struct BudgetGate {
    client: reqwest::Client,
    url: String,
    config: BudgetConfig,
    cache: DashMap<String, Arc<CachedBudget>>,
}

impl BudgetGate {
    pub fn new(config: BudgetConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .expect("Failed to build budget HTTP client");

        Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            config,
            cache: DashMap::new(),
        }
    }

    fn cached(&self, org_id: &str) -> Option<BudgetState> {
        let entry = self.cache.get(org_id)?;
        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);
        if entry.fetched_at.elapsed() > ttl {
            drop(entry);
            self.cache.remove(org_id);
            return None;
        }
        Some(entry.state.clone())
    }

    async fn fetch(&self, org_id: &str) -> Result<BudgetState, String> {
        let url = format!("{}/budgets/{org_id}/status", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("budget authority returned {}", response.status()));
        }

        response
            .json::<BudgetState>()
            .await
            .map_err(|e| e.to_string())
    }

    fn decide(state: &BudgetState) -> BudgetDecision {
        match state.state {
            BudgetStanding::Within => BudgetDecision::Allow,
            BudgetStanding::Exceeded => BudgetDecision::Deny {
                reset_at: state.reset_at,
            },
        }
    }

    /// Gate one request for the given organization.
    pub async fn check(&self, org_id: &str) -> BudgetDecision {
        if let Some(state) = self.cached(org_id) {
            return Self::decide(&state);
        }

        match self.fetch(org_id).await {
            Ok(state) => {
                let decision = Self::decide(&state);
                self.cache.insert(
                    org_id.to_string(),
                    Arc::new(CachedBudget {
                        state,
                        fetched_at: Instant::now(),
                    }),
                );
                decision
            }
            Err(e) => {
                tracing::warn!(org_id = %org_id, error = %e, "Budget lookup failed");
                metrics::counter!("gantry_budget_lookup_errors_total").increment(1);

                if self.config.fail_closed {
                    BudgetDecision::Deny { reset_at: None }
                } else {
                    metrics::counter!("gantry_budget_fail_open_total").increment(1);
                    BudgetDecision::AllowDegraded
                }
            }
        }
    }
}
