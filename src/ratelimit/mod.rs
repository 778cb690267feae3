//! Token-bucket rate limiting across a shared keyspace.
//!
//! Buckets are keyed by (org, key, limit name) so every gateway instance
//! working against the same store enforces one fleet-wide limit. Policy
//! limit overrides from the catalog take precedence over gateway defaults.

mod error;
mod redis;
mod scripts;
mod store;

pub use self::redis::RedisRateLimitStore;
pub use error::RateLimitError;
pub use store::{BucketParams, MemoryRateLimitStore, RateDecision, RateLimitStore};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::audit::{AuditAction, AuditEvent, SharedAuditSink};
use crate::catalog::LimitOverride;
use crate::config::RateLimitConfig;

/// Name of the default per-request limit dimension
pub const REQUEST_LIMIT: &str = "requests";

/// Result of the admission check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitOutcome {
    Allowed,
    Denied { retry_after: Duration },
}

/// Fleet-coordinated rate limiter.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
    audit: SharedAuditSink,
    degraded: AtomicBool,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        config: RateLimitConfig,
        audit: SharedAuditSink,
    ) -> Self {
        Self {
            store,
            config,
            audit,
            degraded: AtomicBool::new(false),
        }
    }

    /// Build the limiter from configuration, choosing the store by URL.
    pub fn from_config(
        config: RateLimitConfig,
        audit: SharedAuditSink,
    ) -> Result<Self, RateLimitError> {
        let store: Arc<dyn RateLimitStore> = if config.store_url.is_empty() {
            tracing::info!("Rate limiter using in-process bucket store");
            Arc::new(MemoryRateLimitStore::new())
        } else {
            tracing::info!(url = %config.store_url, "Rate limiter using Redis bucket store");
            Arc::new(RedisRateLimitStore::new(&config.store_url)?)
        };
        Ok(Self::new(store, config, audit))
    }

    fn bucket_key(&self, org_id: &str, key_id: &str, limit_name: &str) -> String {
        format!("{}:rl:{org_id}:{key_id}:{limit_name}", self.config.key_prefix)
    }

    fn params_for(&self, limit: Option<&LimitOverride>) -> BucketParams {
        match limit {
            Some(l) => BucketParams {
                burst: l.burst,
                rate_per_second: l.rate_per_second,
                cost: l.cost.max(1),
            },
            None => BucketParams {
                burst: self.config.default_burst,
                rate_per_second: self.config.default_rate_per_second,
                cost: 1,
            },
        }
    }

    /// Whether the store is currently unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn note_store_result(&self, org_id: &str, ok: bool) {
        let was_degraded = self.degraded.swap(!ok, Ordering::Relaxed);
        if ok == was_degraded {
            // Mode transitioned; make the condition observable.
            let mode = if ok { "normal" } else { "degraded" };
            metrics::counter!("gantry_ratelimit_degraded_transitions_total",
                "mode" => mode
            )
            .increment(1);
            self.audit.record(
                AuditEvent::new(org_id, AuditAction::LimiterModeChanged).with("mode", mode),
            );
            tracing::warn!(mode, "Rate limiter store mode changed");
        }
    }

    /// Consume one request's cost from the caller's bucket.
    ///
    /// Store failures fall back to the configured open/closed behavior and
    /// never surface as errors to the pipeline.
    pub async fn check(
        &self,
        org_id: &str,
        key_id: &str,
        limit: Option<&LimitOverride>,
    ) -> RateLimitOutcome {
        let key = self.bucket_key(org_id, key_id, REQUEST_LIMIT);
        let params = self.params_for(limit);
        let now_ms = Utc::now().timestamp_millis();

        match self.store.consume(&key, &params, now_ms).await {
            Ok(decision) => {
                self.note_store_result(org_id, true);
                match decision {
                    RateDecision::Allowed { .. } => RateLimitOutcome::Allowed,
                    RateDecision::Denied { retry_after } => {
                        metrics::counter!("gantry_ratelimit_denials_total",
                            "org" => org_id.to_string()
                        )
                        .increment(1);
                        RateLimitOutcome::Denied { retry_after }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rate limit store unreachable");
                metrics::counter!("gantry_ratelimit_store_errors_total").increment(1);
                self.note_store_result(org_id, false);

                if self.config.fail_closed {
                    RateLimitOutcome::Denied {
                        retry_after: Duration::from_secs(1),
                    }
                } else {
                    RateLimitOutcome::Allowed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditSink};
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn consume(
            &self,
            _key: &str,
            _params: &BucketParams,
            _now_ms: i64,
        ) -> Result<RateDecision, RateLimitError> {
            Err(RateLimitError::Connection("store down".to_string()))
        }
    }

    fn limiter_with(
        store: Arc<dyn RateLimitStore>,
        fail_closed: bool,
    ) -> (RateLimiter, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let config = RateLimitConfig {
            default_burst: 2,
            default_rate_per_second: 0.0,
            fail_closed,
            ..RateLimitConfig::default()
        };
        (
            RateLimiter::new(store, config, audit.clone() as SharedAuditSink),
            audit,
        )
    }

    #[tokio::test]
    async fn denies_after_burst_with_retry_hint() {
        let (limiter, _) = limiter_with(Arc::new(MemoryRateLimitStore::new()), false);

        assert_eq!(limiter.check("org", "key", None).await, RateLimitOutcome::Allowed);
        assert_eq!(limiter.check("org", "key", None).await, RateLimitOutcome::Allowed);
        match limiter.check("org", "key", None).await {
            RateLimitOutcome::Denied { retry_after } => assert!(retry_after.as_secs() > 0),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn buckets_are_isolated_per_key() {
        let (limiter, _) = limiter_with(Arc::new(MemoryRateLimitStore::new()), false);

        limiter.check("org", "key-a", None).await;
        limiter.check("org", "key-a", None).await;
        assert!(matches!(
            limiter.check("org", "key-a", None).await,
            RateLimitOutcome::Denied { .. }
        ));
        // A sibling key still has a full bucket
        assert_eq!(
            limiter.check("org", "key-b", None).await,
            RateLimitOutcome::Allowed
        );
    }

    #[tokio::test]
    async fn policy_override_takes_precedence() {
        let (limiter, _) = limiter_with(Arc::new(MemoryRateLimitStore::new()), false);
        let tight = LimitOverride {
            burst: 1,
            rate_per_second: 0.0,
            cost: 1,
        };

        assert_eq!(
            limiter.check("org", "key", Some(&tight)).await,
            RateLimitOutcome::Allowed
        );
        assert!(matches!(
            limiter.check("org", "key", Some(&tight)).await,
            RateLimitOutcome::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn store_outage_fails_open_by_default() {
        let (limiter, audit) = limiter_with(Arc::new(FailingStore), false);

        assert_eq!(limiter.check("org", "key", None).await, RateLimitOutcome::Allowed);
        assert!(limiter.is_degraded());

        // Mode transition produced exactly one audit event
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::LimiterModeChanged);

        // A second failure does not re-audit
        limiter.check("org", "key", None).await;
        assert_eq!(audit.events().len(), 1);
    }

    #[tokio::test]
    async fn store_outage_fail_closed_denies() {
        let (limiter, _) = limiter_with(Arc::new(FailingStore), true);
        assert!(matches!(
            limiter.check("org", "key", None).await,
            RateLimitOutcome::Denied { .. }
        ));
    }
}
