//! Bucket store abstraction and the in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::RateLimitError;

/// Parameters governing one bucket
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub burst: u32,
    pub rate_per_second: f64,
    pub cost: u32,
}

/// Outcome of one atomic consume attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed { remaining: f64 },
    Denied { retry_after: Duration },
}

/// Atomic token-bucket operations on a keyed store.
///
/// Implementations must make the read/refill/consume step a single atomic
/// operation so concurrent gateway instances cannot race a bucket.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn consume(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
    ) -> Result<RateDecision, RateLimitError>;
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

/// In-process bucket store.
///
/// Suitable for single-instance deployments and tests; a fleet must use the
/// Redis store so buckets coordinate across instances.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    buckets: DashMap<String, BucketState>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining tokens in a bucket, for assertions in tests.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.tokens)
    }
}

/// Shared refill-and-consume step; the DashMap entry guard makes it atomic
/// per key within this process.
fn step(state: &mut BucketState, params: &BucketParams, now_ms: i64) -> RateDecision {
    let elapsed = (now_ms - state.last_refill_ms).max(0) as f64 / 1000.0;
    let headroom = f64::from(params.burst) - state.tokens;
    let refill = (elapsed * params.rate_per_second).clamp(0.0, headroom.max(0.0));
    state.tokens += refill;
    state.last_refill_ms = now_ms;

    let cost = f64::from(params.cost);
    if state.tokens >= cost {
        state.tokens -= cost;
        RateDecision::Allowed {
            remaining: state.tokens,
        }
    } else {
        let retry_after = if params.rate_per_second > 0.0 {
            Duration::from_secs_f64((cost - state.tokens) / params.rate_per_second)
        } else {
            Duration::from_secs(3600)
        };
        RateDecision::Denied { retry_after }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn consume(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
    ) -> Result<RateDecision, RateLimitError> {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState {
                tokens: f64::from(params.burst),
                last_refill_ms: now_ms,
            });

        Ok(step(entry.value_mut(), params, now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(burst: u32, rate: f64) -> BucketParams {
        BucketParams {
            burst,
            rate_per_second: rate,
            cost: 1,
        }
    }

    #[tokio::test]
    async fn fresh_bucket_starts_full() {
        let store = MemoryRateLimitStore::new();
        let decision = store.consume("k", &params(5, 1.0), 0).await.unwrap();
        assert_eq!(decision, RateDecision::Allowed { remaining: 4.0 });
    }

    #[tokio::test]
    async fn exactly_one_token_with_cost_one_allows_to_zero() {
        let store = MemoryRateLimitStore::new();
        let p = params(1, 0.0);
        assert!(matches!(
            store.consume("k", &p, 0).await.unwrap(),
            RateDecision::Allowed { remaining } if remaining == 0.0
        ));
        assert!(matches!(
            store.consume("k", &p, 0).await.unwrap(),
            RateDecision::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn zero_rate_bucket_exhausts() {
        let store = MemoryRateLimitStore::new();
        let p = params(2, 0.0);
        assert!(matches!(
            store.consume("k", &p, 0).await.unwrap(),
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            store.consume("k", &p, 0).await.unwrap(),
            RateDecision::Allowed { .. }
        ));
        let denied = store.consume("k", &p, 0).await.unwrap();
        match denied {
            RateDecision::Denied { retry_after } => assert!(retry_after.as_secs() > 0),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refill_is_clamped_at_burst() {
        let store = MemoryRateLimitStore::new();
        let p = params(3, 10.0);
        store.consume("k", &p, 0).await.unwrap();

        // Ten minutes later the bucket has refilled, but only to burst.
        let decision = store.consume("k", &p, 600_000).await.unwrap();
        assert_eq!(decision, RateDecision::Allowed { remaining: 2.0 });
    }

    #[tokio::test]
    async fn retry_after_reflects_deficit() {
        let store = MemoryRateLimitStore::new();
        let p = params(1, 0.5);
        store.consume("k", &p, 0).await.unwrap();

        match store.consume("k", &p, 0).await.unwrap() {
            RateDecision::Denied { retry_after } => {
                // One token at 0.5/s is two seconds away
                assert!((retry_after.as_secs_f64() - 2.0).abs() < 0.01);
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clock_regression_does_not_refill() {
        let store = MemoryRateLimitStore::new();
        let p = params(2, 1.0);
        store.consume("k", &p, 10_000).await.unwrap();
        store.consume("k", &p, 10_000).await.unwrap();

        // A caller clock behind the last refill must not mint tokens.
        assert!(matches!(
            store.consume("k", &p, 5_000).await.unwrap(),
            RateDecision::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn tokens_never_go_negative_or_exceed_burst() {
        let store = MemoryRateLimitStore::new();
        let p = params(4, 2.0);
        for i in 0..50 {
            store.consume("k", &p, i * 250).await.unwrap();
            let tokens = store.tokens("k").unwrap();
            assert!((0.0..=4.0).contains(&tokens), "tokens out of range: {tokens}");
        }
    }
}
