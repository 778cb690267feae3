//! Redis-backed bucket store.
//!
//! Uses a `deadpool-redis` connection pool and one Lua script so the
//! read/refill/consume step is a single server-side operation; concurrent
//! gateway instances serialize on the store, not on each other.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::Script;

use super::error::RateLimitError;
use super::scripts;
use super::store::{BucketParams, RateDecision, RateLimitStore};

/// Redis implementation of [`RateLimitStore`].
pub struct RedisRateLimitStore {
    pool: Pool,
}

impl RedisRateLimitStore {
    /// Create a store from a Redis URL.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Connection`] if the pool cannot be created.
    pub fn new(url: &str) -> Result<Self, RateLimitError> {
        let cfg = Config::from_url(url);
        let pool = cfg
            .builder()
            .map(|b| b.runtime(Runtime::Tokio1).build())
            .map_err(|e| RateLimitError::Connection(e.to_string()))?
            .map_err(|e| RateLimitError::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, RateLimitError> {
        self.pool
            .get()
            .await
            .map_err(|e| RateLimitError::Connection(e.to_string()))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn consume(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
    ) -> Result<RateDecision, RateLimitError> {
        let mut conn = self.conn().await?;

        let script = Script::new(scripts::TOKEN_BUCKET);
        let (allowed, tokens, retry_ms): (i64, String, i64) = script
            .key(key)
            .arg(params.burst)
            .arg(params.rate_per_second)
            .arg(params.cost)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        if allowed == 1 {
            let remaining = tokens.parse::<f64>().unwrap_or(0.0);
            Ok(RateDecision::Allowed { remaining })
        } else {
            Ok(RateDecision::Denied {
                retry_after: Duration::from_millis(retry_ms.max(0) as u64),
            })
        }
    }
}
