//! Catalog hydration and watch loop.
//!
//! Startup hydrates from a unary GET, falling back to the on-disk snapshot
//! when the config service is down. The watch loop long-polls for versioned
//! updates and reconnects with exponential backoff after any gap, re-hydrating
//! so no intermediate version is missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::CatalogError;
use super::snapshot::CatalogDocument;
use super::store::SnapshotStore;
use super::CatalogCache;
use crate::config::ControlPlaneConfig;

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Maintains the catalog cache against the config service.
pub struct CatalogWatcher {
    cache: Arc<CatalogCache>,
    store: SnapshotStore,
    client: reqwest::Client,
    config: ControlPlaneConfig,
}

impl CatalogWatcher {
    pub fn new(cache: Arc<CatalogCache>, config: ControlPlaneConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                config.watch_timeout_seconds + config.request_timeout_seconds,
            ))
            .build()
            .expect("Failed to build catalog HTTP client");
        let store = SnapshotStore::new(config.snapshot_path.clone());

        Self {
            cache,
            store,
            client,
            config,
        }
    }

    /// Hydrate the cache: live GET first, disk snapshot on failure.
    ///
    /// Returns an error only when both sources are unavailable; the caller
    /// decides whether an empty cache is fatal (it is not; requests fail
    /// with `PolicyMissing` until a snapshot arrives).
    pub async fn hydrate(&self) -> Result<(), CatalogError> {
        match self.fetch_full().await {
            Ok(doc) => {
                if let Err(e) = self.store.save(&doc) {
                    tracing::warn!(error = %e, "Failed to persist catalog snapshot");
                }
                self.cache.install(doc, false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Catalog hydration failed, trying disk snapshot");
                match self.store.load()? {
                    Some(doc) => self.cache.install(doc, true),
                    None => Err(e),
                }
            }
        }
    }

    async fn fetch_full(&self) -> Result<CatalogDocument, CatalogError> {
        let url = format!("{}/v1/catalog", self.config.url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(self.config.request_timeout_seconds))
            .send()
            .await
            .map_err(|e| CatalogError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Fetch(format!(
                "config service returned {}",
                response.status()
            )));
        }

        response
            .json::<CatalogDocument>()
            .await
            .map_err(|e| CatalogError::Parse(e.to_string()))
    }

    /// Long-poll the watch endpoint for the next document after `version`.
    ///
    /// `Ok(None)` means the poll timed out with no change.
    async fn watch_once(&self, version: i64) -> Result<Option<CatalogDocument>, CatalogError> {
        let url = format!(
            "{}/v1/catalog/watch?after={}&timeout={}",
            self.config.url.trim_end_matches('/'),
            version,
            self.config.watch_timeout_seconds
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::Fetch(e.to_string()))?;

        match response.status().as_u16() {
            204 => Ok(None),
            200 => response
                .json::<CatalogDocument>()
                .await
                .map(Some)
                .map_err(|e| CatalogError::Parse(e.to_string())),
            status => Err(CatalogError::Fetch(format!(
                "watch returned status {}",
                status
            ))),
        }
    }

    /// Start the watch loop. Returns a JoinHandle that resolves on shutdown.
    pub fn start(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = BACKOFF_MIN;
            let mut resync = false;

            tracing::info!(url = %self.config.url, "Catalog watcher started");

            loop {
                if cancel_token.is_cancelled() {
                    break;
                }

                // After a gap, re-hydrate so missed versions are not skipped.
                if resync {
                    if self.hydrate().await.is_ok() && !self.cache.is_stale() {
                        resync = false;
                        backoff = BACKOFF_MIN;
                    } else {
                        metrics::counter!("gantry_catalog_watch_reconnects_total").increment(1);
                        tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                        continue;
                    }
                }

                let version = self.cache.version();
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = self.watch_once(version) => match result {
                        Ok(Some(doc)) => {
                            backoff = BACKOFF_MIN;
                            if doc.version <= version {
                                tracing::debug!(
                                    received = doc.version,
                                    current = version,
                                    "Ignoring non-advancing catalog document"
                                );
                                continue;
                            }
                            if let Err(e) = self.store.save(&doc) {
                                tracing::warn!(error = %e, "Failed to persist catalog snapshot");
                            }
                            if let Err(e) = self.cache.install(doc, false) {
                                tracing::warn!(error = %e, "Rejected catalog document from watch");
                            }
                        }
                        Ok(None) => {
                            backoff = BACKOFF_MIN;
                            // A disk snapshot confirmed current by the
                            // service still deserves a live install.
                            if self.cache.is_stale() {
                                let _ = self.hydrate().await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "Catalog watch failed");
                            metrics::counter!("gantry_catalog_watch_reconnects_total").increment(1);
                            tokio::select! {
                                _ = cancel_token.cancelled() => break,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(BACKOFF_MAX);
                            resync = true;
                        }
                    }
                }
            }

            tracing::info!("Catalog watcher shutting down");
        })
    }
}
