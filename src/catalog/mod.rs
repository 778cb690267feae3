//! Catalog cache: local durable snapshot of routing policies and backends.
//!
//! The cache owns one copy-on-write [`Snapshot`] pointer. The watch loop
//! builds a fresh immutable snapshot for every catalog update and swaps the
//! pointer under a single write lock; request handlers clone the `Arc` once
//! at pipeline entry and never observe a partial update.

mod error;
mod snapshot;
mod store;
mod watch;

pub use error::CatalogError;
pub use snapshot::{
    BackendEndpoint, BackendLabels, CatalogDocument, LimitOverride, RoutingPolicy, Snapshot,
    WILDCARD_ORG,
};
pub use store::SnapshotStore;
pub use watch::CatalogWatcher;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Observer invoked synchronously after each snapshot swap.
pub type SnapshotObserver = Box<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

/// Shared catalog cache with last-known-good fallback semantics.
pub struct CatalogCache {
    current: RwLock<Arc<Snapshot>>,
    observers: Mutex<Vec<SnapshotObserver>>,
    /// Set when serving a disk snapshot that predates this process
    stale: AtomicBool,
    max_staleness: Duration,
}

impl CatalogCache {
    /// Create a cache holding an empty snapshot (not yet hydrated).
    pub fn new(max_staleness: Duration) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
            observers: Mutex::new(Vec::new()),
            stale: AtomicBool::new(true),
            max_staleness,
        }
    }

    /// Current snapshot; cheap `Arc` clone.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    /// Current snapshot version.
    pub fn version(&self) -> i64 {
        self.current.read().version()
    }

    /// Whether the snapshot was installed from a live config service read.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Readiness check: a snapshot is fresh while it is younger than the
    /// staleness bound and carries at least one backend.
    pub fn is_fresh(&self) -> bool {
        let snap = self.snapshot();
        if snap.backend_count() == 0 {
            return false;
        }
        let age = Utc::now().signed_duration_since(snap.fetched_at());
        age.to_std().map_or(false, |age| age <= self.max_staleness)
    }

    /// Register an observer for snapshot swaps.
    pub fn subscribe(&self, observer: SnapshotObserver) {
        self.observers.lock().push(observer);
    }

    /// Validate, build and atomically publish a new snapshot.
    ///
    /// `from_disk` marks the snapshot stale (restart fallback); a live
    /// install clears the flag. Observers run synchronously before return.
    pub fn install(&self, doc: CatalogDocument, from_disk: bool) -> Result<(), CatalogError> {
        let snap = Arc::new(Snapshot::from_document(doc, Utc::now())?);

        {
            let mut current = self.current.write();
            *current = Arc::clone(&snap);
        }
        self.stale.store(from_disk, Ordering::Relaxed);

        metrics::gauge!("gantry_catalog_version").set(snap.version() as f64);
        metrics::gauge!("gantry_catalog_backends").set(snap.backend_count() as f64);

        for observer in self.observers.lock().iter() {
            observer(&snap);
        }

        tracing::info!(
            version = snap.version(),
            backends = snap.backend_count(),
            policies = snap.policy_count(),
            from_disk,
            "Catalog snapshot installed"
        );

        Ok(())
    }
}
