//! Health monitoring for catalog backends.
//!
//! A background loop probes every registered backend at a fixed interval
//! and tracks state transitions with hysteresis. The routing engine reads
//! immutable [`HealthView`] copies; probe state never escapes this module
//! mutably.

mod config;
mod state;

pub use config::HealthConfig;
pub use state::{BackendHealth, HealthState, HealthView, ProbeState};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::{BackendEndpoint, CatalogCache};

/// Background service that probes backend endpoints.
pub struct HealthMonitor {
    catalog: Arc<CatalogCache>,
    client: reqwest::Client,
    config: HealthConfig,
    states: DashMap<String, ProbeState>,
}

impl HealthMonitor {
    /// Create a monitor with its own probe HTTP client.
    pub fn new(catalog: Arc<CatalogCache>, config: HealthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("Failed to build health probe client");

        Self {
            catalog,
            client,
            config,
            states: DashMap::new(),
        }
    }

    /// Create a monitor with a custom HTTP client (for testing).
    pub fn with_client(
        catalog: Arc<CatalogCache>,
        config: HealthConfig,
        client: reqwest::Client,
    ) -> Self {
        Self {
            catalog,
            client,
            config,
            states: DashMap::new(),
        }
    }

    /// Immutable copy of the current health map.
    pub fn view(&self) -> HealthView {
        let backends: BTreeMap<String, BackendHealth> = self
            .states
            .iter()
            .map(|entry| {
                let s = entry.value();
                (
                    entry.key().clone(),
                    BackendHealth {
                        state: s.state,
                        last_probe_at: s.last_probe_at,
                        last_error: s.last_error.clone(),
                    },
                )
            })
            .collect();
        HealthView { backends }
    }

    /// Health of a single backend; never-probed ids read as healthy.
    pub fn state(&self, backend_id: &str) -> HealthState {
        self.states
            .get(backend_id)
            .map_or(HealthState::Healthy, |s| s.state)
    }

    /// Probe one backend immediately and apply the result.
    ///
    /// Used by the admin surface's reprobe mutation.
    pub async fn force_probe(&self, backend_id: &str) -> Option<HealthState> {
        let snapshot = self.catalog.snapshot();
        let backend = snapshot.backend(backend_id).ok()?.clone();
        self.probe_and_apply(&backend).await;
        Some(self.state(backend_id))
    }

    async fn probe(&self, backend: &BackendEndpoint) -> Result<(), String> {
        let url = format!(
            "{}{}",
            backend.url.trim_end_matches('/'),
            backend.probe_path()
        );
        let start = std::time::Instant::now();

        let result = self.client.get(&url).send().await;
        let latency_seconds = start.elapsed().as_secs_f64();
        metrics::histogram!("gantry_probe_latency_seconds",
            "backend" => backend.id.clone()
        )
        .record(latency_seconds);

        match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("probe returned {}", response.status())),
            Err(e) if e.is_timeout() => Err("probe timed out".to_string()),
            Err(e) => Err(format!("probe connection failed: {e}")),
        }
    }

    async fn probe_and_apply(&self, backend: &BackendEndpoint) {
        let result = self.probe(backend).await;
        let success = result.is_ok();

        let mut state = self.states.entry(backend.id.clone()).or_default();
        if let Err(ref e) = result {
            state.last_error = Some(e.clone());
        }

        if let Some(new_state) = state.apply(success, &self.config) {
            tracing::info!(
                backend_id = %backend.id,
                state = ?new_state,
                consecutive_failures = state.consecutive_failures,
                "Backend health transition"
            );
            metrics::counter!("gantry_health_transitions_total",
                "backend" => backend.id.clone(),
                "state" => format!("{new_state:?}").to_lowercase()
            )
            .increment(1);
        }
    }

    /// Probe every backend in the current snapshot once.
    ///
    /// Also reconciles probe state against the snapshot: state for backends
    /// that left the catalog is dropped, new backends start fresh.
    pub async fn probe_all(&self) {
        let snapshot = self.catalog.snapshot();

        self.states
            .retain(|id, _| snapshot.backend(id).is_ok());

        let backends: Vec<BackendEndpoint> = snapshot.backends().cloned().collect();
        for backend in &backends {
            self.probe_and_apply(backend).await;
        }

        let view = self.view();
        let healthy = view
            .backends
            .values()
            .filter(|h| h.state == HealthState::Healthy)
            .count();
        metrics::gauge!("gantry_backends_healthy").set(healthy as f64);
        metrics::gauge!("gantry_backends_total").set(backends.len() as f64);
    }

    /// Start the probe loop. Returns a JoinHandle that resolves when stopped.
    pub fn start(self: Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.interval_seconds));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(
                interval_seconds = self.config.interval_seconds,
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::info!("Health monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.probe_all().await;
                    }
                }
            }
        })
    }
}
