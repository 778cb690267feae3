//! # Metrics Collection Module
//!
//! Prometheus exposition for the gateway.
//!
//! **Counters:**
//! - `gantry_requests_total{org, outcome}` - Terminal request outcomes
//! - `gantry_ratelimit_denials_total{org}` - Rate-limit denials
//! - `gantry_ratelimit_degraded_transitions_total{mode}` - Store mode flips
//! - `gantry_budget_lookup_errors_total` / `gantry_budget_fail_open_total`
//! - `gantry_usage_published_total` / `gantry_usage_spool_dropped_total`
//! - `gantry_catalog_watch_reconnects_total` - Watch stream gaps
//! - `gantry_audit_events_total{action}` - Audit emissions
//!
//! **Histograms:**
//! - `gantry_request_duration_seconds{outcome}` - End-to-end latency
//! - `gantry_upstream_latency_seconds{backend}` - Forward latency
//! - `gantry_probe_latency_seconds{backend}` - Health probe latency
//!
//! **Gauges:**
//! - `gantry_catalog_version` / `gantry_catalog_backends`
//! - `gantry_backends_healthy` / `gantry_backends_total`
//! - `gantry_usage_spool_depth`

pub mod handler;

// Re-export PrometheusBuilder for test compatibility
pub use metrics_exporter_prometheus::PrometheusBuilder;

use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder with bucket layouts tuned for gateway
/// latencies. Safe to call once per process; callers fall back to a local
/// handle when a recorder is already installed (tests).
pub fn setup_metrics() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    use metrics_exporter_prometheus::Matcher;

    let duration_buckets = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gantry_request_duration_seconds".to_string()),
            duration_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full("gantry_upstream_latency_seconds".to_string()),
            duration_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full("gantry_probe_latency_seconds".to_string()),
            duration_buckets,
        )?
        .install_recorder()?;

    Ok(handle)
}

/// Install-or-fallback helper shared by server wiring and tests.
pub fn recorder_handle() -> PrometheusHandle {
    setup_metrics().unwrap_or_else(|e| {
        tracing::debug!("Metrics already initialized, creating local handle: {}", e);
        PrometheusBuilder::new().build_recorder().handle()
    })
}
