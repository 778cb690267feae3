//! Serve command implementation: wiring and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{create_router, AppState};
use crate::audit::{SharedAuditSink, TracingAuditSink};
use crate::auth::{CredentialValidator, HttpCredentialValidator};
use crate::budget::BudgetGate;
use crate::catalog::{CatalogCache, CatalogWatcher};
use crate::cli::ServeArgs;
use crate::config::GatewayConfig;
use crate::health::HealthMonitor;
use crate::ratelimit::RateLimiter;
use crate::routing::{PinStore, RoutingEngine};
use crate::usage::{KafkaUsagePublisher, LogUsagePublisher, UsagePipeline, UsagePublisher};

/// Load configuration with CLI overrides
pub fn load_config_with_overrides(
    args: &ServeArgs,
) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let mut config = if args.config.exists() {
        GatewayConfig::load(Some(&args.config))?
    } else {
        tracing::debug!("Config file not found, using defaults");
        GatewayConfig::default()
    };

    config = config.with_env_overrides();

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ref host) = args.host {
        config.server.host = host.clone();
    }
    if let Some(ref log_level) = args.log_level {
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    cancel_token.cancel();
}

/// Main serve command handler
pub async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load, merge and validate configuration. Failures here are fatal.
    let config = load_config_with_overrides(&args)?;
    config.validate()?;

    // 2. Initialize tracing
    crate::logging::init_tracing(&config.logging)?;

    tracing::info!("Starting Gantry gateway");
    tracing::debug!(?config, "Loaded configuration");

    let config = Arc::new(config);
    let cancel_token = CancellationToken::new();
    let audit: SharedAuditSink = Arc::new(TracingAuditSink);

    // 3. Catalog cache: hydrate (live, then disk), then watch.
    let catalog = Arc::new(CatalogCache::new(Duration::from_secs(
        config.control_plane.max_staleness_seconds,
    )));
    let watcher = CatalogWatcher::new(Arc::clone(&catalog), config.control_plane.clone());
    if let Err(e) = watcher.hydrate().await {
        tracing::warn!(
            error = %e,
            "Catalog hydration failed entirely; serving resumes once the watch recovers"
        );
    }
    let watcher_handle = watcher.start(cancel_token.clone());

    // 4. Credential validator, wired to revocations on the watch channel.
    let validator = Arc::new(HttpCredentialValidator::new(&config.auth));
    {
        let validator = Arc::clone(&validator);
        catalog.subscribe(Box::new(move |snapshot| {
            for key_id in snapshot.revoked_keys() {
                validator.invalidate_key(key_id);
            }
        }));
    }

    // 5. Rate limiter against the shared store.
    let limiter = Arc::new(RateLimiter::from_config(
        config.rate_limit.clone(),
        Arc::clone(&audit),
    )?);

    // 6. Budget gate.
    let budget = Arc::new(BudgetGate::new(config.budget.clone()));

    // 7. Health monitor.
    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&catalog),
        config.health.clone(),
    ));
    let health_handle = if config.health.enabled {
        tracing::info!("Starting health monitor");
        Some(Arc::clone(&health).start(cancel_token.clone()))
    } else {
        tracing::info!("Health monitoring disabled");
        None
    };

    // 8. Usage pipeline. An unreadable spool is a fatal startup error.
    let publisher: Arc<dyn UsagePublisher> = if config.usage.bus_brokers.is_empty() {
        tracing::info!("No usage bus configured; records go to the structured log");
        Arc::new(LogUsagePublisher)
    } else {
        tracing::info!(
            brokers = %config.usage.bus_brokers,
            topic = %config.usage.bus_topic,
            "Publishing usage records to the bus"
        );
        Arc::new(KafkaUsagePublisher::new(
            &config.usage.bus_brokers,
            &config.usage.bus_topic,
        )?)
    };
    let (usage, usage_worker) = UsagePipeline::new(&config.usage, publisher)?;
    let usage_handle = usage_worker.start(cancel_token.clone());

    // 9. Routing engine.
    let router = Arc::new(RoutingEngine::new(Arc::new(PinStore::new())));

    // 10. Application state and handler trees.
    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        Arc::clone(&catalog),
        Arc::clone(&health),
        validator as Arc<dyn CredentialValidator>,
        limiter,
        budget,
        router,
        usage,
        audit,
    ));
    let app = create_router(Arc::clone(&state));

    // 11. Bind listeners.
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Gantry ingress listening");

    let api_cancel = cancel_token.clone();
    let api_server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
    });

    let admin_server = if config.admin.enabled {
        let admin_addr = format!("{}:{}", config.admin.host, config.admin.port);
        let admin_listener = tokio::net::TcpListener::bind(&admin_addr).await?;
        tracing::info!(addr = %admin_addr, "Gantry admin listening");

        let admin_app = crate::admin::create_router(Arc::clone(&state));
        let admin_cancel = cancel_token.clone();
        Some(tokio::spawn(async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move { admin_cancel.cancelled().await })
                .await
        }))
    } else {
        None
    };

    // 12. Run until a signal arrives.
    shutdown_signal(cancel_token.clone()).await;

    // 13. Drain in-flight requests, bounded.
    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    if tokio::time::timeout(grace, api_server).await.is_err() {
        tracing::warn!(grace_seconds = grace.as_secs(), "Ingress drain exceeded grace period");
    }
    if let Some(admin) = admin_server {
        let _ = tokio::time::timeout(grace, admin).await;
    }

    // 14. Stop background loops; the usage worker flushes on its way out.
    if let Some(handle) = health_handle {
        tracing::info!("Waiting for health monitor to stop");
        handle.await?;
    }
    tracing::info!("Waiting for catalog watcher to stop");
    watcher_handle.await?;
    tracing::info!("Waiting for usage worker to flush");
    usage_handle.await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
