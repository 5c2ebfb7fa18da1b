//! GKE consumption exporter
//!
//! Periodically attributes per-container CPU and memory usage to node
//! capacity and streams the resulting usage records to BigQuery.

use anyhow::{Context, Result};
use consumption_lib::{
    auth::{MetadataTokenSource, StaticTokenSource, TokenSource},
    cluster::{ClusterClientCache, GkeClusterResolver},
    health::{components, HealthRegistry},
    observability::{ExporterMetrics, StructuredLogger},
    pipeline::{AttributionScheduler, ExportCycleBuilder},
    sink::{AnalyticsSink, BigQuerySink},
    store::NodeCapacityStore,
    telemetry::MonitoringClient,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting consumption-exporter");

    let config = config::ExporterConfig::load()?;
    info!(project_id = %config.project_id, "Exporter configured");

    // Two missed cycles in a row mark the scheduler degraded
    let health_registry = HealthRegistry::new().with_stale_after(config.export_interval() * 2);

    let metrics = ExporterMetrics::new();
    let logger = StructuredLogger::new(&config.project_id);

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let tokens: Arc<dyn TokenSource> = match StaticTokenSource::from_env() {
        Some(source) => {
            info!("Using access token from environment");
            Arc::new(source)
        }
        None => Arc::new(MetadataTokenSource::new(http.clone())),
    };
    // Credentials are a startup requirement
    tokens
        .token()
        .await
        .context("Unable to obtain an access token")?;

    let telemetry = Arc::new(MonitoringClient::new(http.clone(), tokens.clone()));
    let clusters = Arc::new(ClusterClientCache::new(Arc::new(GkeClusterResolver::new(
        http.clone(),
        tokens.clone(),
        config.request_timeout(),
    ))));
    let nodes = Arc::new(
        NodeCapacityStore::open(&config.node_cache_path, config.node_cache_ttl())
            .context("Failed to open node capacity cache")?,
    );
    let sink = Arc::new(BigQuerySink::new(http, tokens, config.table()));

    let table = sink
        .ensure_table()
        .await
        .context("Unable to prepare the consumption table")?;
    logger.log_startup(EXPORTER_VERSION, &table.to_string(), config.export_interval_secs);

    let cycle = ExportCycleBuilder::new()
        .project_id(config.project_id.clone())
        .telemetry(telemetry)
        .clusters(clusters)
        .nodes(nodes)
        .sink(sink)
        .config(config.export_config())
        .health(health_registry.clone())
        .build()?;

    let scheduler = AttributionScheduler::new(
        Arc::new(cycle),
        config.export_interval(),
        health_registry.clone(),
    );

    let shutdown = CancellationToken::new();
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    scheduler.start().await?;
    health_registry.set_ready(true).await;

    let reason = wait_for_signal().await?;
    logger.log_shutdown(reason);

    health_registry.set_ready(false).await;
    scheduler.stop().await;
    health_registry
        .set_unhealthy(components::SCHEDULER, "Shutting down")
        .await;

    shutdown.cancel();
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok("ctrl-c received")
}
