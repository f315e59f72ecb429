//! Server binary
//!
//! Loads configuration, wires the engine, installs the Prometheus
//! recorder, and serves the HTTP surface until ctrl-c.

use std::sync::Arc;

use dealership_agent::Engine;
use dealership_config::Settings;
use dealership_core::InMemoryKvStore;
use dealership_server::{create_router, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load()?;
    let bind = format!("{}:{}", settings.server.host, settings.server.port);

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let kv = Arc::new(InMemoryKvStore::new());
    let engine = Arc::new(Engine::new(settings, kv)?);
    if let Err(e) = engine.initialize().await {
        tracing::warn!(error = %e, "store preparation failed, engine starts degraded");
    }

    let router = create_router(AppState::new(engine.clone(), prometheus));
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(addr = %bind, "dealership rag server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(engine))
        .await?;

    Ok(())
}

async fn shutdown_signal(engine: Arc<Engine>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining background tasks");
    engine.shutdown();
}
