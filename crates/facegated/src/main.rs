use anyhow::{Context, Result};
use facegate_core::{Config, FaceService};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;

use config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facegated starting");

    let daemon = DaemonConfig::from_env();
    let config = Config::load().context("failed to load configuration")?;
    let service = FaceService::from_config(&config).context("failed to initialize face service")?;
    let policy = http::PolicyInfo::from_service(&service);
    let store = service.store().clone();

    let engine = engine::spawn_engine(service, daemon.queue_depth, daemon.request_timeout)
        .context("failed to spawn engine thread")?;
    let app = http::router(http::AppState::new(engine, store, policy), daemon.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(daemon.bind)
        .await
        .with_context(|| format!("failed to bind {}", daemon.bind))?;
    tracing::info!(
        addr = %daemon.bind,
        store = %config.store_dir.display(),
        timeout_secs = daemon.request_timeout.as_secs(),
        "facegated ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("facegated shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
