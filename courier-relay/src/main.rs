//! courier-relay binary entry point.
//!
//! Usage:
//! ```bash
//! courier-relay --config courier.toml
//! ```

use anyhow::Context;
use courier_relay::cleanup::spawn_cleanup_task;
use courier_relay::config::Config;
use courier_relay::http;
use courier_relay::hub::Hub;
use courier_relay::storage::SqliteStorage;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = get_config_path();
    let config = if config_path.exists() {
        Config::from_file(&config_path).context("loading configuration")?
    } else {
        tracing::info!("no config file at {:?}, using defaults", config_path);
        Config::default()
    };

    let storage = SqliteStorage::new(&config.storage.database)
        .await
        .context("opening database")?;

    let bind_address = config.server.bind_address.clone();
    let cleanup_config = config.cleanup.clone();
    let (hub, hub_task) = Hub::start(config, storage);

    http::health::init_start_time();
    let cleanup = spawn_cleanup_task(
        hub.storage_arc(),
        hub.rate_limits().clone(),
        cleanup_config,
    );

    let app = http::build_router(hub.clone());
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!(
        "courier-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        bind_address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    cleanup.abort();
    hub.stop().await;
    hub_task.await.context("joining hub task")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("courier.toml"))
}
