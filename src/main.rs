//! Entry point: load config, wire dependencies, and run the server.

use notif_sync::config::Config;
use notif_sync::db::{self, PgStore};
use notif_sync::services::{ConnectionRegistry, DispatchRouter, HeartbeatMonitor};
use notif_sync::{create_app, AppState};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    let store = Arc::new(PgStore::new(db_pool));

    let registry = ConnectionRegistry::new();
    let router = DispatchRouter::new(registry.clone(), store.clone());
    HeartbeatMonitor::new(
        registry.clone(),
        config.heartbeat_interval,
        config.heartbeat_missed_limit,
    )
    .spawn();

    let state = AppState {
        app_key: config.app_key.clone(),
        registry,
        router,
        store,
        send_buffer: config.send_buffer,
    };

    let app = create_app(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!(
        addr = %config.server_addr,
        heartbeat_timeout_secs = config.heartbeat_timeout().as_secs(),
        "listening"
    );
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
