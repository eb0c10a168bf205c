//! Headless sync client: connects as `SYNC_USER_ID` and logs every state change, inbound
//! envelope and cache invalidation. Useful for watching what a browser tab would refetch.

use notif_sync::client::{CacheKey, QueryCache, SyncClient, WsConnector};
use notif_sync::config::ClientConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LoggingCache;

impl QueryCache for LoggingCache {
    fn invalidate(&self, key: &CacheKey) {
        tracing::info!(key = %key, "invalidate");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ClientConfig::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let connector = Arc::new(WsConnector::new(&config.server_url, config.user_id));
    tracing::info!(url = %connector.url(), "starting sync client");
    let handle = SyncClient::spawn(config, connector, Arc::new(LoggingCache));

    let mut states = handle.state();
    let mut envelopes = handle.envelopes();
    loop {
        tokio::select! {
            received = envelopes.recv() => match received {
                Ok(envelope) => tracing::info!(
                    kind = ?envelope.kind,
                    payload = %envelope.payload,
                    "envelope"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "envelope log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!(?state, "connection state");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
