//! PostgreSQL pool shared by the user directory and notification store.

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

pub type DbPool = sqlx::PgPool;

/// Role lookups happen on every role-scoped dispatch, so a slow pool shows up as dispatch latency.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await?;
    info!(max_connections, "database pool ready");
    Ok(pool)
}
