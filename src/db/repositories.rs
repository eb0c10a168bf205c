//! Repositories: user roles and notifications in the external PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::AppResult;
use crate::models::{EntityId, Notification, Role, UserId};
use crate::services::store::{NotificationStore, UserDirectory};

use super::DbPool;

// ---- Notification ----

#[derive(Debug, FromRow)]
struct NotificationRow {
    id: i64,
    kind: String,
    title: String,
    content: String,
    user_id: i64,
    read: bool,
    related_id: Option<i64>,
    related_type: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id,
            kind: row.kind,
            title: row.title,
            content: row.content,
            user_id: row.user_id,
            read: row.read,
            related_id: row.related_id,
            related_type: row.related_type,
            created_at: row.created_at,
        }
    }
}

const NOTIFICATION_COLUMNS: &str = r#"
    id::int8 AS id,
    type::text AS kind,
    title,
    content,
    user_id::int8 AS user_id,
    read,
    related_id::int8 AS related_id,
    related_type,
    created_at AT TIME ZONE 'UTC' AS created_at
"#;

/// PostgreSQL-backed user directory and notification store.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn resolve_role(&self, user_id: UserId) -> AppResult<Option<Role>> {
        let role: Option<String> = sqlx::query_scalar("SELECT role::text FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role.and_then(|r| r.parse().ok()))
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn notifications_for(&self, user_id: UserId) -> AppResult<Vec<Notification>> {
        let sql = format!(
            "SELECT {} FROM notifications WHERE user_id = $1 ORDER BY created_at DESC",
            NOTIFICATION_COLUMNS
        );
        let rows = sqlx::query_as::<_, NotificationRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn mark_read(&self, user_id: UserId, id: EntityId) -> AppResult<Option<Notification>> {
        let sql = format!(
            "UPDATE notifications SET read = true WHERE id = $1 AND user_id = $2 RETURNING {}",
            NOTIFICATION_COLUMNS
        );
        let row = sqlx::query_as::<_, NotificationRow>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Notification::from))
    }
}
