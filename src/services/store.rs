//! External collaborators: user directory and notification store.
//!
//! PostgreSQL implementations live in [`crate::db`]; [`MemoryStore`] backs tests and local runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::models::{EntityId, Notification, Role, UserId};

/// Resolves a user's current role. Consulted on every role-scoped dispatch.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `None` when the user is unknown.
    async fn resolve_role(&self, user_id: UserId) -> AppResult<Option<Role>>;
}

/// Read/write access to stored notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Newest first.
    async fn notifications_for(&self, user_id: UserId) -> AppResult<Vec<Notification>>;

    /// Mark one of the user's notifications read. `None` when it does not belong to the user.
    async fn mark_read(&self, user_id: UserId, id: EntityId) -> AppResult<Option<Notification>>;
}

#[derive(Default)]
struct MemoryInner {
    roles: HashMap<UserId, Role>,
    notifications: Vec<Notification>,
}

/// In-process directory and notification store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_role(&self, user_id: UserId, role: Role) {
        self.inner.write().await.roles.insert(user_id, role);
    }

    pub async fn insert_notification(&self, notification: Notification) {
        self.inner.write().await.notifications.push(notification);
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn resolve_role(&self, user_id: UserId) -> AppResult<Option<Role>> {
        Ok(self.inner.read().await.roles.get(&user_id).copied())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn notifications_for(&self, user_id: UserId) -> AppResult<Vec<Notification>> {
        let inner = self.inner.read().await;
        let mut list: Vec<Notification> = inner
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn mark_read(&self, user_id: UserId, id: EntityId) -> AppResult<Option<Notification>> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
            .map(|n| {
                n.read = true;
                n.clone()
            }))
    }
}
