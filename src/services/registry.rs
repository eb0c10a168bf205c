//! Connection registry: the single source of truth for which transports are live.
//!
//! Maps user identity to any number of open connections (one per device or tab).
//! All mutation happens behind one lock; nothing awaits while holding it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::UserId;

/// Opaque id of one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// Lifecycle of a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Why a frame could not be queued on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    #[error("send buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Write side of one transport: a bounded frame queue drained by the socket writer task.
///
/// Clones share the same queue and state. Only the registry closes it.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Arc<str>>,
    state: Arc<AtomicU8>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end for the writer task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            tx,
            state: Arc::new(AtomicU8::new(STATE_OPEN)),
            shutdown: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Queue a frame without waiting. Fails when the buffer is full or the transport is gone.
    pub fn send(&self, frame: Arc<str>) -> Result<(), SendFailure> {
        if self.state() != ConnectionState::Open {
            return Err(SendFailure::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Resolves once the registry has closed this handle. The writer task selects on it.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Returns true only for the call that actually performed the close.
    fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shutdown.cancel();
        self.state.store(STATE_CLOSED, Ordering::Release);
        true
    }
}

struct Entry {
    user_id: UserId,
    handle: ConnectionHandle,
    last_heartbeat_at: Instant,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Summary of a live connection, for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
}

/// Lock-guarded user → connections map. Cheap to clone; clones share the map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user_id`. Never rejects.
    pub async fn register(&self, user_id: UserId, handle: ConnectionHandle) -> ConnectionId {
        let id = ConnectionId::generate();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            Entry {
                user_id,
                handle,
                last_heartbeat_at: Instant::now(),
                connected_at: Utc::now(),
            },
        );
        inner.by_user.entry(user_id).or_default().insert(id);
        let devices = inner.by_user.get(&user_id).map_or(0, HashSet::len);
        drop(inner);
        info!(user_id, connection_id = %id, devices, "connection registered");
        id
    }

    /// Remove and close a connection. Calling it again for the same id is a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            let entry = inner.connections.remove(&id);
            if let Some(entry) = &entry {
                if let Some(ids) = inner.by_user.get_mut(&entry.user_id) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        inner.by_user.remove(&entry.user_id);
                    }
                }
            }
            entry
        };
        match removed {
            Some(entry) => {
                entry.handle.close();
                info!(user_id = entry.user_id, connection_id = %id, "connection unregistered");
                true
            }
            None => {
                debug!(connection_id = %id, "unregister for unknown connection ignored");
                false
            }
        }
    }

    /// Live connections of one user; empty for unknown users.
    pub async fn connections_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        let inner = self.inner.read().await;
        inner.by_user.get(&user_id).cloned().unwrap_or_default()
    }

    /// Users with at least one live connection.
    pub async fn connected_users(&self) -> Vec<UserId> {
        let inner = self.inner.read().await;
        inner.by_user.keys().copied().collect()
    }

    pub async fn all_connections(&self) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner.connections.keys().copied().collect()
    }

    /// Snapshot the handles for `ids`, skipping any that are no longer registered.
    pub async fn handles(&self, ids: &[ConnectionId]) -> Vec<(ConnectionId, ConnectionHandle)> {
        let inner = self.inner.read().await;
        ids.iter()
            .filter_map(|id| inner.connections.get(id).map(|e| (*id, e.handle.clone())))
            .collect()
    }

    /// Record a liveness signal. Returns false if the connection is gone.
    pub async fn touch(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(&id) {
            Some(entry) => {
                entry.last_heartbeat_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Connections whose last liveness signal is older than `timeout` at `now`.
    pub async fn stale_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .connections
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_heartbeat_at) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let inner = self.inner.read().await;
        let mut infos: Vec<ConnectionInfo> = inner
            .connections
            .iter()
            .map(|(id, e)| ConnectionInfo {
                connection_id: *id,
                user_id: e.user_id,
                connected_at: e.connected_at,
            })
            .collect();
        infos.sort_by_key(|i| i.connected_at);
        infos
    }
}
