//! Dispatch router: resolve an audience to live connections and fan the envelope out.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{Audience, Envelope};
use crate::services::registry::{ConnectionId, ConnectionRegistry};
use crate::services::store::UserDirectory;

/// Outcome of one dispatch. Failed recipients have already been unregistered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers envelopes to single users, role scopes, or everyone.
#[derive(Clone)]
pub struct DispatchRouter {
    registry: ConnectionRegistry,
    directory: Arc<dyn UserDirectory>,
}

impl DispatchRouter {
    pub fn new(registry: ConnectionRegistry, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            registry,
            directory,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Push `envelope` to every live connection in `audience`.
    ///
    /// A failed send unregisters that connection and the rest still receive the frame.
    /// Never errors: an audience with no live connections is simply a no-op.
    pub async fn dispatch(&self, envelope: &Envelope, audience: &Audience) -> DispatchReport {
        let frame: Arc<str> = match envelope.to_frame() {
            Ok(frame) => frame.into(),
            Err(e) => {
                warn!(kind = ?envelope.kind, error = %e, "failed to encode envelope");
                return DispatchReport::default();
            }
        };

        let targets = self.resolve(audience).await;
        let handles = self.registry.handles(&targets).await;

        let mut report = DispatchReport::default();
        for (id, handle) in handles {
            match handle.send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "send failed, dropping connection");
                    self.registry.unregister(id).await;
                    report.failed += 1;
                }
            }
        }

        info!(
            kind = ?envelope.kind,
            audience = ?audience,
            delivered = report.delivered,
            failed = report.failed,
            "dispatch"
        );
        report
    }

    async fn resolve(&self, audience: &Audience) -> Vec<ConnectionId> {
        match audience {
            Audience::SingleUser { user_id } => {
                self.registry.connections_for(*user_id).await.into_iter().collect()
            }
            Audience::BroadcastAll => self.registry.all_connections().await,
            Audience::RoleScope { role } => {
                // Roles are looked up per dispatch so a role change applies immediately.
                let mut ids = Vec::new();
                for user_id in self.registry.connected_users().await {
                    match self.directory.resolve_role(user_id).await {
                        Ok(Some(r)) if r == *role => {
                            ids.extend(self.registry.connections_for(user_id).await);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(user_id, error = %e, "role lookup failed, skipping user");
                        }
                    }
                }
                debug!(role = ?role, recipients = ids.len(), "resolved role scope");
                ids
            }
        }
    }
}
