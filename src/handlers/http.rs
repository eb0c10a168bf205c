//! HTTP handlers: producer dispatch, connection listing, and health.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use validator::{Validate, ValidationError};

use crate::error::AppError;
use crate::middleware::AppKey;
use crate::models::{Audience, Envelope, EnvelopeType};
use crate::services::{ConnectionRegistry, DispatchRouter, NotificationStore};

/// Shared application state for HTTP and WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub app_key: String,
    pub registry: ConnectionRegistry,
    pub router: DispatchRouter,
    pub store: Arc<dyn NotificationStore>,
    /// Per-connection outbound queue capacity.
    pub send_buffer: usize,
}

impl AppState {
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
    pub fn router(&self) -> &DispatchRouter {
        &self.router
    }
    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }
}

/// Body of `POST /api/dispatch`.
#[derive(Debug, Deserialize, Validate)]
pub struct DispatchRequest {
    pub envelope: Envelope,
    #[validate(custom(function = "validate_audience"))]
    pub audience: Audience,
}

fn validate_audience(audience: &Audience) -> Result<(), ValidationError> {
    match audience {
        Audience::SingleUser { user_id } if *user_id <= 0 => {
            Err(ValidationError::new("user_id_not_positive"))
        }
        _ => Ok(()),
    }
}

/// POST /api/dispatch: deliver an envelope to an audience.
/// Requires header: x-app-key: <app_key>.
pub async fn dispatch(
    State(state): State<AppState>,
    _key: AppKey,
    Json(body): Json<DispatchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    body.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;
    body.envelope.validate()?;
    if body.envelope.kind.is_control() || body.envelope.kind == EnvelopeType::Unknown {
        return Err(AppError::Validation(format!(
            "{:?} envelopes cannot be dispatched",
            body.envelope.kind
        )));
    }

    let report = state.router().dispatch(&body.envelope, &body.audience).await;
    info!(
        kind = ?body.envelope.kind,
        audience = ?body.audience,
        delivered = report.delivered,
        failed = report.failed,
        "dispatched"
    );

    Ok(Json(json!({
        "ok": true,
        "delivered": report.delivered,
        "failed": report.failed
    })))
}

/// GET /api/connections: live connections, oldest first.
pub async fn list_connections(
    State(state): State<AppState>,
    _key: AppKey,
) -> Json<serde_json::Value> {
    let connections = state.registry().list().await;
    Json(json!({ "count": connections.len(), "connections": connections }))
}

/// GET /health: liveness probe.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let connections = state.registry().connection_count().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "notif-sync",
            "connections": connections
        })),
    )
}
