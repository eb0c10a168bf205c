//! WebSocket handler: handshake, registration, heartbeat replies, and inbound envelopes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::models::{Audience, EntityId, Envelope, EnvelopeType, UserId};
use crate::services::registry::{ConnectionHandle, ConnectionId};

#[derive(Debug, Deserialize)]
pub struct HandshakeParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// Upgrade HTTP to WebSocket. Rejects the handshake unless `userId` is a positive integer.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let user_id = parse_user_id(params.user_id.as_deref())?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, user_id)))
}

pub(crate) fn parse_user_id(raw: Option<&str>) -> Result<UserId, AppError> {
    let raw = raw.ok_or_else(|| AppError::Validation("userId query parameter required".to_string()))?;
    match raw.trim().parse::<UserId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(AppError::Validation("Invalid user ID".to_string())),
    }
}

async fn handle_socket(state: AppState, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut rx) = ConnectionHandle::channel(state.send_buffer);
    let connection_id = state.registry().register(user_id, handle.clone()).await;
    info!(user_id, connection_id = %connection_id, "ws connected");

    let writer = handle.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer.closed() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let read_loop = async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    on_text(&state, connection_id, user_id, &handle, &text).await;
                }
                Message::Ping(_) => {
                    state.registry().touch(connection_id).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = read_loop => {}
        _ = &mut send_task => {}
    }

    state.registry().unregister(connection_id).await;
    send_task.abort();
    info!(user_id, connection_id = %connection_id, "ws disconnected");
}

async fn on_text(
    state: &AppState,
    connection_id: ConnectionId,
    user_id: UserId,
    handle: &ConnectionHandle,
    text: &str,
) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "dropping malformed frame");
            return;
        }
    };

    match envelope.kind {
        EnvelopeType::Ping => {
            state.registry().touch(connection_id).await;
            reply(handle, connection_id, &Envelope::pong());
        }
        EnvelopeType::Init => match state.store().notifications_for(user_id).await {
            Ok(notifications) => {
                let init = Envelope::new(
                    EnvelopeType::Init,
                    json!({ "notifications": notifications }),
                );
                reply(handle, connection_id, &init);
            }
            Err(e) => warn!(user_id, error = %e, "failed to load notifications for init"),
        },
        EnvelopeType::NotificationRead => match envelope.related_entity_id {
            Some(id) => mark_read(state, user_id, id).await,
            None => debug!(connection_id = %connection_id, "notification-read without id"),
        },
        other => debug!(connection_id = %connection_id, kind = ?other, "ignoring client envelope"),
    }
}

/// Mark a notification read, then tell every device of the user once the write committed.
async fn mark_read(state: &AppState, user_id: UserId, notification_id: EntityId) {
    let notification = match state.store().mark_read(user_id, notification_id).await {
        Ok(Some(notification)) => notification,
        Ok(None) => {
            debug!(user_id, notification_id, "notification-read for foreign or missing notification");
            return;
        }
        Err(e) => {
            warn!(user_id, notification_id, error = %e, "failed to mark notification read");
            return;
        }
    };

    let mut envelope = Envelope::new(
        EnvelopeType::NotificationRead,
        json!({ "id": notification.id }),
    )
    .with_origin(user_id);
    if let Some((entity_type, entity_id)) = notification.related_collection() {
        envelope = envelope.with_related(entity_type, entity_id);
    }
    state
        .router()
        .dispatch(&envelope, &Audience::single_user(user_id))
        .await;
}

fn reply(handle: &ConnectionHandle, connection_id: ConnectionId, envelope: &Envelope) {
    let frame: Arc<str> = match envelope.to_frame() {
        Ok(frame) => frame.into(),
        Err(e) => {
            warn!(error = %e, "failed to encode reply");
            return;
        }
    };
    if let Err(e) = handle.send(frame) {
        debug!(connection_id = %connection_id, error = %e, "reply dropped");
    }
}
