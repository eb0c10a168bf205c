//! Integration tests: health, dispatch auth, and the WebSocket protocol over a real socket.
//!
//! Everything runs against [`MemoryStore`], so no database is required.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use notif_sync::client::{CacheKey, QueryCache, SyncClient, WsConnector};
use notif_sync::config::ClientConfig;
use notif_sync::models::{Envelope, EnvelopeType, Notification, RelatedEntityType, Role};
use notif_sync::services::{ConnectionRegistry, DispatchRouter, HeartbeatMonitor, MemoryStore};
use notif_sync::{create_app, AppState};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::util::ServiceExt;

const APP_KEY: &str = "test-key";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_state(store: &MemoryStore) -> AppState {
    let registry = ConnectionRegistry::new();
    let store = Arc::new(store.clone());
    AppState {
        app_key: APP_KEY.to_string(),
        router: DispatchRouter::new(registry.clone(), store.clone()),
        registry,
        store,
        send_buffer: 16,
    }
}

async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, user_id: i64) -> Socket {
    let url = format!("ws://{}/ws?userId={}", addr, user_id);
    let (mut socket, _) = connect_async(url).await.unwrap();
    // The pong proves the server registered this connection.
    send(&mut socket, &Envelope::ping()).await;
    assert_eq!(next_envelope(&mut socket).await.kind, EnvelopeType::Pong);
    socket
}

async fn send(socket: &mut Socket, envelope: &Envelope) {
    socket
        .send(Message::Text(envelope.to_frame().unwrap()))
        .await
        .unwrap();
}

async fn next_envelope(socket: &mut Socket) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return Envelope::parse(&text).unwrap();
        }
    }
}

async fn post_dispatch(
    app: &axum::Router,
    key: Option<&str>,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let mut req = Request::builder()
        .method("POST")
        .uri("/api/dispatch")
        .header("content-type", "application/json");
    if let Some(key) = key {
        req = req.header("x-app-key", key);
    }
    let res = app
        .clone()
        .oneshot(req.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

fn notification(id: i64, user_id: i64, related: Option<(&str, i64)>) -> Notification {
    Notification {
        id,
        kind: "activity".to_string(),
        title: "Nova atividade".to_string(),
        content: "Visita agendada".to_string(),
        user_id,
        read: false,
        related_id: related.map(|(_, id)| id),
        related_type: related.map(|(t, _)| t.to_string()),
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn health_returns_ok() {
    let app = create_app(test_state(&MemoryStore::new()));
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json.get("status").and_then(|v| v.as_str()), Some("ok"));
    assert_eq!(json.get("connections").and_then(|v| v.as_u64()), Some(0));
}

#[tokio::test]
async fn dispatch_requires_app_key() {
    let app = create_app(test_state(&MemoryStore::new()));
    let body = json!({
        "envelope": { "type": "notification", "payload": { "title": "x" } },
        "audience": { "kind": "singleUser", "userId": 42 }
    });

    let (status, _) = post_dispatch(&app, None, body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "dispatch without key should be 401");

    let (status, _) = post_dispatch(&app, Some("wrong"), body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, json) = post_dispatch(&app, Some(APP_KEY), body).await;
    assert_eq!(status, StatusCode::OK, "dispatch with valid app_key should succeed");
    assert_eq!(json["delivered"], 0);
    assert_eq!(json["failed"], 0);
}

#[tokio::test]
async fn dispatch_rejects_control_envelopes_and_bad_audiences() {
    let app = create_app(test_state(&MemoryStore::new()));

    let (status, _) = post_dispatch(
        &app,
        Some(APP_KEY),
        json!({ "envelope": { "type": "ping" }, "audience": { "kind": "broadcastAll" } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_dispatch(
        &app,
        Some(APP_KEY),
        json!({
            "envelope": { "type": "notification" },
            "audience": { "kind": "singleUser", "userId": -1 }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_dispatch(
        &app,
        Some(APP_KEY),
        json!({
            "envelope": { "type": "deal-changed", "relatedEntityType": "deal" },
            "audience": { "kind": "broadcastAll" }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn handshake_without_valid_user_id_is_rejected() {
    let addr = serve(create_app(test_state(&MemoryStore::new()))).await;
    assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
    assert!(connect_async(format!("ws://{}/ws?userId=abc", addr)).await.is_err());
}

#[tokio::test]
async fn dispatch_reaches_every_device_of_the_user_only() {
    let store = MemoryStore::new();
    let app = create_app(test_state(&store));
    let addr = serve(app.clone()).await;

    let mut laptop = connect(addr, 42).await;
    let mut phone = connect(addr, 42).await;
    let mut other = connect(addr, 7).await;

    let (status, json) = post_dispatch(
        &app,
        Some(APP_KEY),
        json!({
            "envelope": { "type": "notification", "payload": { "title": "Novo negócio" } },
            "audience": { "kind": "singleUser", "userId": 42 }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["delivered"], 2);

    for socket in [&mut laptop, &mut phone] {
        let env = next_envelope(socket).await;
        assert_eq!(env.kind, EnvelopeType::Notification);
        assert_eq!(env.payload["title"], "Novo negócio");
    }

    // User 7 saw nothing: its next frame is the reply to this ping.
    send(&mut other, &Envelope::ping()).await;
    assert_eq!(next_envelope(&mut other).await.kind, EnvelopeType::Pong);
}

#[tokio::test]
async fn role_scope_follows_directory() {
    let store = MemoryStore::new();
    store.set_role(1, Role::Manager).await;
    store.set_role(2, Role::Broker).await;
    let app = create_app(test_state(&store));
    let addr = serve(app.clone()).await;

    let mut manager = connect(addr, 1).await;
    let _broker = connect(addr, 2).await;

    let body = json!({
        "envelope": { "type": "deal-changed", "relatedEntityType": "deal", "relatedEntityId": 3 },
        "audience": { "kind": "roleScope", "role": "manager" }
    });
    let (_, json) = post_dispatch(&app, Some(APP_KEY), body.clone()).await;
    assert_eq!(json["delivered"], 1);
    assert_eq!(next_envelope(&mut manager).await.kind, EnvelopeType::DealChanged);

    store.set_role(2, Role::Manager).await;
    let (_, json) = post_dispatch(&app, Some(APP_KEY), body).await;
    assert_eq!(json["delivered"], 2);
}

#[tokio::test]
async fn init_returns_stored_notifications() {
    let store = MemoryStore::new();
    store.insert_notification(notification(1, 42, None)).await;
    store.insert_notification(notification(2, 7, None)).await;
    let addr = serve(create_app(test_state(&store))).await;

    let mut socket = connect(addr, 42).await;
    send(&mut socket, &Envelope::init_request()).await;
    let env = next_envelope(&mut socket).await;
    assert_eq!(env.kind, EnvelopeType::Init);
    let list = env.payload["notifications"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], 1);
    assert_eq!(list[0]["userId"], 42);
}

#[tokio::test]
async fn notification_read_syncs_all_devices() {
    let store = MemoryStore::new();
    store
        .insert_notification(notification(10, 42, Some(("activity", 5))))
        .await;
    let addr = serve(create_app(test_state(&store))).await;

    let mut laptop = connect(addr, 42).await;
    let mut phone = connect(addr, 42).await;

    let read = Envelope::new(EnvelopeType::NotificationRead, serde_json::Value::Null)
        .with_related(RelatedEntityType::Notification, 10);
    send(&mut laptop, &read).await;

    for socket in [&mut laptop, &mut phone] {
        let env = next_envelope(socket).await;
        assert_eq!(env.kind, EnvelopeType::NotificationRead);
        assert_eq!(env.payload["id"], 10);
        assert_eq!(env.related_entity_type, Some(RelatedEntityType::Activity));
        assert_eq!(env.related_entity_id, Some(5));
        assert_eq!(env.origin_user_id, Some(42));
    }

    use notif_sync::services::NotificationStore;
    let stored = store.notifications_for(42).await.unwrap();
    assert!(stored[0].read);
}

#[tokio::test]
async fn notification_read_of_foreign_notification_is_ignored() {
    let store = MemoryStore::new();
    store.insert_notification(notification(10, 7, None)).await;
    let addr = serve(create_app(test_state(&store))).await;

    let mut socket = connect(addr, 42).await;
    let read = Envelope::new(EnvelopeType::NotificationRead, serde_json::Value::Null)
        .with_related(RelatedEntityType::Notification, 10);
    send(&mut socket, &read).await;

    send(&mut socket, &Envelope::ping()).await;
    assert_eq!(next_envelope(&mut socket).await.kind, EnvelopeType::Pong);
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_connection() {
    let addr = serve(create_app(test_state(&MemoryStore::new()))).await;
    let mut socket = connect(addr, 42).await;

    socket.send(Message::Text("not json".to_string())).await.unwrap();
    socket
        .send(Message::Text(r#"{"type":"something-new"}"#.to_string()))
        .await
        .unwrap();
    send(&mut socket, &Envelope::ping()).await;
    assert_eq!(next_envelope(&mut socket).await.kind, EnvelopeType::Pong);
}

#[tokio::test]
async fn websocket_ping_frames_keep_connection_alive() {
    let state = test_state(&MemoryStore::new());
    let registry = state.registry.clone();
    let addr = serve(create_app(state)).await;
    let monitor = HeartbeatMonitor::new(registry.clone(), Duration::from_millis(200), 2);

    let mut pinging = connect(addr, 42).await;
    let _silent = connect(addr, 7).await;

    // Only protocol-level pings for more than twice the sweep timeout.
    for _ in 0..9 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        pinging.send(Message::Ping(Vec::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.sweep().await;
    }

    assert_eq!(registry.connections_for(42).await.len(), 1);
    assert!(registry.connections_for(7).await.is_empty());
}

struct ChannelCache(mpsc::UnboundedSender<CacheKey>);

impl QueryCache for ChannelCache {
    fn invalidate(&self, key: &CacheKey) {
        let _ = self.0.send(*key);
    }
}

async fn next_key(keys: &mut mpsc::UnboundedReceiver<CacheKey>) -> CacheKey {
    tokio::time::timeout(Duration::from_secs(5), keys.recv())
        .await
        .expect("timed out waiting for invalidation")
        .unwrap()
}

#[tokio::test]
async fn sync_client_reconciles_then_invalidates_on_dispatch() {
    let store = MemoryStore::new();
    let state = test_state(&store);
    let registry = state.registry.clone();
    let app = create_app(state);
    let addr = serve(app.clone()).await;

    let (tx, mut keys) = mpsc::unbounded_channel();
    let config = ClientConfig::new(format!("ws://{}", addr), 42);
    let connector = Arc::new(WsConnector::new(&config.server_url, 42));
    let handle = SyncClient::spawn(config, connector, Arc::new(ChannelCache(tx)));

    // The init reply marks every collection stale; Conversations comes last in key order.
    loop {
        if next_key(&mut keys).await == CacheKey::Conversations {
            break;
        }
    }
    assert_eq!(registry.connection_count().await, 1);

    let (_, json) = post_dispatch(
        &app,
        Some(APP_KEY),
        json!({
            "envelope": { "type": "notification", "payload": { "title": "Nova mensagem" } },
            "audience": { "kind": "singleUser", "userId": 42 }
        }),
    )
    .await;
    assert_eq!(json["delivered"], 1);
    assert_eq!(next_key(&mut keys).await, CacheKey::Notifications);

    // Any conversation key would arrive before the chat-message invalidation below.
    let (_, json) = post_dispatch(
        &app,
        Some(APP_KEY),
        json!({
            "envelope": {
                "type": "chat-message",
                "payload": { "senderId": 7, "receiverId": 42, "content": "oi" }
            },
            "audience": { "kind": "singleUser", "userId": 42 }
        }),
    )
    .await;
    assert_eq!(json["delivered"], 1);
    assert_eq!(next_key(&mut keys).await, CacheKey::Conversation(7));

    handle.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server should drop the connection after client shutdown");
}

#[tokio::test]
async fn connections_listing_requires_key() {
    let store = MemoryStore::new();
    let app = create_app(test_state(&store));
    let addr = serve(app.clone()).await;
    let _socket = connect(addr, 42).await;

    let req = Request::builder()
        .uri("/api/connections")
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/connections")
        .header("x-app-key", APP_KEY)
        .body(Body::empty())
        .unwrap();
    let res = tokio_test::assert_ok!(app.oneshot(req).await);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["count"], 1);
    assert_eq!(json["connections"][0]["userId"], 42);
}
