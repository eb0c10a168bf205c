//! Real-time notification sync hub.
//!
//! Server side: a WebSocket endpoint keeps a registry of live connections per user and a
//! dispatch router fans producer events out to one user, a role, or everyone. Client side:
//! a reconnecting runtime that turns inbound envelopes into cache invalidations.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

pub use config::{ClientConfig, Config};
pub use error::{AppError, ClientError};
pub use handlers::http::AppState;

use axum::routing::{get, post};
use handlers::http;

/// Build the API router (ws, dispatch, connections, health). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/api/dispatch", post(http::dispatch))
        .route("/api/connections", get(http::list_connections))
        .route("/health", get(http::health))
        .with_state(state)
}
