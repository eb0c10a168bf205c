//! Request extractors shared by HTTP routes. WebSocket identity is checked in the handshake.

pub mod auth;

pub use auth::{AppKey, HEADER_APP_KEY};
