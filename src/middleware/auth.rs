//! App key extractor for producer-facing HTTP routes.

use axum::http::request::Parts;
use tracing::debug;

use crate::error::AppError;
use crate::handlers::http::AppState;

pub const HEADER_APP_KEY: &str = "x-app-key";

/// Extractor: request carried the configured `x-app-key`.
#[derive(Clone, Copy, Debug)]
pub struct AppKey;

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for AppKey {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(HEADER_APP_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if key.is_empty() || key != state.app_key {
            debug!("rejected request: invalid or missing x-app-key");
            return Err(AppError::Auth("invalid or missing x-app-key".to_string()));
        }
        Ok(AppKey)
    }
}
