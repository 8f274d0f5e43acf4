use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::db::models::Application;
use crate::db::repository::ApplicationRepository;
use crate::error::AppError;
use crate::AppState;

/// Resolves the calling application from its API key. This system
/// authenticates applications rather than end users, so the ingestion
/// surface is keyed off `X-API-Key` rather than a session or JWT.
pub struct ApiKeyAuth(pub Application);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ApiKeyAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("missing X-API-Key header");
                AppError::Unauthorized
            })?;

        let key = header.trim();
        if key.is_empty() || !key.starts_with(&state.config.server.api_key_prefix) {
            tracing::debug!("malformed API key");
            return Err(AppError::Unauthorized);
        }

        let app = ApplicationRepository::find_by_api_key(&state.db, key)
            .await?
            .ok_or_else(|| {
                tracing::debug!("no application found for supplied API key");
                AppError::Unauthorized
            })?;

        Ok(ApiKeyAuth(app))
    }
}
