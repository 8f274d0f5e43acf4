use std::sync::Arc;

use axum::extract::State;
use axum::{routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::routes::auth::ApiKeyAuth;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/check-in", post(check_in))
}

#[derive(Debug, Deserialize)]
pub struct CheckInRequest {
    pub user_id: String,
    pub dynamic_url: String,
}

#[derive(Debug, Serialize)]
pub struct CheckInResponse {
    pub user_id: String,
    pub dynamic_url: String,
}

/// Sets presence and triggers instant-flush: the `set`
/// publishes a check-in event, and `worker::spawn_instant_flush` reacts by
/// requeuing the user's waiting webhook notifications to the head of line.
async fn check_in(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(_app): ApiKeyAuth,
    Json(req): Json<CheckInRequest>,
) -> AppResult<Json<CheckInResponse>> {
    state.presence.set(&req.user_id, &req.dynamic_url);
    Ok(Json(CheckInResponse {
        user_id: req.user_id,
        dynamic_url: req.dynamic_url,
    }))
}
