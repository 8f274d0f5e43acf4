use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{routing::get, Router};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::error::AppError;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(stream_notifications))
}

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    pub user_id: String,
    pub app_id: String,
    pub api_key: Option<String>,
}

/// `GET /v1/sse`: one open stream per connection, filtered to the
/// requesting user's messages. Auth accepts either the
/// `X-API-Key` header or an `api_key` query param, since `EventSource`
/// cannot set custom headers from the browser.
async fn stream_notifications(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.api_key.clone())
        .ok_or(AppError::Unauthorized)?;

    let app = crate::db::repository::ApplicationRepository::find_by_api_key(&state.db, &key)
        .await?
        .ok_or(AppError::Unauthorized)?;
    if app.id != query.app_id {
        return Err(AppError::Forbidden);
    }

    let rx = state.bus.subscribe();
    let user_id = query.user_id.clone();

    let stream = futures::stream::unfold((rx, user_id), |(mut rx, user_id)| async move {
        loop {
            match rx.recv().await {
                Ok(message) if message.user_id == user_id => {
                    let event = Event::default()
                        .event("notification")
                        .json_data(&message.notification)
                        .unwrap_or_else(|_| Event::default().event("notification"));
                    return Some((Ok(event), (rx, user_id)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.config.sse.heartbeat_seconds))
            .text("heartbeat"),
    ))
}
