use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::db::repository::NotificationRepository;
use crate::queue::{DlqEntry, QueueDepth};
use crate::routes::auth::ApiKeyAuth;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(queue_stats))
        .route("/dlq", get(list_dlq))
        .route("/dlq/replay", axum::routing::post(replay_dlq))
}

#[derive(Debug, Deserialize)]
pub struct DlqListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DlqReplayQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DlqReplayResponse {
    pub replayed: usize,
}

/// Operator-facing queue depth snapshot. No app scoping:
/// the queue is process-wide, so this is an operator endpoint, not a
/// per-tenant one — callers still need a valid API key to reach it.
async fn queue_stats(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(_app): ApiKeyAuth,
) -> Json<QueueDepth> {
    Json(state.queue.depth())
}

async fn list_dlq(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(_app): ApiKeyAuth,
    Query(query): Query<DlqListQuery>,
) -> Json<Vec<DlqEntry>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Json(state.queue.list_dlq(limit))
}

/// Re-enqueues dead-lettered items into their original priority lane,
/// `retry_count` intact, so a subsequent transient failure resumes the
/// backoff schedule rather than restarting it. Each entry's durable status
/// is flipped from `failed` back to `queued` first, since the worker drops
/// anything it dequeues that's still `failed`.
async fn replay_dlq(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(_app): ApiKeyAuth,
    Query(query): Query<DlqReplayQuery>,
) -> Json<DlqReplayResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let entries = state.queue.drain_dlq(limit);

    let mut replayed = 0;
    for entry in entries {
        match NotificationRepository::mark_queued_for_replay(&state.db, &entry.item.notification_id).await {
            Ok(_) => {
                state.queue.enqueue(entry.item);
                replayed += 1;
            }
            Err(e) => {
                tracing::warn!(notification_id = %entry.item.notification_id, error = %e, "dropping dlq entry, not replayable");
            }
        }
    }

    Json(DlqReplayResponse { replayed })
}
