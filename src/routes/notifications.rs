use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{routing::get, Json, Router};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::db::models::{
    Application, Notification, NotificationContent, Priority, Recurrence,
};
use crate::db::repository::{CreateNotification, NotificationRepository, UserRepository};
use crate::error::{AppError, AppResult};
use crate::queue::QueueItem;
use crate::routes::auth::ApiKeyAuth;
use crate::AppState;

/// Scheduling more than this many seconds in the past is rejected; within
/// it, clock skew between caller and server is tolerated.
const SCHEDULE_PAST_TOLERANCE_SECONDS: i64 = 5;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", axum::routing::post(create_notification).get(list_notifications))
        .route("/bulk", axum::routing::post(bulk_send))
        .route("/broadcast", axum::routing::post(broadcast_send))
        .route(
            "/:id",
            get(get_notification).delete(cancel_notification),
        )
        .route("/:id/status", axum::routing::put(update_status))
        .route("/:id/retry", axum::routing::post(retry_notification))
}

#[derive(Debug, Deserialize)]
pub struct RecurrenceRequest {
    pub cron_expression: String,
    pub end_date: Option<DateTime<Utc>>,
    pub count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    pub user_id: String,
    pub channel: String,
    pub priority: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    pub template_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recurrence: Option<RecurrenceRequest>,
    pub webhook_url: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkSendRequest {
    pub user_ids: Vec<String>,
    #[serde(flatten)]
    pub notification: CreateNotificationRequest,
}

#[derive(Debug, Serialize)]
pub struct BulkSendOutcome {
    pub user_id: String,
    pub notification_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(flatten)]
    pub notification: CreateNotificationRequest,
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub user_id: String,
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    pub template_id: Option<String>,
    pub channel: String,
    pub priority: String,
    pub status: String,
    pub content: NotificationContent,
    pub metadata: Value,
    pub scheduled_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub sent_at: Option<NaiveDateTime>,
    pub delivered_at: Option<NaiveDateTime>,
    pub retry_count: i64,
    pub error_message: Option<String>,
}

impl From<Notification> for NotificationResponse {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id.clone(),
            app_id: n.app_id.clone(),
            user_id: n.user_id.clone(),
            template_id: n.template_id.clone(),
            channel: n.channel.clone(),
            priority: n.priority.clone(),
            status: n.status.clone(),
            content: n.content(),
            metadata: n.metadata(),
            scheduled_at: n.scheduled_at,
            created_at: n.created_at,
            updated_at: n.updated_at,
            sent_at: n.sent_at,
            delivered_at: n.delivered_at,
            retry_count: n.retry_count,
            error_message: n.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationsListResponse {
    pub items: Vec<NotificationResponse>,
}

/// Validates, persists, and enqueues a single notification for one user.
/// Shared by the single-send, bulk, and broadcast handlers.
async fn admit(state: &AppState, app: &Application, user_id: &str, req: &CreateNotificationRequest) -> AppResult<Notification> {
    // Reject a `user_id` that doesn't belong to this app before anything is
    // persisted: `User.id` is a caller-supplied string, so without this an
    // app could address another app's user and have their real contact
    // details used to dispatch this app's content.
    UserRepository::find_by_id(&state.db, user_id, &app.id).await?;

    let channel = crate::db::models::Channel::parse(&req.channel)
        .ok_or_else(|| AppError::Validation(format!("invalid channel: {}", req.channel)))?;

    let priority = match req.priority.as_deref() {
        Some(p) => Priority::parse(p).ok_or_else(|| AppError::Validation(format!("invalid priority: {p}")))?,
        None => Priority::Normal,
    };

    if let Some(scheduled_at) = req.scheduled_at {
        if scheduled_at < Utc::now() - chrono::Duration::seconds(SCHEDULE_PAST_TOLERANCE_SECONDS) {
            return Err(AppError::Validation("scheduled_at is in the past".to_string()));
        }
    }

    let recurrence = match &req.recurrence {
        Some(r) => {
            cron::Schedule::from_str(&r.cron_expression)
                .map_err(|e| AppError::Validation(format!("invalid recurrence cron expression: {e}")))?;
            Some(Recurrence {
                cron_expression: r.cron_expression.clone(),
                end_date: r.end_date.map(|d| d.naive_utc()),
                count: r.count,
                current_count: 0,
            })
        }
        None => None,
    };

    let mut metadata = serde_json::Map::new();
    if let Some(url) = &req.webhook_url {
        metadata.insert("webhook_url".to_string(), Value::String(url.clone()));
    }
    if let Some(category) = &req.category {
        metadata.insert("category".to_string(), Value::String(category.clone()));
    }

    let notification = NotificationRepository::create(
        &state.db,
        CreateNotification {
            app_id: app.id.clone(),
            user_id: user_id.to_string(),
            template_id: req.template_id.clone(),
            channel: channel.as_str().to_string(),
            priority,
            content: NotificationContent {
                title: req.title.clone(),
                body: req.body.clone(),
                data: req.data.clone(),
            },
            metadata: Value::Object(metadata),
            scheduled_at: req.scheduled_at.map(|d| d.naive_utc()),
            recurrence,
        },
    )
    .await?;

    match req.scheduled_at {
        Some(at) if at > Utc::now() => {
            state.queue.enqueue_scheduled(QueueItem::new(notification.id.clone(), priority, 0), at);
        }
        _ => {
            state.queue.enqueue(QueueItem::new(notification.id.clone(), priority, 0));
        }
    }

    Ok(notification)
}

async fn create_notification(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Json(req): Json<CreateNotificationRequest>,
) -> AppResult<Json<NotificationResponse>> {
    let user_id = req.user_id.clone();
    let notification = admit(&state, &app, &user_id, &req).await?;
    Ok(Json(notification.into()))
}

async fn bulk_send(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Json(req): Json<BulkSendRequest>,
) -> AppResult<Json<Vec<BulkSendOutcome>>> {
    let mut outcomes = Vec::with_capacity(req.user_ids.len());
    for user_id in &req.user_ids {
        match admit(&state, &app, user_id, &req.notification).await {
            Ok(n) => outcomes.push(BulkSendOutcome {
                user_id: user_id.clone(),
                notification_id: Some(n.id),
                error: None,
            }),
            Err(e) => outcomes.push(BulkSendOutcome {
                user_id: user_id.clone(),
                notification_id: None,
                error: Some(e.to_string()),
            }),
        }
    }
    Ok(Json(outcomes))
}

async fn broadcast_send(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Json(req): Json<BroadcastRequest>,
) -> AppResult<Json<Vec<BulkSendOutcome>>> {
    let users = UserRepository::list_by_app(&state.db, &app.id).await?;
    let mut outcomes = Vec::with_capacity(users.len());
    for user in users {
        match admit(&state, &app, &user.id, &req.notification).await {
            Ok(n) => outcomes.push(BulkSendOutcome {
                user_id: user.id,
                notification_id: Some(n.id),
                error: None,
            }),
            Err(e) => outcomes.push(BulkSendOutcome {
                user_id: user.id,
                notification_id: None,
                error: Some(e.to_string()),
            }),
        }
    }
    Ok(Json(outcomes))
}

async fn get_notification(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationResponse>> {
    let notification = NotificationRepository::find_by_id(&state.db, &id).await?;
    if notification.app_id != app.id {
        return Err(AppError::NotFound(format!("notification {id} not found")));
    }
    Ok(Json(notification.into()))
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<NotificationsListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let notifications = NotificationRepository::list_by_user(
        &state.db,
        &app.id,
        &query.user_id,
        query.status.as_deref(),
        per_page,
        offset,
    )
    .await?;

    Ok(Json(NotificationsListResponse {
        items: notifications.into_iter().map(Into::into).collect(),
    }))
}

/// Admin cancel: only permitted if status ∈ {pending, queued}.
async fn cancel_notification(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationResponse>> {
    let existing = NotificationRepository::find_by_id(&state.db, &id).await?;
    if existing.app_id != app.id {
        return Err(AppError::NotFound(format!("notification {id} not found")));
    }
    let cancelled = NotificationRepository::mark_cancelled(&state.db, &id).await?;
    Ok(Json(cancelled.into()))
}

/// Admin retry: only permitted if status=failed; re-enqueues at normal
/// priority lane position.
async fn retry_notification(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationResponse>> {
    let existing = NotificationRepository::find_by_id(&state.db, &id).await?;
    if existing.app_id != app.id {
        return Err(AppError::NotFound(format!("notification {id} not found")));
    }
    if existing.status() != crate::db::models::NotificationStatus::Failed {
        return Err(AppError::Conflict("only failed notifications can be retried".to_string()));
    }

    let retried = NotificationRepository::register_retry(&state.db, &id, "").await?;
    state.queue.enqueue(QueueItem::new(retried.id.clone(), retried.priority(), retried.retry_count));
    Ok(Json(retried.into()))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> AppResult<Json<NotificationResponse>> {
    let existing = NotificationRepository::find_by_id(&state.db, &id).await?;
    if existing.app_id != app.id {
        return Err(AppError::NotFound(format!("notification {id} not found")));
    }

    let updated = match req.status.as_str() {
        "read" => NotificationRepository::mark_read(&state.db, &id).await?,
        "cancelled" => NotificationRepository::mark_cancelled(&state.db, &id).await?,
        other => return Err(AppError::Validation(format!("unsupported status transition: {other}"))),
    };
    Ok(Json(updated.into()))
}
