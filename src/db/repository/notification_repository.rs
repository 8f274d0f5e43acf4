use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Notification, NotificationContent, Priority, Recurrence};
use crate::error::{AppError, AppResult};

const NOTIFICATION_COLUMNS: &str = "id, app_id, user_id, template_id, channel, priority, status, \
     content_json, metadata_json, scheduled_at, recurrence_json, created_at, updated_at, \
     sent_at, delivered_at, read_at, failed_at, retry_count, error_message, recurrence_spawned";

pub struct CreateNotification {
    pub app_id: String,
    pub user_id: String,
    pub template_id: Option<String>,
    pub channel: String,
    pub priority: Priority,
    pub content: NotificationContent,
    pub metadata: serde_json::Value,
    pub scheduled_at: Option<NaiveDateTime>,
    pub recurrence: Option<Recurrence>,
}

pub struct NotificationRepository;

impl NotificationRepository {
    /// Persist a notification in `pending` state. The queue enqueue happens
    /// separately once this record exists, so worker transitions always have
    /// a durable row to update.
    pub async fn create(pool: &SqlitePool, input: CreateNotification) -> AppResult<Notification> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let content_json =
            serde_json::to_string(&input.content).map_err(|e| AppError::Internal(e.into()))?;
        let recurrence_json = input
            .recurrence
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(e.into()))?;

        let status = if input.scheduled_at.is_some() {
            "pending"
        } else {
            "queued"
        };

        let query = format!(
            r#"
            INSERT INTO notifications (
                id, app_id, user_id, template_id, channel, priority, status,
                content_json, metadata_json, scheduled_at, recurrence_json,
                created_at, updated_at, retry_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Notification>(&query)
            .bind(id)
            .bind(input.app_id)
            .bind(input.user_id)
            .bind(input.template_id)
            .bind(input.channel)
            .bind(input.priority.as_str())
            .bind(status)
            .bind(content_json)
            .bind(input.metadata.to_string())
            .bind(input.scheduled_at)
            .bind(recurrence_json)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let query = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?");
        sqlx::query_as::<_, Notification>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    /// Atomically transition a single due scheduled notification from
    /// `pending` to `queued`, returning it for handoff to the in-memory
    /// queue. Mirrors the claim-by-subselect idiom used for the retry queue,
    /// which avoids holding a transaction open across the scheduler tick.
    pub async fn claim_one_due_scheduled(
        pool: &SqlitePool,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        let query = format!(
            r#"
            UPDATE notifications
            SET status = 'queued', updated_at = ?
            WHERE id = (
                SELECT id FROM notifications
                WHERE status = 'pending' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
                ORDER BY scheduled_at ASC
                LIMIT 1
            )
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn mark_processing(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications SET status = 'processing', updated_at = ?
            WHERE id = ? AND status != 'cancelled'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    pub async fn mark_sent(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications SET status = 'sent', sent_at = ?, updated_at = ?
            WHERE id = ? AND status != 'cancelled'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    pub async fn mark_delivered(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications SET status = 'delivered', delivered_at = ?, updated_at = ?
            WHERE id = ? AND status != 'cancelled'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    pub async fn mark_read(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications SET status = 'read', read_at = ?, updated_at = ?
            WHERE id = ? AND status != 'cancelled'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    /// Increment the retry count and revert to `queued` for re-enqueue.
    pub async fn register_retry(
        pool: &SqlitePool,
        id: &str,
        error_message: &str,
    ) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications
            SET retry_count = retry_count + 1, status = 'queued', error_message = ?, updated_at = ?
            WHERE id = ? AND status != 'cancelled'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(error_message)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    pub async fn mark_failed(pool: &SqlitePool, id: &str, error_message: &str) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications
            SET status = 'failed', failed_at = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND status != 'cancelled'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(error_message)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    /// Brings a dead-lettered notification back onto the queue. Only
    /// `failed` rows qualify: the worker's dequeue-time check drops
    /// anything else it wasn't expecting, and a concurrent cancel must
    /// still win.
    pub async fn mark_queued_for_replay(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications SET status = 'queued', updated_at = ?
            WHERE id = ? AND status = 'failed'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("notification {id} not found")))
    }

    pub async fn mark_cancelled(pool: &SqlitePool, id: &str) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let query = format!(
            r#"
            UPDATE notifications SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status IN ('pending', 'queued')
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| {
                AppError::Conflict(format!("notification {id} cannot be cancelled in its current state"))
            })
    }

    pub async fn list_by_user(
        pool: &SqlitePool,
        app_id: &str,
        user_id: &str,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Notification>> {
        let query = if status.is_some() {
            format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
                 WHERE app_id = ? AND user_id = ? AND status = ? \
                 ORDER BY created_at DESC LIMIT ? OFFSET ?"
            )
        } else {
            format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
                 WHERE app_id = ? AND user_id = ? \
                 ORDER BY created_at DESC LIMIT ? OFFSET ?"
            )
        };

        let mut q = sqlx::query_as::<_, Notification>(&query)
            .bind(app_id)
            .bind(user_id);
        if let Some(s) = status {
            q = q.bind(s);
        }
        q.bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Notifications waiting for webhook delivery, oldest first. These are
    /// the items a presence check-in should jump to the head of the queue.
    pub async fn list_queued_webhook_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<Notification>> {
        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE user_id = ? AND channel = 'webhook' AND status = 'queued' \
             ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Completed recurring notifications whose next occurrence has not yet
    /// been spawned.
    pub async fn list_unspawned_recurring(pool: &SqlitePool, limit: i64) -> AppResult<Vec<Notification>> {
        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE recurrence_json IS NOT NULL AND recurrence_spawned = 0 \
             AND status IN ('sent', 'delivered', 'read') \
             ORDER BY created_at ASC LIMIT ?"
        );
        sqlx::query_as::<_, Notification>(&query)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Marks that the next occurrence of a recurring notification has been
    /// created, and bumps `recurrence.current_count`, so the scheduler does
    /// not re-spawn it on the next tick.
    pub async fn mark_recurrence_spawned(
        pool: &SqlitePool,
        id: &str,
        recurrence_json: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE notifications SET recurrence_spawned = 1, recurrence_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(recurrence_json)
        .bind(Utc::now().naive_utc())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Count notifications sent to a user today, for the per-user daily cap
    /// in the policy evaluator.
    pub async fn count_sent_today(pool: &SqlitePool, user_id: &str) -> AppResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications \
             WHERE user_id = ? AND status IN ('sent', 'delivered', 'read') \
             AND date(created_at) = date('now')",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row.0)
    }

    /// Count emails sent by an application today, for the app-wide daily
    /// email cap in the policy evaluator.
    pub async fn count_emails_sent_today(pool: &SqlitePool, app_id: &str) -> AppResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications \
             WHERE app_id = ? AND channel = 'email' AND status IN ('sent', 'delivered', 'read') \
             AND date(created_at) = date('now')",
        )
        .bind(app_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row.0)
    }
}
