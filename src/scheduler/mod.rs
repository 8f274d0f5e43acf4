use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::broadcast;

use crate::db::models::Recurrence;
use crate::db::repository::{CreateNotification, NotificationRepository};
use crate::queue::QueueItem;
use crate::AppState;

/// Periodic tick (default 1s) via `tokio::select! { shutdown, sleep }`.
/// Each tick: drain ready scheduled items, drain ready retry items, then
/// spawn the next occurrence of any completed recurring notification.
pub fn spawn(state: Arc<AppState>, shutdown: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let period = Duration::from_secs(state.config.scheduler.tick_seconds);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(period) => {}
            }

            let now = Utc::now();
            let limit = state.config.scheduler.drain_batch_limit as usize;

            for item in state.queue.drain_ready_scheduled(limit, now) {
                // Flip the durable record from `pending` to `queued` before
                // handing it to the in-memory lane, so it's no longer
                // cancellable and a crash between here and dispatch doesn't
                // strand it as `pending` forever.
                match NotificationRepository::claim_one_due_scheduled(&state.db, now.naive_utc()).await {
                    Ok(Some(_)) => state.queue.enqueue(item),
                    Ok(None) => {
                        tracing::debug!(notification_id = %item.notification_id, "scheduled notification no longer pending, dropping");
                    }
                    Err(e) => {
                        tracing::warn!(notification_id = %item.notification_id, error = %e, "failed to claim scheduled notification");
                    }
                }
            }
            for item in state.queue.drain_ready_retry(limit, now) {
                state.queue.enqueue(item);
            }

            if let Err(e) = spawn_recurrences(&state, state.config.scheduler.drain_batch_limit).await {
                tracing::warn!(error = %e, "recurrence scheduling pass failed");
            }
        }
    })
}

/// For each completed recurring notification not yet spawned, compute
/// `next_run` from its cron expression; if due and within policy (count
/// not reached, before end_date), create the next occurrence and enqueue
/// it.
async fn spawn_recurrences(state: &AppState, limit: i64) -> crate::error::AppResult<()> {
    let pool = &state.db;
    let completed = NotificationRepository::list_unspawned_recurring(pool, limit).await?;

    for notification in completed {
        let Some(recurrence) = notification.recurrence() else {
            continue;
        };

        if let Some(end_date) = recurrence.end_date {
            if Utc::now().naive_utc() >= end_date {
                mark_exhausted(pool, &notification.id, &recurrence).await;
                continue;
            }
        }
        if let Some(count) = recurrence.count {
            if recurrence.current_count >= count {
                mark_exhausted(pool, &notification.id, &recurrence).await;
                continue;
            }
        }

        let schedule = match Schedule::from_str(&recurrence.cron_expression) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(notification_id = %notification.id, error = %e, "invalid recurrence cron expression");
                mark_exhausted(pool, &notification.id, &recurrence).await;
                continue;
            }
        };

        let last_run = notification
            .sent_at
            .or(notification.delivered_at)
            .unwrap_or(notification.created_at);
        let next_run = schedule
            .after(&last_run.and_utc())
            .next();

        let Some(next_run) = next_run else {
            mark_exhausted(pool, &notification.id, &recurrence).await;
            continue;
        };

        let new_recurrence = Recurrence {
            cron_expression: recurrence.cron_expression.clone(),
            end_date: recurrence.end_date,
            count: recurrence.count,
            current_count: recurrence.current_count + 1,
        };

        let created = NotificationRepository::create(
            pool,
            CreateNotification {
                app_id: notification.app_id.clone(),
                user_id: notification.user_id.clone(),
                template_id: notification.template_id.clone(),
                channel: notification.channel.clone(),
                priority: notification.priority(),
                content: notification.content(),
                metadata: notification.metadata(),
                scheduled_at: Some(next_run.naive_utc()),
                recurrence: Some(new_recurrence.clone()),
            },
        )
        .await?;

        let created_priority = created.priority();
        state.queue.enqueue_scheduled(
            QueueItem::new(created.id, created_priority, 0),
            next_run,
        );

        let recurrence_json = serde_json::to_string(&new_recurrence).unwrap_or_default();
        NotificationRepository::mark_recurrence_spawned(pool, &notification.id, &recurrence_json).await?;
    }

    Ok(())
}

async fn mark_exhausted(pool: &sqlx::SqlitePool, id: &str, recurrence: &Recurrence) {
    let recurrence_json = serde_json::to_string(recurrence).unwrap_or_default();
    if let Err(e) = NotificationRepository::mark_recurrence_spawned(pool, id, &recurrence_json).await {
        tracing::warn!(notification_id = id, error = %e, "failed to mark recurrence exhausted");
    }
}
