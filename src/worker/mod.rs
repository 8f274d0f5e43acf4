use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;

use crate::db::repository::{ApplicationRepository, NotificationRepository, TemplateRepository, UserRepository};
use crate::policy::PolicyEvaluator;
use crate::providers::{ProviderError, ProviderErrorKind, SendContext};
use crate::queue::QueueItem;
use crate::template_engine;
use crate::AppState;

/// Spawns `count` independent consumers, each running the worker loop.
/// Every task owns a clone of `state` and a `shutdown` subscription, and
/// `select!`s between the blocking dequeue and the shutdown signal.
pub fn spawn_pool(
    state: Arc<AppState>,
    shutdown: broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let count = state.config.worker.count;
    (0..count)
        .map(|worker_index| {
            let state = state.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                tracing::info!(worker_index, "worker started");
                loop {
                    let dequeue_timeout = Duration::from_secs(state.config.worker.dequeue_timeout_seconds);
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            tracing::info!(worker_index, "worker shutting down");
                            break;
                        }
                        item = state.queue.dequeue(dequeue_timeout) => {
                            if let Some(item) = item {
                                process_item(&state, item).await;
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

/// Subscribes to presence check-in events and, for each, requeues the
/// user's waiting webhook notifications to the head of their priority
/// lane. Best-effort: duplication across a flush and a normal drain is
/// tolerated, the worker dedupes via the record store's status check
/// (step 2 of the main loop).
pub fn spawn_instant_flush(state: Arc<AppState>, shutdown: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    let mut events = state.presence.subscribe();
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("instant-flush subscriber shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            match NotificationRepository::list_queued_webhook_for_user(&state.db, &event.user_id).await {
                                Ok(notifications) => {
                                    for n in notifications {
                                        let n_priority = n.priority();
                                        state.queue.enqueue_head(QueueItem::new(n.id, n_priority, n.retry_count));
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(user_id = %event.user_id, error = %e, "instant-flush lookup failed");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}

/// The per-item processing loop: load -> transition -> authorize (policy)
/// -> render -> send -> transition -> retry-or-DLQ.
async fn process_item(state: &AppState, item: QueueItem) {
    let pool = &state.db;

    // Step 2: load notification; duplicate/stale items are dropped silently.
    let notification = match NotificationRepository::find_by_id(pool, &item.notification_id).await {
        Ok(n) => n,
        Err(_) => {
            tracing::debug!(notification_id = %item.notification_id, "dropping dequeued item, record missing");
            return;
        }
    };
    if notification.status().is_terminal_for_dequeue() {
        tracing::debug!(notification_id = %notification.id, "dropping dequeued item, already terminal");
        return;
    }

    // Step 3: queued -> processing.
    let notification = match NotificationRepository::mark_processing(pool, &notification.id).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(notification_id = %item.notification_id, error = %e, "failed to mark processing");
            return;
        }
    };

    // Step 4: load user.
    let user = match UserRepository::find_by_id(pool, &notification.user_id, &notification.app_id).await {
        Ok(u) => u,
        Err(_) => {
            terminal_fail(pool, &notification.id, "UserNotFound: user record missing").await;
            return;
        }
    };

    let app = match ApplicationRepository::find_by_id(pool, &notification.app_id).await {
        Ok(a) => a,
        Err(_) => {
            terminal_fail(pool, &notification.id, "AppNotFound: application record missing").await;
            return;
        }
    };

    // Step 5: policy.
    if let Err(rejection) = PolicyEvaluator::evaluate(pool, &app, &user, &notification).await {
        terminal_fail(pool, &notification.id, rejection.as_str()).await;
        return;
    }

    // Step 6: template render, content defaults filling missing keys.
    let content = notification.content();
    let template = match notification.template_id.as_deref() {
        Some(template_id) => match TemplateRepository::find_by_id(pool, &notification.app_id, template_id).await {
            Ok(t) => Some(t),
            Err(_) => {
                terminal_fail(pool, &notification.id, "TemplateInvalid: template not found").await;
                return;
            }
        },
        None => None,
    };

    let mut data = content.data.clone();
    data.entry("Title".to_string())
        .or_insert_with(|| serde_json::Value::String(content.title.clone()));
    data.entry("Body".to_string())
        .or_insert_with(|| serde_json::Value::String(content.body.clone()));

    let (rendered_subject, rendered_body) = match &template {
        Some(t) => {
            if let Err(_e) = template_engine::validate(t.subject.as_deref(), &t.body, &t.variables()) {
                terminal_fail(pool, &notification.id, "TemplateInvalid: undeclared placeholder").await;
                return;
            }
            let subject = t.subject.as_deref().map(|s| template_engine::render(s, &data));
            let body = template_engine::render(&t.body, &data);
            (subject, body)
        }
        None => (Some(content.title.clone()), content.body.clone()),
    };

    // Step 7: select provider; presence override is resolved inside the
    // webhook provider itself, this just picks the channel's registration.
    let channel = notification.channel();
    let Some((provider, breaker)) = state.providers.get(channel) else {
        terminal_fail(pool, &notification.id, "ProviderUnavailable: no provider registered for channel").await;
        return;
    };

    // Step 8: dispatch under the circuit breaker with a per-call timeout.
    if !breaker.allow_call() {
        handle_transient_error(
            state,
            &notification.id,
            notification.priority(),
            item.retry_count,
            app.settings().retry_attempts,
            &ProviderError::new(ProviderErrorKind::Unknown, "circuit breaker open"),
        )
        .await;
        return;
    }

    let ctx = SendContext {
        app_webhook_signing_secret: app.webhook_signing_secret.clone(),
        app_email_provider_config: app.settings().email_provider_config,
    };

    let call = provider.send(
        &ctx,
        &notification,
        &user,
        template.as_ref(),
        rendered_subject.as_deref(),
        &rendered_body,
    );
    let timeout = Duration::from_secs(state.config.worker.provider_timeout_seconds);

    match tokio::time::timeout(timeout, call).await {
        // Step 9: success.
        Ok(Ok(result)) => {
            breaker.on_success();
            if let Err(e) = NotificationRepository::mark_sent(pool, &notification.id).await {
                tracing::warn!(notification_id = %notification.id, error = %e, "failed to mark sent");
                return;
            }
            if result.acknowledged {
                let _ = NotificationRepository::mark_delivered(pool, &notification.id).await;
            }
        }
        // Step 10: provider error, classify permanent vs transient.
        Ok(Err(err)) => {
            breaker.on_failure();
            if err.kind.is_permanent() {
                terminal_fail(pool, &notification.id, &format!("{}: {}", provider_error_code(&err), err.message)).await;
            } else {
                handle_transient_error(state, &notification.id, notification.priority(), item.retry_count, app.settings().retry_attempts, &err).await;
            }
        }
        // Timed out: treated as a transient Timeout error.
        Err(_) => {
            breaker.on_failure();
            let err = ProviderError::new(ProviderErrorKind::Timeout, "provider call timed out");
            handle_transient_error(state, &notification.id, notification.priority(), item.retry_count, app.settings().retry_attempts, &err).await;
        }
    }
}

fn provider_error_code(err: &ProviderError) -> &'static str {
    match err.kind {
        ProviderErrorKind::Invalid => "Invalid",
        ProviderErrorKind::Auth => "Auth",
        ProviderErrorKind::RateLimit => "RateLimit",
        ProviderErrorKind::ProviderApi => "ProviderAPI",
        ProviderErrorKind::Network => "Network",
        ProviderErrorKind::Timeout => "Timeout",
        ProviderErrorKind::Unknown => "Unknown",
    }
}

/// Transient failure path: retry with exponential backoff + jitter up to
/// `retry_attempts`, else dead-letter and terminal-fail. `delay = min(cap,
/// base * 2^retry_count)`.
async fn handle_transient_error(
    state: &AppState,
    notification_id: &str,
    priority: crate::db::models::Priority,
    retry_count: i64,
    retry_attempts: u32,
    err: &ProviderError,
) {
    let pool = &state.db;
    let reason = format!("{}: {}", provider_error_code(err), err.message);

    if (retry_count + 1) as u32 > retry_attempts {
        state.queue.enqueue_dlq(
            QueueItem::new(notification_id.to_string(), priority, retry_count),
            reason.clone(),
        );
        terminal_fail(pool, notification_id, &reason).await;
        return;
    }

    let notification = match NotificationRepository::register_retry(pool, notification_id, &reason).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(notification_id, error = %e, "failed to register retry");
            return;
        }
    };

    let cfg = &state.config.retry;
    let base = cfg.base_seconds as f64;
    let cap = cfg.cap_seconds as f64;
    let exp = base * 2f64.powi(retry_count as i32);
    let delay_seconds = exp.min(cap);
    let jitter = {
        let mut rng = rand::thread_rng();
        let factor = rng.gen_range(-cfg.jitter_factor..=cfg.jitter_factor);
        delay_seconds * factor
    };
    let delay = Duration::from_secs_f64((delay_seconds + jitter).max(0.0));

    let item = QueueItem::new(notification.id.clone(), notification.priority(), notification.retry_count);
    state.queue.enqueue_retry(item, chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
}

async fn terminal_fail(pool: &sqlx::SqlitePool, notification_id: &str, reason: &str) {
    if let Err(e) = NotificationRepository::mark_failed(pool, notification_id, reason).await {
        tracing::warn!(notification_id, error = %e, "failed to mark failed");
    }
}
