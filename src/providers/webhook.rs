use async_trait::async_trait;
use hex;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::db::models::{Channel, Notification, Template, User};
use crate::presence::PresenceRegistry;
use std::sync::Arc;

use super::{Provider, ProviderError, ProviderErrorKind, ProviderSendResult, SendContext};

type HmacSha256 = Hmac<Sha256>;

/// Outbound webhook payload:
/// `{id, app_id, user_id, channel, priority, status, template: {...}, content, metadata, created_at}`.
#[derive(Debug, serde::Serialize)]
struct WebhookPayload<'a> {
    id: &'a str,
    app_id: &'a str,
    user_id: &'a str,
    channel: &'a str,
    priority: &'a str,
    status: &'a str,
    template: Option<WebhookTemplate<'a>>,
    content: serde_json::Value,
    metadata: serde_json::Value,
    created_at: String,
}

#[derive(Debug, serde::Serialize)]
struct WebhookTemplate<'a> {
    name: &'a str,
    subject: Option<&'a str>,
    body: &'a str,
    variables: Vec<String>,
}

pub struct WebhookProvider {
    client: reqwest::Client,
    presence: Arc<PresenceRegistry>,
}

impl WebhookProvider {
    pub fn new(client: reqwest::Client, presence: Arc<PresenceRegistry>) -> Self {
        Self { client, presence }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Target URL precedence: notification's `metadata.webhook_url`, else
    /// presence `dynamic_url`, else the user's static `webhook_url`.
    fn resolve_target(&self, notification: &Notification, user: &User) -> Option<String> {
        if let Some(url) = notification
            .metadata()
            .get("webhook_url")
            .and_then(|v| v.as_str())
        {
            return Some(url.to_string());
        }
        if let Some(entry) = self.presence.get(&user.id) {
            return Some(entry.dynamic_url);
        }
        user.webhook_url.clone()
    }
}

#[async_trait]
impl Provider for WebhookProvider {
    async fn send(
        &self,
        ctx: &SendContext,
        notification: &Notification,
        user: &User,
        template: Option<&Template>,
        rendered_subject: Option<&str>,
        rendered_body: &str,
    ) -> Result<ProviderSendResult, ProviderError> {
        let target = self.resolve_target(notification, user).ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::Invalid, "no webhook destination configured")
        })?;

        let content = notification.content();
        let payload = WebhookPayload {
            id: &notification.id,
            app_id: &notification.app_id,
            user_id: &notification.user_id,
            channel: notification.channel().as_str(),
            priority: notification.priority().as_str(),
            status: notification.status().as_str(),
            template: template.map(|t| WebhookTemplate {
                name: &t.name,
                subject: rendered_subject,
                body: rendered_body,
                variables: t.variables(),
            }),
            content: serde_json::json!({
                "title": content.title,
                "body": rendered_body,
                "data": content.data,
            }),
            metadata: notification.metadata(),
            created_at: notification.created_at.to_string(),
        };

        let body = serde_json::to_vec(&payload)
            .map_err(|e| ProviderError::new(ProviderErrorKind::Invalid, e.to_string()))?;

        let signature = Self::sign(&ctx.app_webhook_signing_secret, &body);

        let response = self
            .client
            .post(&target)
            .header("Content-Type", "application/json")
            .header("User-Agent", "freerange-notify/1.0")
            .header("X-Notification-ID", &notification.id)
            .header("X-Webhook-Signature", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        if !response.status().is_success() {
            // Non-2xx is treated as transient.
            return Err(ProviderError::new(
                ProviderErrorKind::ProviderApi,
                format!("webhook target returned status {}", response.status()),
            ));
        }

        Ok(ProviderSendResult::accepted(None))
    }

    fn supported_channel(&self) -> Channel {
        Channel::Webhook
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::new(ProviderErrorKind::Timeout, e.to_string())
    } else if e.is_connect() {
        ProviderError::new(ProviderErrorKind::Network, e.to_string())
    } else {
        ProviderError::new(ProviderErrorKind::Unknown, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> WebhookProvider {
        WebhookProvider::new(reqwest::Client::new(), Arc::new(PresenceRegistry::new(300)))
    }

    fn notification(metadata_json: &str) -> Notification {
        let now = chrono::Utc::now().naive_utc();
        Notification {
            id: "n1".to_string(),
            app_id: "app1".to_string(),
            user_id: "u1".to_string(),
            template_id: None,
            channel: "webhook".to_string(),
            priority: "normal".to_string(),
            status: "processing".to_string(),
            content_json: "{}".to_string(),
            metadata_json: metadata_json.to_string(),
            scheduled_at: None,
            recurrence_json: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            retry_count: 0,
            error_message: None,
            recurrence_spawned: false,
        }
    }

    fn user(webhook_url: Option<&str>) -> User {
        let now = chrono::Utc::now().naive_utc();
        User {
            id: "u1".to_string(),
            app_id: "app1".to_string(),
            email: None,
            phone: None,
            webhook_url: webhook_url.map(str::to_string),
            devices_json: "[]".to_string(),
            preferences_json: "{}".to_string(),
            timezone: "UTC".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn sign_is_deterministic_and_key_dependent() {
        let a = WebhookProvider::sign("secret-a", b"payload");
        let b = WebhookProvider::sign("secret-a", b"payload");
        let c = WebhookProvider::sign("secret-b", b"payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn resolve_target_prefers_notification_metadata_override() {
        let provider = provider();
        let n = notification(r#"{"webhook_url":"http://override/hook"}"#);
        let u = user(Some("http://static/hook"));
        assert_eq!(provider.resolve_target(&n, &u), Some("http://override/hook".to_string()));
    }

    #[test]
    fn resolve_target_prefers_presence_over_static_url() {
        let provider = provider();
        provider.presence.set("u1", "http://dynamic/hook");
        let n = notification("{}");
        let u = user(Some("http://static/hook"));
        assert_eq!(provider.resolve_target(&n, &u), Some("http://dynamic/hook".to_string()));
    }

    #[test]
    fn resolve_target_falls_back_to_static_user_url() {
        let provider = provider();
        let n = notification("{}");
        let u = user(Some("http://static/hook"));
        assert_eq!(provider.resolve_target(&n, &u), Some("http://static/hook".to_string()));
    }

    #[test]
    fn resolve_target_is_none_with_no_destination_anywhere() {
        let provider = provider();
        let n = notification("{}");
        let u = user(None);
        assert_eq!(provider.resolve_target(&n, &u), None);
    }
}
