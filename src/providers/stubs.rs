use async_trait::async_trait;

use crate::db::models::{Channel, Notification, Template, User};

use super::{Provider, ProviderError, ProviderErrorKind, ProviderSendResult, SendContext};

/// Push delivery via FCM (Android) or APNS (iOS), selected per-device by
/// `Device::platform`. Out-of-scope per spec: interface contract only, the
/// actual vendor calls are simulated, but the error taxonomy is real so the
/// worker's retry/DLQ logic exercises the same paths it would in production.
pub struct PushProvider;

#[async_trait]
impl Provider for PushProvider {
    async fn send(
        &self,
        _ctx: &SendContext,
        notification: &Notification,
        user: &User,
        _template: Option<&Template>,
        _rendered_subject: Option<&str>,
        _rendered_body: &str,
    ) -> Result<ProviderSendResult, ProviderError> {
        let devices: Vec<_> = user.devices().into_iter().filter(|d| d.active).collect();
        if devices.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::Invalid,
                "user has no active devices registered",
            ));
        }

        let platform = &devices[0].platform;
        let gateway = match platform.as_str() {
            "ios" => "apns",
            _ => "fcm",
        };

        Ok(ProviderSendResult::accepted(Some(format!(
            "{}-sim-{}",
            gateway, notification.id
        ))))
    }

    fn supported_channel(&self) -> Channel {
        Channel::Push
    }
}

/// SMS delivery via Twilio. Interface contract only; the vendor call is
/// simulated.
pub struct SmsProvider;

#[async_trait]
impl Provider for SmsProvider {
    async fn send(
        &self,
        _ctx: &SendContext,
        notification: &Notification,
        user: &User,
        _template: Option<&Template>,
        _rendered_subject: Option<&str>,
        _rendered_body: &str,
    ) -> Result<ProviderSendResult, ProviderError> {
        if user.phone.is_none() {
            return Err(ProviderError::new(
                ProviderErrorKind::Invalid,
                "user has no phone number on file",
            ));
        }

        Ok(ProviderSendResult::accepted(Some(format!(
            "twilio-sim-{}",
            notification.id
        ))))
    }

    fn supported_channel(&self) -> Channel {
        Channel::Sms
    }
}

/// `in_app` has no outbound leg: the notification record itself, readable
/// through `GET /v1/notifications`, is the delivery. Sending it just marks
/// it sent so the worker's transition logic stays uniform across channels.
pub struct InAppProvider;

#[async_trait]
impl Provider for InAppProvider {
    async fn send(
        &self,
        _ctx: &SendContext,
        _notification: &Notification,
        _user: &User,
        _template: Option<&Template>,
        _rendered_subject: Option<&str>,
        _rendered_body: &str,
    ) -> Result<ProviderSendResult, ProviderError> {
        Ok(ProviderSendResult::accepted(None))
    }

    fn supported_channel(&self) -> Channel {
        Channel::InApp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Device;

    fn user(devices_json: &str, phone: Option<&str>) -> User {
        let now = chrono::Utc::now().naive_utc();
        User {
            id: "u1".to_string(),
            app_id: "app1".to_string(),
            email: None,
            phone: phone.map(str::to_string),
            webhook_url: None,
            devices_json: devices_json.to_string(),
            preferences_json: "{}".to_string(),
            timezone: "UTC".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn notification() -> Notification {
        let now = chrono::Utc::now().naive_utc();
        Notification {
            id: "n1".to_string(),
            app_id: "app1".to_string(),
            user_id: "u1".to_string(),
            template_id: None,
            channel: "push".to_string(),
            priority: "normal".to_string(),
            status: "processing".to_string(),
            content_json: "{}".to_string(),
            metadata_json: "{}".to_string(),
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

    fn ctx() -> SendContext {
        SendContext {
            app_webhook_signing_secret: "secret".to_string(),
            app_email_provider_config: None,
        }
    }

    #[tokio::test]
    async fn push_selects_apns_for_ios_devices() {
        let devices = serde_json::to_string(&vec![Device {
            platform: "ios".to_string(),
            token: "tok".to_string(),
            active: true,
        }])
        .unwrap();
        let result = PushProvider
            .send(&ctx(), &notification(), &user(&devices, None), None, None, "")
            .await
            .unwrap();
        assert!(result.provider_message_id.unwrap().starts_with("apns-sim-"));
    }

    #[tokio::test]
    async fn push_falls_back_to_fcm_for_non_ios() {
        let devices = serde_json::to_string(&vec![Device {
            platform: "android".to_string(),
            token: "tok".to_string(),
            active: true,
        }])
        .unwrap();
        let result = PushProvider
            .send(&ctx(), &notification(), &user(&devices, None), None, None, "")
            .await
            .unwrap();
        assert!(result.provider_message_id.unwrap().starts_with("fcm-sim-"));
    }

    #[tokio::test]
    async fn push_rejects_users_with_no_active_devices() {
        let devices = serde_json::to_string(&vec![Device {
            platform: "ios".to_string(),
            token: "tok".to_string(),
            active: false,
        }])
        .unwrap();
        let err = PushProvider
            .send(&ctx(), &notification(), &user(&devices, None), None, None, "")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Invalid);
    }

    #[tokio::test]
    async fn sms_rejects_users_with_no_phone() {
        let err = SmsProvider
            .send(&ctx(), &notification(), &user("[]", None), None, None, "")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Invalid);
    }

    #[tokio::test]
    async fn sms_accepts_users_with_a_phone() {
        let result = SmsProvider
            .send(&ctx(), &notification(), &user("[]", Some("+15555550123")), None, None, "")
            .await
            .unwrap();
        assert!(result.provider_message_id.unwrap().starts_with("twilio-sim-"));
    }

    #[tokio::test]
    async fn in_app_always_succeeds() {
        let result = InAppProvider
            .send(&ctx(), &notification(), &user("[]", None), None, None, "")
            .await
            .unwrap();
        assert!(result.provider_message_id.is_none());
    }
}
