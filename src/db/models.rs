use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery channel a notification targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    Sms,
    Webhook,
    Sse,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Webhook => "webhook",
            Channel::Sse => "sse",
            Channel::InApp => "in_app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(Channel::Push),
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "webhook" => Some(Channel::Webhook),
            "sse" => Some(Channel::Sse),
            "in_app" => Some(Channel::InApp),
            _ => None,
        }
    }
}

/// Delivery priority. `Critical` shares the `high` queue lane with `High`
/// but is exempt from DND/quiet-hours rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Which priority lane (of the three FIFO queues) this priority lands in.
    /// `critical` absorbs into `high`.
    pub fn lane(&self) -> QueueLane {
        match self {
            Priority::Low => QueueLane::Low,
            Priority::Normal => QueueLane::Normal,
            Priority::High | Priority::Critical => QueueLane::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueLane {
    High,
    Normal,
    Low,
}

/// Lifecycle status of a notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Processing,
    Sent,
    Delivered,
    Read,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Queued => "queued",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Read => "read",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "queued" => Some(NotificationStatus::Queued),
            "processing" => Some(NotificationStatus::Processing),
            "sent" => Some(NotificationStatus::Sent),
            "delivered" => Some(NotificationStatus::Delivered),
            "read" => Some(NotificationStatus::Read),
            "failed" => Some(NotificationStatus::Failed),
            "cancelled" => Some(NotificationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent
                | NotificationStatus::Delivered
                | NotificationStatus::Read
                | NotificationStatus::Failed
                | NotificationStatus::Cancelled
        )
    }

    /// Narrower than `is_terminal`: excludes `Failed`, since a failed
    /// notification can still be dead-lettered and later replayed back
    /// onto the queue. The worker's dequeue-drop check uses this so a DLQ
    /// replay (which re-enqueues without changing status until the worker
    /// sees it) isn't immediately discarded.
    pub fn is_terminal_for_dequeue(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent
                | NotificationStatus::Delivered
                | NotificationStatus::Read
                | NotificationStatus::Cancelled
        )
    }
}

/// Recurrence rule attached to a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurrence {
    pub cron_expression: String,
    pub end_date: Option<NaiveDateTime>,
    pub count: Option<i64>,
    #[serde(default)]
    pub current_count: i64,
}

/// Email provider configuration, overridable per-app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmailProviderConfig {
    Smtp {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    Sendgrid {
        api_key: String,
    },
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    pub rate_limit_per_hour: u32,
    pub retry_attempts: u32,
    pub default_template: Option<String>,
    pub daily_email_limit: i64,
    pub webhooks_enabled: bool,
    pub email_provider_config: Option<EmailProviderConfig>,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_hour: 1000,
            retry_attempts: 5,
            default_template: None,
            daily_email_limit: 10_000,
            webhooks_enabled: true,
            email_provider_config: None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Application {
    pub id: String,
    pub api_key: String,
    pub webhook_signing_secret: String,
    pub settings_json: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Application {
    pub fn settings(&self) -> ApplicationSettings {
        serde_json::from_str(&self.settings_json).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: String, // "HH:MM"
    pub end: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPreference {
    pub enabled: bool,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default)]
    pub email_enabled: Option<bool>,
    #[serde(default)]
    pub push_enabled: Option<bool>,
    #[serde(default)]
    pub sms_enabled: Option<bool>,
    #[serde(default)]
    pub webhook_enabled: Option<bool>,
    #[serde(default)]
    pub sse_enabled: Option<bool>,
    #[serde(default)]
    pub in_app_enabled: Option<bool>,
    #[serde(default)]
    pub dnd: bool,
    pub quiet_hours: QuietHours,
    #[serde(default)]
    pub categories: std::collections::HashMap<String, CategoryPreference>,
    /// 0 means no cap.
    #[serde(default)]
    pub daily_limit: i64,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            email_enabled: None,
            push_enabled: None,
            sms_enabled: None,
            webhook_enabled: None,
            sse_enabled: None,
            in_app_enabled: None,
            dnd: false,
            quiet_hours: QuietHours {
                start: "22:00".to_string(),
                end: "06:00".to_string(),
                enabled: false,
            },
            categories: std::collections::HashMap::new(),
            daily_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub platform: String,
    pub token: String,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub app_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub webhook_url: Option<String>,
    pub devices_json: String,
    pub preferences_json: String,
    pub timezone: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn devices(&self) -> Vec<Device> {
        serde_json::from_str(&self.devices_json).unwrap_or_default()
    }

    pub fn preferences(&self) -> UserPreferences {
        serde_json::from_str(&self.preferences_json).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Active,
    Inactive,
    Archived,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Active => "active",
            TemplateStatus::Inactive => "inactive",
            TemplateStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TemplateStatus::Active),
            "inactive" => Some(TemplateStatus::Inactive),
            "archived" => Some(TemplateStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Template {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub locale: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub variables_json: String,
    pub version: i64,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Template {
    pub fn variables(&self) -> Vec<String> {
        serde_json::from_str(&self.variables_json).unwrap_or_default()
    }

    pub fn status(&self) -> TemplateStatus {
        TemplateStatus::parse(&self.status).unwrap_or(TemplateStatus::Inactive)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Notification {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    pub template_id: Option<String>,
    pub channel: String,
    pub priority: String,
    pub status: String,
    pub content_json: String,
    pub metadata_json: String,
    pub scheduled_at: Option<NaiveDateTime>,
    pub recurrence_json: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub sent_at: Option<NaiveDateTime>,
    pub delivered_at: Option<NaiveDateTime>,
    pub read_at: Option<NaiveDateTime>,
    pub failed_at: Option<NaiveDateTime>,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub recurrence_spawned: bool,
}

impl Notification {
    pub fn channel(&self) -> Channel {
        Channel::parse(&self.channel).unwrap_or(Channel::Webhook)
    }

    pub fn priority(&self) -> Priority {
        Priority::parse(&self.priority).unwrap_or(Priority::Normal)
    }

    pub fn status(&self) -> NotificationStatus {
        NotificationStatus::parse(&self.status).unwrap_or(NotificationStatus::Failed)
    }

    pub fn content(&self) -> NotificationContent {
        serde_json::from_str(&self.content_json).unwrap_or_default()
    }

    pub fn metadata(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata_json).unwrap_or(serde_json::Value::Null)
    }

    pub fn recurrence(&self) -> Option<Recurrence> {
        self.recurrence_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_notification(channel: &str, priority: &str, status: &str) -> Notification {
        let now = chrono::Utc::now().naive_utc();
        Notification {
            id: "n1".to_string(),
            app_id: "app1".to_string(),
            user_id: "u1".to_string(),
            template_id: None,
            channel: channel.to_string(),
            priority: priority.to_string(),
            status: status.to_string(),
            content_json: r#"{"title":"Hi","body":"there","data":{}}"#.to_string(),
            metadata_json: r#"{"webhook_url":"http://r/hook"}"#.to_string(),
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

    #[test]
    fn channel_parses_known_values_and_falls_back_to_webhook() {
        assert_eq!(fixture_notification("sms", "normal", "queued").channel(), Channel::Sms);
        assert_eq!(fixture_notification("bogus", "normal", "queued").channel(), Channel::Webhook);
    }

    #[test]
    fn priority_lane_folds_critical_into_high() {
        assert_eq!(Priority::Critical.lane(), QueueLane::High);
        assert_eq!(Priority::High.lane(), QueueLane::High);
        assert_eq!(Priority::Normal.lane(), QueueLane::Normal);
        assert_eq!(Priority::Low.lane(), QueueLane::Low);
    }

    #[test]
    fn status_is_terminal_covers_exactly_the_final_states() {
        for s in ["sent", "delivered", "read", "failed", "cancelled"] {
            assert!(NotificationStatus::parse(s).unwrap().is_terminal(), "{s} should be terminal");
        }
        for s in ["pending", "queued", "processing"] {
            assert!(!NotificationStatus::parse(s).unwrap().is_terminal(), "{s} should not be terminal");
        }
    }

    #[test]
    fn content_and_metadata_round_trip_through_json_columns() {
        let n = fixture_notification("webhook", "high", "queued");
        let content = n.content();
        assert_eq!(content.title, "Hi");
        assert_eq!(content.body, "there");
        assert_eq!(n.metadata()["webhook_url"], "http://r/hook");
    }

    #[test]
    fn malformed_content_json_falls_back_to_default_rather_than_panicking() {
        let mut n = fixture_notification("webhook", "high", "queued");
        n.content_json = "not json".to_string();
        assert_eq!(n.content(), NotificationContent::default());
    }

    #[test]
    fn recurrence_is_none_without_a_recurrence_json_column() {
        assert!(fixture_notification("email", "low", "sent").recurrence().is_none());
    }
}
