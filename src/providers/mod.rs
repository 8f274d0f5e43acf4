pub mod circuit_breaker;
pub mod smtp;
pub mod sse;
pub mod stubs;
pub mod webhook;

pub use circuit_breaker::CircuitBreaker;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::models::{Channel, EmailProviderConfig, Notification, Template, User};

/// Category taxonomy a provider returns on failure. Distinct from
/// `crate::error::AppError`: a provider error never reaches the REST
/// surface directly, the worker classifies it into a retry decision first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Permanent client error, do not retry.
    Invalid,
    /// Permanent configuration error, do not retry.
    Auth,
    /// Transient, retry with backoff.
    RateLimit,
    /// Transient.
    ProviderApi,
    /// Transient.
    Network,
    /// Transient.
    Timeout,
    /// Transient.
    Unknown,
}

impl ProviderErrorKind {
    /// Only `Invalid`/`Auth` are permanent; everything else is transient
    /// and eligible for the worker's retry/backoff path.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderErrorKind::Invalid | ProviderErrorKind::Auth)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSendResult {
    pub provider_message_id: Option<String>,
    pub delivery_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Set when the provider itself confirms acknowledged delivery (as
    /// opposed to merely "accepted for sending"), allowing the worker to
    /// transition straight to `delivered` without waiting on a separate ack.
    pub acknowledged: bool,
}

impl ProviderSendResult {
    pub fn accepted(provider_message_id: Option<String>) -> Self {
        Self {
            provider_message_id,
            delivery_time: Utc::now(),
            metadata: HashMap::new(),
            acknowledged: false,
        }
    }
}

/// Per-call context passed to providers: app-scoped secrets and settings
/// a provider needs but that don't belong on the notification record
/// itself.
pub struct SendContext {
    pub app_webhook_signing_secret: String,
    /// Per-app email delivery override; `None` falls back to the
    /// process-wide `SmtpConfig` default.
    pub app_email_provider_config: Option<EmailProviderConfig>,
}

/// A channel-specific delivery driver: webhook, SSE, SMTP, and the
/// push/SMS/in-app stubs all implement this against a single worker call site.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn send(
        &self,
        ctx: &SendContext,
        notification: &Notification,
        user: &User,
        template: Option<&Template>,
        rendered_subject: Option<&str>,
        rendered_body: &str,
    ) -> Result<ProviderSendResult, ProviderError>;

    fn supported_channel(&self) -> Channel;

    async fn healthy(&self) -> bool {
        true
    }

    /// Releases any held resources (connections, client handles) on
    /// shutdown. Most providers are stateless and keep the default no-op.
    async fn close(&self) {}
}

/// Keyed by channel; each entry wraps its provider with its own circuit
/// breaker instance, so one channel tripping open never affects another.
pub struct ProviderRegistry {
    entries: HashMap<Channel, (Arc<dyn Provider>, Arc<CircuitBreaker>)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>, breaker: CircuitBreaker) {
        let channel = provider.supported_channel();
        self.entries.insert(channel, (provider, Arc::new(breaker)));
    }

    pub fn get(&self, channel: Channel) -> Option<(Arc<dyn Provider>, Arc<CircuitBreaker>)> {
        self.entries.get(&channel).cloned()
    }

    /// Calls `close` on every registered provider, for graceful shutdown.
    pub async fn close_all(&self) {
        for (provider, _) in self.entries.values() {
            provider.close().await;
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
