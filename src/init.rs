//! Startup helpers: database connection + migrations, provider registry
//! construction. Keeps `main` focused on wiring the router and the
//! background tasks together.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::bus::Bus;
use crate::config::Config;
use crate::presence::PresenceRegistry;
use crate::providers::{smtp::EmailProvider, sse::SseProvider, stubs, webhook::WebhookProvider, CircuitBreaker, ProviderRegistry};

/// Redact userinfo from a database URL before logging it.
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{p}")).unwrap_or_default();
        let path = url.path();
        format!("{scheme}://{host}{port_part}{path}")
    } else if let Some(at_pos) = db_url.find('@') {
        format!("(redacted){}", &db_url[at_pos + 1..])
    } else {
        "(redacted)".to_string()
    }
}

/// Opens the SQLite pool (creating the file and its parent directory if
/// missing) and runs embedded migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create database directory {}: {e}", parent.display())
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Registers every channel's provider, each behind its own circuit
/// breaker instance so that failures on one channel never trip another.
pub fn build_provider_registry(config: &Config, bus: Arc<Bus>, presence: Arc<PresenceRegistry>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    let breaker = || {
        CircuitBreaker::new(
            config.circuit_breaker.failure_threshold,
            std::time::Duration::from_secs(config.circuit_breaker.reset_timeout_seconds),
        )
    };

    let webhook_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.webhook.request_timeout_seconds))
        .build()
        .expect("reqwest client builds with a fixed timeout");
    registry.register(Arc::new(WebhookProvider::new(webhook_client, presence)), breaker());
    registry.register(Arc::new(SseProvider::new(bus)), breaker());
    registry.register(Arc::new(EmailProvider::new(config.smtp.clone())), breaker());
    registry.register(Arc::new(stubs::PushProvider), breaker());
    registry.register(Arc::new(stubs::SmsProvider), breaker());
    registry.register(Arc::new(stubs::InAppProvider), breaker());

    registry
}
