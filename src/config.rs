use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub presence: PresenceConfig,
    pub webhook: WebhookConfig,
    pub smtp: SmtpConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub sse: SseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Required prefix for application API keys, e.g. `frn_`.
    pub api_key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay (seconds) for the first retry attempt.
    pub base_seconds: u64,
    /// Cap (seconds) on the exponential backoff.
    pub cap_seconds: u64,
    /// Jitter factor in [0, 1); applied as +/- a fraction of the computed delay.
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub count: usize,
    /// Per-provider call timeout, seconds.
    pub provider_timeout_seconds: u64,
    /// Per-dequeue blocking timeout, seconds (so workers observe cancellation).
    pub dequeue_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
    pub drain_batch_limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub signing_secret: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before trying a half-open probe.
    pub reset_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub ingest_per_second: u32,
    pub ingest_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SseConfig {
    /// Interval between axum's built-in `KeepAlive` comment frames.
    pub heartbeat_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
                api_key_prefix: env::var("API_KEY_PREFIX").unwrap_or_else(|_| "frn_".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/app.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            retry: RetryConfig {
                base_seconds: env::var("RETRY_BASE_SECONDS")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                cap_seconds: env::var("RETRY_CAP_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
                jitter_factor: env::var("RETRY_JITTER_FACTOR")
                    .unwrap_or_else(|_| "0.2".to_string())
                    .parse()
                    .unwrap_or(0.2),
            },
            worker: WorkerConfig {
                count: env::var("WORKER_COUNT")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .unwrap_or(4),
                provider_timeout_seconds: env::var("WORKER_PROVIDER_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                dequeue_timeout_seconds: env::var("WORKER_DEQUEUE_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            scheduler: SchedulerConfig {
                tick_seconds: env::var("SCHEDULER_TICK_SECONDS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()
                    .unwrap_or(1),
                drain_batch_limit: env::var("SCHEDULER_DRAIN_BATCH_LIMIT")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse()
                    .unwrap_or(100),
            },
            presence: PresenceConfig {
                ttl_seconds: env::var("PRESENCE_TTL_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            },
            webhook: WebhookConfig {
                signing_secret: env::var("WEBHOOK_SIGNING_SECRET")
                    .unwrap_or_else(|_| "dev-signing-secret".to_string()),
                request_timeout_seconds: env::var("WEBHOOK_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            smtp: SmtpConfig {
                host: env::var("SMTP_HOST").ok(),
                port: env::var("SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse()
                    .unwrap_or(587),
                username: env::var("SMTP_USERNAME").ok(),
                password: env::var("SMTP_PASSWORD").ok(),
                from_address: env::var("SMTP_FROM_ADDRESS")
                    .unwrap_or_else(|_| "notifications@example.com".to_string()),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                reset_timeout_seconds: env::var("CIRCUIT_BREAKER_RESET_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            rate_limit: RateLimitConfig {
                ingest_per_second: env::var("RATE_LIMIT_INGEST_PER_SECOND")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .unwrap_or(20),
                ingest_burst: env::var("RATE_LIMIT_INGEST_BURST")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
            },
            sse: SseConfig {
                heartbeat_seconds: env::var("SSE_HEARTBEAT_SECONDS")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .unwrap_or(15),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
                api_key_prefix: "frn_".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/app.db".to_string(),
                max_connections: 5,
            },
            retry: RetryConfig {
                base_seconds: 2,
                cap_seconds: 3600,
                jitter_factor: 0.2,
            },
            worker: WorkerConfig {
                count: 4,
                provider_timeout_seconds: 10,
                dequeue_timeout_seconds: 5,
            },
            scheduler: SchedulerConfig {
                tick_seconds: 1,
                drain_batch_limit: 100,
            },
            presence: PresenceConfig { ttl_seconds: 300 },
            webhook: WebhookConfig {
                signing_secret: "dev-signing-secret".to_string(),
                request_timeout_seconds: 10,
            },
            smtp: SmtpConfig {
                host: None,
                port: 587,
                username: None,
                password: None,
                from_address: "notifications@example.com".to_string(),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout_seconds: 30,
            },
            rate_limit: RateLimitConfig {
                ingest_per_second: 20,
                ingest_burst: 50,
            },
            sse: SseConfig {
                heartbeat_seconds: 15,
            },
        }
    }
}
