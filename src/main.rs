use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::{routing::get, Router};
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bus;
mod config;
mod db;
mod error;
mod init;
mod middleware;
mod policy;
mod presence;
mod providers;
mod queue;
mod routes;
mod scheduler;
mod template_engine;
mod worker;

use bus::Bus;
use config::Config;
use presence::PresenceRegistry;
use providers::ProviderRegistry;
use queue::QueueStore;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub queue: QueueStore,
    pub presence: Arc<PresenceRegistry>,
    pub bus: Arc<Bus>,
    pub providers: ProviderRegistry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "freerange_notify=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting notification delivery service");

    let pool = init::init_db(&config).await?;

    let bus = Arc::new(Bus::default());
    let presence = Arc::new(PresenceRegistry::new(config.presence.ttl_seconds));
    let providers = init::build_provider_registry(&config, bus.clone(), presence.clone());

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        queue: QueueStore::new(),
        presence,
        bus,
        providers,
    });

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);

    let mut background_handles = worker::spawn_pool(app_state.clone(), shutdown_tx.clone());
    background_handles.push(worker::spawn_instant_flush(app_state.clone(), shutdown_tx.clone()));
    background_handles.push(scheduler::spawn(app_state.clone(), shutdown_tx.clone()));

    // Rate limit the ingestion surface only; admin/presence endpoints are
    // already gated by API key and are not public-facing in the same way.
    let mut ingest_builder = GovernorConfigBuilder::default();
    ingest_builder.per_second(config.rate_limit.ingest_per_second.into());
    ingest_builder.burst_size(config.rate_limit.ingest_burst.into());
    ingest_builder.key_extractor(SmartIpKeyExtractor);
    ingest_builder.error_handler(governor_error_handler);
    let ingest_gov_conf = Arc::new(
        ingest_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("failed to build ingestion governor config"))?,
    );

    {
        let limiter = ingest_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            tracing::debug!("ingestion rate limiter size: {}", limiter.len());
            limiter.retain_recent();
        });
    }

    let ingest_rate_layer = GovernorLayer {
        config: ingest_gov_conf.clone(),
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest(
            "/v1/notifications",
            routes::notifications::router().layer(ingest_rate_layer),
        )
        .nest("/v1/presence", routes::presence::router())
        .nest("/v1/sse", routes::sse::router())
        .nest("/v1/templates", routes::templates::router())
        .nest("/v1/admin/queues", routes::admin::router())
        .with_state(app_state.clone())
        .layer(axum::middleware::from_fn(
            middleware::security_headers::security_headers,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(
                    config
                        .server
                        .frontend_url
                        .parse::<HeaderValue>()
                        .expect("invalid FRONTEND_URL for CORS"),
                )
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                    http::Method::PATCH,
                ])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::AUTHORIZATION,
                    http::header::ACCEPT,
                    http::header::HeaderName::from_static("x-api-key"),
                ])
                .allow_credentials(true),
        );

    let host = config.server.host.clone();
    let port = config.server.port;
    let addr = format!("{host}:{port}");

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for handle in background_handles {
        handle.abort();
    }
    app_state.providers.close_all().await;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite connects");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations apply to a fresh in-memory db");

        let config = Config::default();
        let bus = Arc::new(Bus::default());
        let presence = Arc::new(PresenceRegistry::new(config.presence.ttl_seconds));
        let providers = init::build_provider_registry(&config, bus.clone(), presence.clone());

        Arc::new(AppState {
            db: pool,
            config,
            queue: QueueStore::new(),
            presence,
            bus,
            providers,
        })
    }

    fn test_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(routes::health::health_check))
            .nest("/v1/notifications", routes::notifications::router())
            .nest("/v1/presence", routes::presence::router())
            .with_state(state)
    }

    #[tokio::test]
    async fn health_check_reports_ok() {
        let state = test_state().await;
        let app = test_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(AxumBody::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn create_notification_without_api_key_is_rejected() {
        let state = test_state().await;
        let app = test_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/notifications")
                    .header("content-type", "application/json")
                    .body(AxumBody::from(
                        serde_json::json!({
                            "user_id": "u1",
                            "channel": "in_app",
                            "title": "hi",
                            "body": "there",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_notification_with_valid_api_key_is_admitted() {
        use crate::db::models::ApplicationSettings;
        use crate::db::repository::{ApplicationRepository, UserRepository};

        let state = test_state().await;

        let app_row = ApplicationRepository::create(
            &state.db,
            "frn_testkey",
            "whsec_test",
            &ApplicationSettings::default(),
        )
        .await
        .expect("application inserts");

        let user = UserRepository::upsert(&state.db, &app_row.id, None, None, None, None, "UTC")
            .await
            .expect("user inserts");

        let router = test_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/notifications")
                    .header("content-type", "application/json")
                    .header("X-API-Key", "frn_testkey")
                    .body(AxumBody::from(
                        serde_json::json!({
                            "user_id": user.id,
                            "channel": "in_app",
                            "title": "hi",
                            "body": "there",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["channel"], "in_app");
        assert_eq!(json["status"], "queued");
    }
}

fn governor_error_handler(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let body = serde_json::json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": "Rate limit exceeded",
                    "details": { "retry_after_seconds": wait_time }
                }
            })
            .to_string();

            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            resp.headers_mut()
                .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp.headers_mut().insert(
                http::header::RETRY_AFTER,
                HeaderValue::from_str(&wait_time.to_string()).unwrap(),
            );
            resp
        }
        GovernorError::UnableToExtractKey => {
            let body = serde_json::json!({
                "error": {
                    "code": "INVALID_REQUEST",
                    "message": "unable to determine client IP for rate limiting"
                }
            })
            .to_string();
            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            resp.headers_mut()
                .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        GovernorError::Other { code, msg, headers } => {
            let body = msg.unwrap_or_else(|| "rate limiting error".to_string());
            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp
        }
    }
}
