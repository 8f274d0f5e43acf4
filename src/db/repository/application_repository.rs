use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Application, ApplicationSettings};
use crate::error::{AppError, AppResult};

pub struct ApplicationRepository;

impl ApplicationRepository {
    pub async fn create(
        pool: &SqlitePool,
        api_key: &str,
        webhook_signing_secret: &str,
        settings: &ApplicationSettings,
    ) -> AppResult<Application> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let settings_json = serde_json::to_string(settings).map_err(|e| AppError::Internal(e.into()))?;

        let row = sqlx::query_as::<_, Application>(
            r#"
            INSERT INTO applications (id, api_key, webhook_signing_secret, settings_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, api_key, webhook_signing_secret, settings_json, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(api_key)
        .bind(webhook_signing_secret)
        .bind(settings_json)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Application> {
        sqlx::query_as::<_, Application>(
            "SELECT id, api_key, webhook_signing_secret, settings_json, created_at, updated_at \
             FROM applications WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("application {id} not found")))
    }

    pub async fn find_by_api_key(pool: &SqlitePool, api_key: &str) -> AppResult<Option<Application>> {
        sqlx::query_as::<_, Application>(
            "SELECT id, api_key, webhook_signing_secret, settings_json, created_at, updated_at \
             FROM applications WHERE api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn update_settings(
        pool: &SqlitePool,
        id: &str,
        settings: &ApplicationSettings,
    ) -> AppResult<Application> {
        let now = Utc::now().naive_utc();
        let settings_json = serde_json::to_string(settings).map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query_as::<_, Application>(
            r#"
            UPDATE applications SET settings_json = ?, updated_at = ?
            WHERE id = ?
            RETURNING id, api_key, webhook_signing_secret, settings_json, created_at, updated_at
            "#,
        )
        .bind(settings_json)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("application {id} not found")))
    }
}
