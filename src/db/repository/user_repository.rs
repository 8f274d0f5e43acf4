use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Device, User, UserPreferences};
use crate::error::{AppError, AppResult};

pub struct UserRepository;

impl UserRepository {
    pub async fn upsert(
        pool: &SqlitePool,
        app_id: &str,
        external_id: Option<&str>,
        email: Option<&str>,
        phone: Option<&str>,
        webhook_url: Option<&str>,
        timezone: &str,
    ) -> AppResult<User> {
        let now = Utc::now().naive_utc();

        if let Some(ext) = external_id {
            if let Some(existing) = Self::find_by_id(pool, ext, app_id).await.ok() {
                return sqlx::query_as::<_, User>(
                    r#"
                    UPDATE users SET email = ?, phone = ?, webhook_url = ?, timezone = ?, updated_at = ?
                    WHERE id = ?
                    RETURNING id, app_id, email, phone, webhook_url, devices_json, preferences_json, timezone, created_at, updated_at
                    "#,
                )
                .bind(email)
                .bind(phone)
                .bind(webhook_url)
                .bind(timezone)
                .bind(now)
                .bind(&existing.id)
                .fetch_one(pool)
                .await
                .map_err(AppError::Database);
            }
        }

        let id = external_id
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let devices_json = serde_json::to_string::<Vec<Device>>(&Vec::new()).unwrap();
        let preferences_json = serde_json::to_string(&UserPreferences::default()).unwrap();

        let row = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, app_id, email, phone, webhook_url, devices_json, preferences_json, timezone, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, app_id, email, phone, webhook_url, devices_json, preferences_json, timezone, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(app_id)
        .bind(email)
        .bind(phone)
        .bind(webhook_url)
        .bind(devices_json)
        .bind(preferences_json)
        .bind(timezone)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Scoped by `app_id` as well as `id`: `User.id` is caller-observable
    /// (the external id callers pass when creating notifications), so an
    /// unscoped lookup would let one app address another app's user by id.
    pub async fn find_by_id(pool: &SqlitePool, id: &str, app_id: &str) -> AppResult<User> {
        sqlx::query_as::<_, User>(
            "SELECT id, app_id, email, phone, webhook_url, devices_json, preferences_json, timezone, created_at, updated_at \
             FROM users WHERE id = ? AND app_id = ?",
        )
        .bind(id)
        .bind(app_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("user {id} not found")))
    }

    pub async fn update_preferences(
        pool: &SqlitePool,
        id: &str,
        app_id: &str,
        preferences: &UserPreferences,
    ) -> AppResult<User> {
        let now = Utc::now().naive_utc();
        let preferences_json =
            serde_json::to_string(preferences).map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET preferences_json = ?, updated_at = ?
            WHERE id = ? AND app_id = ?
            RETURNING id, app_id, email, phone, webhook_url, devices_json, preferences_json, timezone, created_at, updated_at
            "#,
        )
        .bind(preferences_json)
        .bind(now)
        .bind(id)
        .bind(app_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("user {id} not found")))
    }

    /// All users of an application, for broadcast sends.
    pub async fn list_by_app(pool: &SqlitePool, app_id: &str) -> AppResult<Vec<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, app_id, email, phone, webhook_url, devices_json, preferences_json, timezone, created_at, updated_at \
             FROM users WHERE app_id = ?",
        )
        .bind(app_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn register_device(pool: &SqlitePool, id: &str, app_id: &str, device: Device) -> AppResult<User> {
        let user = Self::find_by_id(pool, id, app_id).await?;
        let mut devices = user.devices();
        devices.retain(|d| d.token != device.token);
        devices.push(device);
        let devices_json = serde_json::to_string(&devices).map_err(|e| AppError::Internal(e.into()))?;
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET devices_json = ?, updated_at = ?
            WHERE id = ? AND app_id = ?
            RETURNING id, app_id, email, phone, webhook_url, devices_json, preferences_json, timezone, created_at, updated_at
            "#,
        )
        .bind(devices_json)
        .bind(now)
        .bind(id)
        .bind(app_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("user {id} not found")))
    }
}
