use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::Template;
use crate::error::{AppError, AppResult};

const TEMPLATE_COLUMNS: &str =
    "id, app_id, name, locale, channel, subject, body, variables_json, version, status, created_at, updated_at";

pub struct TemplateRepository;

impl TemplateRepository {
    /// Creates the first (`version = 1`, `active`) row for an
    /// (`app_id`, `name`, `channel`, `locale`) tuple. Fails on the partial
    /// unique index if an active version already exists — use
    /// `activate_new_version` to supersede it instead.
    pub async fn create(
        pool: &SqlitePool,
        app_id: &str,
        name: &str,
        locale: &str,
        channel: &str,
        subject: Option<&str>,
        body: &str,
        variables: &[String],
    ) -> AppResult<Template> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let variables_json = serde_json::to_string(variables).map_err(|e| AppError::Internal(e.into()))?;

        let query = format!(
            r#"
            INSERT INTO templates (id, app_id, name, locale, channel, subject, body, variables_json, version, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, 'active', ?, ?)
            RETURNING {TEMPLATE_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Template>(&query)
            .bind(id)
            .bind(app_id)
            .bind(name)
            .bind(locale)
            .bind(channel)
            .bind(subject)
            .bind(body)
            .bind(variables_json)
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, app_id: &str, id: &str) -> AppResult<Template> {
        let query = format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ? AND app_id = ?");
        sqlx::query_as::<_, Template>(&query)
            .bind(id)
            .bind(app_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("template {id} not found")))
    }

    /// Resolve a template by (app, name, channel, locale), falling back to
    /// the app's default locale row when the requested locale is absent.
    pub async fn find_for_send(
        pool: &SqlitePool,
        app_id: &str,
        name: &str,
        channel: &str,
        locale: &str,
    ) -> AppResult<Template> {
        let query = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM templates \
             WHERE app_id = ? AND name = ? AND channel = ? AND locale = ? AND status = 'active'"
        );
        if let Some(t) = sqlx::query_as::<_, Template>(&query)
            .bind(app_id)
            .bind(name)
            .bind(channel)
            .bind(locale)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
        {
            return Ok(t);
        }

        let fallback_query = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM templates \
             WHERE app_id = ? AND name = ? AND channel = ? AND status = 'active' \
             ORDER BY locale = 'en' DESC LIMIT 1"
        );
        sqlx::query_as::<_, Template>(&fallback_query)
            .bind(app_id)
            .bind(name)
            .bind(channel)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| {
                AppError::NotFound(format!("template '{name}' for channel '{channel}' not found"))
            })
    }

    /// Filtered admin listing, scoped to one app.
    pub async fn list_by_filter(
        pool: &SqlitePool,
        app_id: &str,
        name: Option<&str>,
        channel: Option<&str>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Template>> {
        let mut query = format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE app_id = ?");
        if name.is_some() {
            query.push_str(" AND name = ?");
        }
        if channel.is_some() {
            query.push_str(" AND channel = ?");
        }
        if status.is_some() {
            query.push_str(" AND status = ?");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<_, Template>(&query).bind(app_id);
        if let Some(n) = name {
            q = q.bind(n);
        }
        if let Some(c) = channel {
            q = q.bind(c);
        }
        if let Some(s) = status {
            q = q.bind(s);
        }
        q.bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Supersedes the current active version of (`app_id`, `name`, `channel`,
    /// `locale`) with a new one: deactivates the prior active row and
    /// inserts the next version as `active`, in one transaction, so a
    /// concurrent read never observes two active rows (or zero). Unlike the
    /// old in-place `UPDATE ... SET version = version + 1`, this preserves
    /// every prior version as its own row.
    pub async fn activate_new_version(
        pool: &SqlitePool,
        app_id: &str,
        name: &str,
        channel: &str,
        locale: &str,
        subject: Option<&str>,
        body: &str,
        variables: &[String],
    ) -> AppResult<Template> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let now = Utc::now().naive_utc();
        let variables_json = serde_json::to_string(variables).map_err(|e| AppError::Internal(e.into()))?;

        let latest: Option<(String, i64, String)> = sqlx::query_as(
            "SELECT id, version, status FROM templates \
             WHERE app_id = ? AND name = ? AND channel = ? AND locale = ? \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(app_id)
        .bind(name)
        .bind(channel)
        .bind(locale)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let next_version = match &latest {
            Some((prior_id, version, status)) => {
                if status == "active" {
                    sqlx::query("UPDATE templates SET status = 'inactive', updated_at = ? WHERE id = ?")
                        .bind(now)
                        .bind(prior_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(AppError::Database)?;
                }
                version + 1
            }
            None => 1,
        };

        let id = Uuid::new_v4().to_string();
        let query = format!(
            r#"
            INSERT INTO templates (id, app_id, name, locale, channel, subject, body, variables_json, version, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            RETURNING {TEMPLATE_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, Template>(&query)
            .bind(id)
            .bind(app_id)
            .bind(name)
            .bind(locale)
            .bind(channel)
            .bind(subject)
            .bind(body)
            .bind(variables_json)
            .bind(next_version)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(created)
    }
}
