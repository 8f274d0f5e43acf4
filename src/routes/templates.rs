use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::db::models::Template;
use crate::db::repository::TemplateRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::ApiKeyAuth;
use crate::template_engine;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", axum::routing::post(create_template).get(list_templates))
        .route("/:id", get(get_template).put(update_template))
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub variables: Vec<String>,
}

fn default_locale() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub variables: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTemplatesQuery {
    pub name: Option<String>,
    pub channel: Option<String>,
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TemplateResponse {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub locale: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub variables: Vec<String>,
    pub version: i64,
    pub status: String,
}

impl From<Template> for TemplateResponse {
    fn from(t: Template) -> Self {
        Self {
            id: t.id.clone(),
            app_id: t.app_id.clone(),
            name: t.name.clone(),
            locale: t.locale.clone(),
            channel: t.channel.clone(),
            subject: t.subject.clone(),
            body: t.body.clone(),
            variables: t.variables(),
            version: t.version,
            status: t.status.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TemplatesListResponse {
    pub items: Vec<TemplateResponse>,
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Json(req): Json<CreateTemplateRequest>,
) -> AppResult<Json<TemplateResponse>> {
    crate::db::models::Channel::parse(&req.channel)
        .ok_or_else(|| AppError::Validation(format!("invalid channel: {}", req.channel)))?;
    template_engine::validate(req.subject.as_deref(), &req.body, &req.variables)?;

    let template = TemplateRepository::create(
        &state.db,
        &app.id,
        &req.name,
        &req.locale,
        &req.channel,
        req.subject.as_deref(),
        &req.body,
        &req.variables,
    )
    .await?;

    Ok(Json(template.into()))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Path(id): Path<String>,
) -> AppResult<Json<TemplateResponse>> {
    let template = TemplateRepository::find_by_id(&state.db, &app.id, &id).await?;
    Ok(Json(template.into()))
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Query(query): Query<ListTemplatesQuery>,
) -> AppResult<Json<TemplatesListResponse>> {
    let per_page = query.per_page.unwrap_or(50).clamp(1, 200);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * per_page;

    let templates = TemplateRepository::list_by_filter(
        &state.db,
        &app.id,
        query.name.as_deref(),
        query.channel.as_deref(),
        query.status.as_deref(),
        per_page,
        offset,
    )
    .await?;

    Ok(Json(TemplatesListResponse {
        items: templates.into_iter().map(Into::into).collect(),
    }))
}

/// Supersedes the active version of the template identified by `id` with a
/// new one carrying the submitted body: the prior version is kept, marked
/// `inactive`, and ingestion picks up the new active row on its next render.
async fn update_template(
    State(state): State<Arc<AppState>>,
    ApiKeyAuth(app): ApiKeyAuth,
    Path(id): Path<String>,
    Json(req): Json<UpdateTemplateRequest>,
) -> AppResult<Json<TemplateResponse>> {
    let existing = TemplateRepository::find_by_id(&state.db, &app.id, &id).await?;
    template_engine::validate(req.subject.as_deref(), &req.body, &req.variables)?;

    let template = TemplateRepository::activate_new_version(
        &state.db,
        &app.id,
        &existing.name,
        &existing.channel,
        &existing.locale,
        req.subject.as_deref(),
        &req.body,
        &req.variables,
    )
    .await?;

    Ok(Json(template.into()))
}
