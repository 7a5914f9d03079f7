//! Template management handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use outpost_common::Error;
use outpost_storage::{Template, TemplateContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TemplateList {
    pub templates: Vec<Template>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRenderBody {
    #[serde(default)]
    pub template_data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRenderResponse {
    pub rendered_template: String,
}

pub async fn list_templates(State(state): State<Arc<AppState>>) -> ApiResult<Json<TemplateList>> {
    let templates = state.mailer.list_templates().await?;
    Ok(Json(TemplateList { templates }))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(content): Json<TemplateContent>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let template = state.mailer.create_template(content).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Template>> {
    Ok(Json(state.mailer.get_template(&name).await?))
}

/// The path names the template; a differing body name is rejected
pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(content): Json<TemplateContent>,
) -> ApiResult<Json<Template>> {
    if content.name != name {
        return Err(Error::InvalidParameter(format!(
            "template name {} does not match path {}",
            content.name, name
        ))
        .into());
    }
    Ok(Json(state.mailer.update_template(content).await?))
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.mailer.delete_template(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn test_render_template(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<TestRenderBody>,
) -> ApiResult<Json<TestRenderResponse>> {
    let rendered_template = state
        .mailer
        .test_render_template(&name, &body.template_data)
        .await?;
    Ok(Json(TestRenderResponse { rendered_template }))
}
