//! Configuration set handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use outpost_storage::{ConfigurationSet, EventDestination};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConfigurationSetBody {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSetList {
    pub configuration_sets: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendingEnabledBody {
    pub enabled: bool,
}

/// `null` or a missing field clears the tracking domain
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingDomainBody {
    #[serde(default)]
    pub custom_redirect_domain: Option<String>,
}

pub async fn list_configuration_sets(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ConfigurationSetList>> {
    let configuration_sets = state.mailer.list_configuration_sets().await?;
    Ok(Json(ConfigurationSetList { configuration_sets }))
}

pub async fn create_configuration_set(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConfigurationSetBody>,
) -> ApiResult<(StatusCode, Json<ConfigurationSet>)> {
    let set = state.mailer.create_configuration_set(&body.name).await?;
    Ok((StatusCode::CREATED, Json(set)))
}

pub async fn describe_configuration_set(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ConfigurationSet>> {
    Ok(Json(state.mailer.describe_configuration_set(&name).await?))
}

pub async fn delete_configuration_set(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.mailer.delete_configuration_set(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_sending_enabled(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SendingEnabledBody>,
) -> ApiResult<StatusCode> {
    state
        .mailer
        .update_configuration_set_sending_enabled(&name, body.enabled)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_tracking_domain(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<TrackingDomainBody>,
) -> ApiResult<Json<ConfigurationSet>> {
    let set = state
        .mailer
        .set_configuration_set_tracking_domain(&name, body.custom_redirect_domain.as_deref())
        .await?;
    Ok(Json(set))
}

pub async fn create_event_destination(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(destination): Json<EventDestination>,
) -> ApiResult<(StatusCode, Json<ConfigurationSet>)> {
    let set = state
        .mailer
        .create_configuration_set_event_destination(&name, destination)
        .await?;
    Ok((StatusCode::CREATED, Json(set)))
}

pub async fn delete_event_destination(
    State(state): State<Arc<AppState>>,
    Path((name, destination)): Path<(String, String)>,
) -> ApiResult<Json<ConfigurationSet>> {
    let set = state
        .mailer
        .delete_configuration_set_event_destination(&name, &destination)
        .await?;
    Ok(Json(set))
}
