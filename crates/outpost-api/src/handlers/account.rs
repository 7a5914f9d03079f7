//! Account-level quota, statistics and the sending switch

use axum::{extract::State, http::StatusCode, Json};
use outpost_common::types::SendQuota;
use outpost_core::SendStatisticsSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct SendingEnabled {
    pub enabled: bool,
}

pub async fn get_send_quota(State(state): State<Arc<AppState>>) -> ApiResult<Json<SendQuota>> {
    Ok(Json(state.mailer.get_send_quota()?))
}

pub async fn get_send_statistics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SendStatisticsSnapshot>> {
    Ok(Json(state.mailer.get_send_statistics()?))
}

pub async fn get_sending_enabled(State(state): State<Arc<AppState>>) -> Json<SendingEnabled> {
    Json(SendingEnabled {
        enabled: state.mailer.account_sending_enabled(),
    })
}

pub async fn update_sending_enabled(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendingEnabled>,
) -> ApiResult<StatusCode> {
    state.mailer.update_account_sending_enabled(body.enabled)?;
    Ok(StatusCode::NO_CONTENT)
}
