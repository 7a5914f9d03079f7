//! Message lookup, cancellation and complaint feedback

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use outpost_common::types::MessageId;
use outpost_core::{MessageRecord, PublishOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintBody {
    pub feedback_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ComplaintResponse {
    /// False when the complaint was already recorded
    pub published: bool,
}

pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
) -> ApiResult<Json<MessageRecord>> {
    Ok(Json(state.mailer.get_message(id)?))
}

pub async fn cancel_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
) -> ApiResult<Json<MessageRecord>> {
    Ok(Json(state.mailer.cancel_message(id)?))
}

pub async fn record_complaint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
    body: Option<Json<ComplaintBody>>,
) -> ApiResult<(StatusCode, Json<ComplaintResponse>)> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let outcome = state.mailer.record_complaint(id, body.feedback_type).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ComplaintResponse {
            published: outcome == PublishOutcome::Published,
        }),
    ))
}
