//! Send handlers

use axum::{extract::State, http::StatusCode, Json};
use base64::Engine;
use outpost_common::types::MessageId;
use outpost_common::Error;
use outpost_core::{
    BulkOutcome, RawEmailRequest, SendBulkTemplatedEmailRequest, SendEmailRequest,
    SendTemplatedEmailRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub message_id: MessageId,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub status: Vec<BulkOutcome>,
}

/// Raw MIME bytes, base64 encoded
#[derive(Debug, Deserialize)]
pub struct RawMessage {
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRawEmailBody {
    pub raw_message: RawMessage,
    #[serde(default)]
    pub destinations: Vec<String>,
    pub source: Option<String>,
    pub source_arn: Option<String>,
    pub from_arn: Option<String>,
    pub return_path_arn: Option<String>,
    pub configuration_set: Option<String>,
}

impl SendRawEmailBody {
    fn into_request(self) -> Result<RawEmailRequest, Error> {
        let raw_message = base64::engine::general_purpose::STANDARD
            .decode(self.raw_message.data.trim())
            .map_err(|e| Error::InvalidParameter(format!("rawMessage.data is not base64: {}", e)))?;

        Ok(RawEmailRequest {
            raw_message,
            destinations: self.destinations,
            source: self.source,
            source_arn: self.source_arn,
            from_arn: self.from_arn,
            return_path_arn: self.return_path_arn,
            configuration_set: self.configuration_set,
        })
    }
}

pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendEmailRequest>,
) -> ApiResult<(StatusCode, Json<SendResponse>)> {
    let message_id = state.mailer.send_email(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SendResponse { message_id })))
}

pub async fn send_templated_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendTemplatedEmailRequest>,
) -> ApiResult<(StatusCode, Json<SendResponse>)> {
    let message_id = state.mailer.send_templated_email(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SendResponse { message_id })))
}

pub async fn send_bulk_templated_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendBulkTemplatedEmailRequest>,
) -> ApiResult<Json<BulkResponse>> {
    let status = state.mailer.send_bulk_templated_email(request).await?;
    Ok(Json(BulkResponse { status }))
}

pub async fn send_raw_email(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendRawEmailBody>,
) -> ApiResult<(StatusCode, Json<SendResponse>)> {
    let message_id = state.mailer.send_raw_email(body.into_request()?).await?;
    Ok((StatusCode::ACCEPTED, Json(SendResponse { message_id })))
}
