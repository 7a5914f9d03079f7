//! Identity handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use outpost_common::types::IdentityKind;
use outpost_core::VerificationAttributes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListIdentitiesQuery {
    pub identity_type: Option<IdentityKind>,
}

#[derive(Debug, Serialize)]
pub struct IdentityList {
    pub identities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEmailBody {
    pub email_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmEmailBody {
    pub email_address: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyDomainBody {
    pub domain: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationTokenResponse {
    pub verification_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DkimTokensResponse {
    pub dkim_tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DkimEnabledBody {
    pub dkim_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AttributesBody {
    pub identities: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributesResponse {
    pub verification_attributes: BTreeMap<String, VerificationAttributes>,
}

pub async fn list_identities(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListIdentitiesQuery>,
) -> ApiResult<Json<IdentityList>> {
    let identities = state.mailer.list_identities(query.identity_type).await?;
    Ok(Json(IdentityList { identities }))
}

pub async fn verify_email_identity(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyEmailBody>,
) -> ApiResult<(StatusCode, Json<VerificationTokenResponse>)> {
    let verification_token = state
        .mailer
        .verify_email_identity(&body.email_address)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(VerificationTokenResponse { verification_token }),
    ))
}

pub async fn confirm_email_identity(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfirmEmailBody>,
) -> ApiResult<StatusCode> {
    state
        .mailer
        .confirm_email_identity(&body.email_address, &body.token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn verify_domain_identity(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyDomainBody>,
) -> ApiResult<(StatusCode, Json<VerificationTokenResponse>)> {
    let verification_token = state.mailer.verify_domain_identity(&body.domain).await?;
    Ok((
        StatusCode::CREATED,
        Json(VerificationTokenResponse { verification_token }),
    ))
}

pub async fn verify_domain_dkim(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<DkimTokensResponse>> {
    let dkim_tokens = state.mailer.verify_domain_dkim(&domain).await?;
    Ok(Json(DkimTokensResponse { dkim_tokens }))
}

pub async fn set_identity_dkim_enabled(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    Json(body): Json<DkimEnabledBody>,
) -> ApiResult<StatusCode> {
    state
        .mailer
        .set_identity_dkim_enabled(&identity, body.dkim_enabled)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_identity_verification_attributes(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AttributesBody>,
) -> ApiResult<Json<AttributesResponse>> {
    let verification_attributes = state
        .mailer
        .get_identity_verification_attributes(&body.identities)
        .await?;
    Ok(Json(AttributesResponse {
        verification_attributes,
    }))
}

pub async fn delete_identity(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<StatusCode> {
    state.mailer.delete_identity(&identity).await?;
    Ok(StatusCode::NO_CONTENT)
}
