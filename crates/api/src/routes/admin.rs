//! Admin and trusted-bot routes
//!
//! Mounted behind [`crate::auth::require_admin`].

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::api::{validate_telegram_id, TelegramQuery, TelegramRequest};
use crate::{auth::AccessLink, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
    pub user_id: Uuid,
    pub client_id: String,
    pub vless_uri: String,
    pub subscription_url: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_provisioned_at: Option<OffsetDateTime>,
}

/// POST /api/admin/provision?telegramId=
pub async fn provision(
    State(state): State<AppState>,
    Query(query): Query<TelegramQuery>,
) -> ApiResult<Json<ProvisionResponse>> {
    validate_telegram_id(query.telegram_id)?;

    let account = state
        .billing
        .provisioning
        .ensure_provisioned_for_telegram(query.telegram_id)
        .await?;

    tracing::info!(
        telegram_id = query.telegram_id,
        client_id = %account.xui_client_id,
        "Admin provisioning completed"
    );

    Ok(Json(ProvisionResponse {
        user_id: account.user_id,
        client_id: account.xui_client_id,
        vless_uri: account.vless_uri,
        subscription_url: account.subscription_url,
        last_provisioned_at: account.last_provisioned_at,
    }))
}

/// POST /api/profile/links
pub async fn issue_profile_link(
    State(state): State<AppState>,
    Json(req): Json<TelegramRequest>,
) -> ApiResult<Json<AccessLink>> {
    let link = state.profiles.issue_access_token(req.telegram_id).await?;
    Ok(Json(link))
}
