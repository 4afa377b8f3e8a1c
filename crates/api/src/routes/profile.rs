//! Self-service profile pages
//!
//! Entered through a single-use access link from the bot; afterwards the
//! browser carries a session cookie scoped to `/profile`.

use axum::{
    extract::{Path, Query, State},
    http::{header::SET_COOKIE, HeaderMap},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    Json,
};
use passgate_billing::{BillingError, EntitlementStatus, VpnConfigView};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::{
        clear_session_cookie, cookie_value, expired_page, session_cookie, ProfileUser,
        SESSION_COOKIE,
    },
    error::{ApiError, ApiResult},
    state::AppState,
};

const PROFILE_PATH: &str = "/profile";

#[derive(Debug, Default, Deserialize)]
pub struct ProfileQuery {
    pub canceled: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub telegram_id: i64,
    pub status: EntitlementStatus,
    pub plan_name: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub days_left: i64,
    pub has_any_subscription: bool,
    /// The entitlement is live but no connection has been set up yet.
    pub needs_setup: bool,
    pub canceled: bool,
}

/// GET /profile/access/{token}
pub async fn access(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Response> {
    let secure = state.config.secure_cookies();

    let Some(session) = state.profiles.consume_token(&token).await? else {
        return Ok(expired_page(state.config.bot_url(), secure));
    };

    Ok((
        AppendHeaders([(SET_COOKIE, session_cookie(&session.session_key, secure))]),
        Redirect::to(PROFILE_PATH),
    )
        .into_response())
}

/// GET /profile
pub async fn show(
    State(state): State<AppState>,
    ProfileUser(session): ProfileUser,
    Query(query): Query<ProfileQuery>,
) -> ApiResult<Json<ProfileView>> {
    let view = state
        .billing
        .subscriptions
        .view(session.telegram_id)
        .await?;

    let needs_setup = match view.status {
        EntitlementStatus::Active => {
            let mut tx = state.store.begin().await?;
            let account = tx.find_vpn_account(session.user_id).await?;
            !matches!(account, Some(account) if account.deleted_at.is_none())
        }
        EntitlementStatus::Expired | EntitlementStatus::Blocked => false,
    };

    Ok(Json(ProfileView {
        telegram_id: session.telegram_id,
        status: view.status,
        plan_name: view.plan_title,
        expires_at: view.expires_at,
        days_left: view.days_left,
        has_any_subscription: view.expires_at.is_some(),
        needs_setup,
        canceled: query.canceled.is_some_and(|v| v == "1"),
    }))
}

/// GET /profile/setup
pub async fn setup(
    State(state): State<AppState>,
    ProfileUser(session): ProfileUser,
) -> ApiResult<Json<VpnConfigView>> {
    let config = state
        .billing
        .provisioning
        .vpn_config(session.telegram_id)
        .await?;
    Ok(Json(config))
}

/// POST /profile/actions/renew
///
/// Renews the live plan; with nothing live, buys the most recent plan again.
pub async fn renew(
    State(state): State<AppState>,
    ProfileUser(session): ProfileUser,
) -> ApiResult<Redirect> {
    let orders = &state.billing.orders;
    let return_to = Some(PROFILE_PATH);

    let order = match orders
        .create_renew_order(session.telegram_id, return_to)
        .await
    {
        Ok(order) => order,
        Err(BillingError::NotFound(_)) => {
            let view = state
                .billing
                .subscriptions
                .view(session.telegram_id)
                .await?;
            let plan_id = view
                .plan_id
                .ok_or_else(|| ApiError::NotFound("No plan to renew".to_string()))?;
            orders
                .create_order(session.telegram_id, &plan_id.to_string(), return_to)
                .await?
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Redirect::to(&order.payment_url))
}

/// POST /profile/actions/cancel
pub async fn cancel(
    State(state): State<AppState>,
    ProfileUser(session): ProfileUser,
) -> ApiResult<Redirect> {
    let outcome = state
        .billing
        .subscriptions
        .cancel(session.telegram_id)
        .await?;

    tracing::info!(
        user_id = %session.user_id,
        deprovision = ?outcome.deprovision,
        "Subscription canceled from profile"
    );

    Ok(Redirect::to("/profile?canceled=1"))
}

/// POST /profile/logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    if let Some(session_key) = cookie_value(&headers, SESSION_COOKIE) {
        state.profiles.clear(&session_key).await?;
    }

    Ok((
        AppendHeaders([(
            SET_COOKIE,
            clear_session_cookie(state.config.secure_cookies()),
        )]),
        Redirect::to(PROFILE_PATH),
    )
        .into_response())
}
