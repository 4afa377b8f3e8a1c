//! Bot-facing JSON API
//!
//! The bot is a trusted upstream on the internal network; these routes
//! identify users by their Telegram id.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use passgate_billing::{
    CancelOutcome, CreatedOrder, OrderLookup, SubscriptionView, VpnConfigView,
};
use passgate_shared::{Order, OrderStatus, Plan};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramQuery {
    pub telegram_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramRequest {
    pub telegram_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub telegram_id: i64,
    pub plan_id: String,
    pub return_to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReissuePaymentRequest {
    pub return_to: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub duration_days: i32,
    pub price: i64,
    pub currency: String,
}

impl PlanResponse {
    fn from_plan(plan: Plan, currency: &str) -> Self {
        Self {
            id: plan.id,
            code: plan.code,
            name: plan.name,
            duration_days: plan.duration_days,
            price: plan.price_cents,
            currency: currency.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<PlanResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub telegram_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    pub status: OrderStatus,
    pub plan_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub provider_payment_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            status: order.status,
            plan_id: order.plan_id,
            amount: order.amount_cents,
            currency: order.currency,
            provider_payment_id: order.provider_payment_id,
            paid_at: order.paid_at,
            created_at: order.created_at,
        }
    }
}

/// GET /api/plans
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<PlansResponse>> {
    let currency = &state.config.billing.currency;
    let plans = state
        .billing
        .plans
        .list_active()
        .await?
        .into_iter()
        .map(|plan| PlanResponse::from_plan(plan, currency))
        .collect();
    Ok(Json(PlansResponse { plans }))
}

/// POST /api/users/telegram
pub async fn upsert_telegram_user(
    State(state): State<AppState>,
    Json(req): Json<TelegramRequest>,
) -> ApiResult<Json<UserResponse>> {
    validate_telegram_id(req.telegram_id)?;

    let mut tx = state.store.begin().await?;
    let user = tx
        .upsert_user(req.telegram_id, OffsetDateTime::now_utc())
        .await?;
    tx.commit().await?;

    tracing::debug!(user_id = %user.id, telegram_id = user.telegram_id, "User upserted");

    Ok(Json(UserResponse {
        id: user.id,
        telegram_id: user.telegram_id,
        created_at: user.created_at,
    }))
}

/// GET /api/subscription?telegramId=
pub async fn get_subscription(
    State(state): State<AppState>,
    Query(query): Query<TelegramQuery>,
) -> ApiResult<Json<SubscriptionView>> {
    validate_telegram_id(query.telegram_id)?;
    Ok(Json(state.billing.subscriptions.view(query.telegram_id).await?))
}

/// POST /api/orders
pub async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<(StatusCode, Json<CreatedOrder>)> {
    let return_to = sanitize_return_to(req.return_to.as_deref());
    let order = state
        .billing
        .orders
        .create_order(req.telegram_id, &req.plan_id, return_to)
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /api/orders/{id}
///
/// Accepts an order id or a provider payment id.
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OrderResponse>> {
    let orders = &state.billing.orders;
    let order = match Uuid::parse_str(&id) {
        Ok(order_id) => match orders.get_order(OrderLookup::Id(order_id)).await {
            Err(passgate_billing::BillingError::NotFound(_)) => {
                orders.get_order(OrderLookup::ProviderPaymentId(&id)).await?
            }
            other => other?,
        },
        Err(_) => orders.get_order(OrderLookup::ProviderPaymentId(&id)).await?,
    };
    Ok(Json(order.into()))
}

/// POST /api/orders/{id}/payment
pub async fn reissue_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    body: Option<Json<ReissuePaymentRequest>>,
) -> ApiResult<Json<CreatedOrder>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let return_to = sanitize_return_to(req.return_to.as_deref());
    let order = state
        .billing
        .orders
        .reissue_payment_session(order_id, return_to)
        .await?;
    Ok(Json(order))
}

/// POST /api/subscription/renew
pub async fn renew_subscription(
    State(state): State<AppState>,
    Json(req): Json<TelegramRequest>,
) -> ApiResult<(StatusCode, Json<CreatedOrder>)> {
    let order = state
        .billing
        .orders
        .create_renew_order(req.telegram_id, None)
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// POST /api/subscription/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(req): Json<TelegramRequest>,
) -> ApiResult<Json<CancelOutcome>> {
    validate_telegram_id(req.telegram_id)?;
    Ok(Json(state.billing.subscriptions.cancel(req.telegram_id).await?))
}

/// GET /api/vpn/config?telegramId=
pub async fn vpn_config(
    State(state): State<AppState>,
    Query(query): Query<TelegramQuery>,
) -> ApiResult<Json<VpnConfigView>> {
    validate_telegram_id(query.telegram_id)?;
    Ok(Json(
        state.billing.provisioning.vpn_config(query.telegram_id).await?,
    ))
}

pub(crate) fn validate_telegram_id(telegram_id: i64) -> ApiResult<()> {
    if telegram_id <= 0 {
        return Err(ApiError::Validation(
            "telegramId must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

/// Only same-origin paths are accepted as post-payment return targets.
pub(crate) fn sanitize_return_to(return_to: Option<&str>) -> Option<&str> {
    return_to
        .map(str::trim)
        .filter(|path| path.starts_with('/') && !path.starts_with("//") && !path.contains('\\'))
}
