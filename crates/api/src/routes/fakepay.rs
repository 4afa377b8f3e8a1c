//! FakePay mock provider
//!
//! Stands in for a real payment provider during development: the checkout
//! page summarises the order and completing it emits a signed notification
//! that goes through the regular webhook processor.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use passgate_billing::{OrderLookup, WebhookMetadata, WebhookPayload};
use passgate_shared::{OrderStatus, PaymentStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::api::sanitize_return_to;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutQuery {
    pub return_to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteQuery {
    pub result: Option<PaymentStatus>,
    pub return_to: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutView {
    pub provider_payment_id: String,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub amount: i64,
    pub currency: String,
    pub succeed_url: String,
    pub fail_url: String,
}

/// GET /fakepay/checkout/{providerPaymentId}
pub async fn checkout(
    State(state): State<AppState>,
    Path(provider_payment_id): Path<String>,
    Query(query): Query<CheckoutQuery>,
) -> ApiResult<Json<CheckoutView>> {
    let order = state
        .billing
        .orders
        .get_order(OrderLookup::ProviderPaymentId(&provider_payment_id))
        .await?;

    let return_to = sanitize_return_to(query.return_to.as_deref());
    let complete_url = |result: PaymentStatus| {
        let mut query = url_query(result, return_to);
        query.insert(0, '?');
        format!(
            "{}/fakepay/complete/{}{}",
            state.config.billing.app_base_url, provider_payment_id, query
        )
    };

    Ok(Json(CheckoutView {
        succeed_url: complete_url(PaymentStatus::Succeeded),
        fail_url: complete_url(PaymentStatus::Failed),
        provider_payment_id: provider_payment_id.clone(),
        order_id: order.id,
        status: order.status,
        amount: order.amount_cents,
        currency: order.currency,
    }))
}

/// POST /fakepay/complete/{providerPaymentId}?result=succeeded|failed
pub async fn complete(
    State(state): State<AppState>,
    Path(provider_payment_id): Path<String>,
    Query(query): Query<CompleteQuery>,
) -> ApiResult<Response> {
    let order = state
        .billing
        .orders
        .get_order(OrderLookup::ProviderPaymentId(&provider_payment_id))
        .await?;
    let provider_payment_id = Uuid::parse_str(&provider_payment_id)
        .map_err(|_| ApiError::Validation("providerPaymentId must be a UUID".to_string()))?;

    let payload = WebhookPayload {
        event_id: Uuid::new_v4(),
        provider_payment_id,
        status: query.result.unwrap_or(PaymentStatus::Succeeded),
        amount: order.amount_cents,
        currency: order.currency,
        metadata: WebhookMetadata {
            order_id: order.id.to_string(),
        },
    };
    let body = serde_json::to_vec(&payload)
        .map_err(|e| ApiError::Internal(format!("failed to encode payload: {e}")))?;
    let signature = state.billing.webhooks.sign(&body);

    tracing::info!(
        order_id = %order.id,
        event_id = %payload.event_id,
        status = payload.status.as_str(),
        "FakePay checkout completed"
    );

    let outcome = state
        .billing
        .webhooks
        .handle(&body, Some(&signature))
        .await?;

    match sanitize_return_to(query.return_to.as_deref()) {
        Some(return_to) => Ok(Redirect::to(return_to).into_response()),
        None => Ok(Json(outcome).into_response()),
    }
}

fn url_query(result: PaymentStatus, return_to: Option<&str>) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("result", result.as_str());
    if let Some(return_to) = return_to {
        query.append_pair("returnTo", return_to);
    }
    query.finish()
}
