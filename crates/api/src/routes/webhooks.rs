//! FakePay webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use passgate_billing::{WebhookOutcome, SIGNATURE_HEADER};

use crate::{error::ApiResult, state::AppState};

/// POST /api/webhooks/fakepay
///
/// The signature covers the raw body, so the body is taken as bytes and
/// handed over untouched.
pub async fn fakepay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.billing.webhooks.handle(&body, signature).await?;
    Ok(Json(outcome))
}
