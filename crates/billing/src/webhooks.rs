//! FakePay webhook handling
//!
//! Deliveries are authenticated with an HMAC-SHA256 over the exact raw body
//! before anything is parsed. Each provider event is applied at most once:
//! the payment event row is the idempotency anchor, and the order and
//! subscription changes commit together with it.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use passgate_shared::{OrderStatus, PaymentEvent, PaymentStatus, Store};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::notify::Notifier;
use crate::provisioning::ProvisioningOrchestrator;
use crate::subscriptions::extend_or_create;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-fakepay-signature";

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
        return false;
    };
    let expected = sign_payload(secret, body);
    if expected.is_empty() || expected.len() != signature.len() {
        return false;
    }
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMetadata {
    pub order_id: String,
}

/// Body of a FakePay notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event_id: Uuid,
    pub provider_payment_id: Uuid,
    pub status: PaymentStatus,
    pub amount: i64,
    pub currency: String,
    pub metadata: WebhookMetadata,
}

impl WebhookPayload {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount < 0 {
            return Err(BillingError::Validation(
                "amount must be a non-negative integer".to_string(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(BillingError::Validation("currency is required".to_string()));
        }
        if self.metadata.order_id.trim().is_empty() {
            return Err(BillingError::Validation(
                "metadata.orderId is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub idempotent: bool,
    pub order_id: Uuid,
    pub status: PaymentStatus,
}

/// What the post-commit tasks need after a newly applied successful payment.
#[derive(Debug, Clone)]
struct PaymentNotice {
    user_id: Uuid,
    telegram_id: i64,
    plan_name: String,
    expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    secret: String,
    provisioning: ProvisioningOrchestrator,
    notifier: Arc<dyn Notifier>,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        secret: impl Into<String>,
        provisioning: ProvisioningOrchestrator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            secret: secret.into(),
            provisioning,
            notifier,
        }
    }

    pub fn sign(&self, body: &[u8]) -> String {
        sign_payload(&self.secret, body)
    }

    /// Verify, parse and apply one delivery, then kick off provisioning and
    /// the user notification in the background.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        if raw_body.is_empty() {
            return Err(BillingError::Validation("empty webhook body".to_string()));
        }

        if !verify_signature(&self.secret, raw_body, signature) {
            tracing::warn!(
                security_event = true,
                body_len = raw_body.len(),
                signature_present = signature.is_some(),
                "Rejected FakePay webhook with invalid signature"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let raw: serde_json::Value = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::Validation(format!("invalid JSON: {e}")))?;
        let payload: WebhookPayload = serde_json::from_value(raw.clone())
            .map_err(|e| BillingError::Validation(format!("invalid payload: {e}")))?;
        payload.validate()?;

        let (outcome, notice) = self.apply(&payload, raw).await?;
        if let Some(notice) = notice {
            self.dispatch_post_commit(notice);
        }
        Ok(outcome)
    }

    /// Apply a validated event in one unit of work. Replays of an already
    /// recorded event id change nothing.
    async fn apply(
        &self,
        payload: &WebhookPayload,
        raw_payload: serde_json::Value,
    ) -> BillingResult<(WebhookOutcome, Option<PaymentNotice>)> {
        let now = OffsetDateTime::now_utc();
        let provider_payment_id = payload.provider_payment_id.to_string();
        let not_found = || BillingError::NotFound("Order not found for payment".to_string());

        let order_id = Uuid::parse_str(payload.metadata.order_id.trim()).map_err(|_| not_found())?;

        let mut tx = self.store.begin().await?;
        let order = tx
            .find_order_for_payment(order_id, &provider_payment_id)
            .await?
            .ok_or_else(not_found)?;

        let event = PaymentEvent {
            id: Uuid::new_v4(),
            event_id: payload.event_id.to_string(),
            provider_payment_id: provider_payment_id.clone(),
            status: payload.status,
            amount_cents: payload.amount,
            currency: payload.currency.clone(),
            payload: raw_payload,
            order_id: order.id,
            created_at: now,
        };

        if !tx.insert_payment_event(&event).await? {
            tracing::info!(
                event_id = %payload.event_id,
                order_id = %order.id,
                "Duplicate FakePay event, already processed"
            );
            return Ok((
                WebhookOutcome {
                    idempotent: true,
                    order_id: order.id,
                    status: payload.status,
                },
                None,
            ));
        }

        if payload.amount != order.amount_cents || payload.currency != order.currency {
            tracing::warn!(
                order_id = %order.id,
                expected_amount = order.amount_cents,
                received_amount = payload.amount,
                expected_currency = %order.currency,
                received_currency = %payload.currency,
                "Payment amount differs from order snapshot"
            );
        }

        let notice = match payload.status {
            PaymentStatus::Failed => {
                if order.status.is_terminal() {
                    tracing::info!(
                        order_id = %order.id,
                        status = %order.status,
                        "Ignoring failure for order in terminal state"
                    );
                } else {
                    tx.update_order_status(order.id, OrderStatus::Failed, None, now)
                        .await?;
                    tracing::info!(order_id = %order.id, "Order marked failed");
                }
                None
            }
            PaymentStatus::Succeeded => {
                if order.status != OrderStatus::Paid {
                    tx.update_order_status(order.id, OrderStatus::Paid, Some(now), now)
                        .await?;
                    tracing::info!(order_id = %order.id, "Order marked paid");
                }

                let plan = tx.find_plan(order.plan_id).await?.ok_or_else(|| {
                    BillingError::NotFound(format!("Plan {} not found for order", order.plan_id))
                })?;
                let user = tx.find_user(order.user_id).await?.ok_or_else(|| {
                    BillingError::NotFound(format!("User {} not found for order", order.user_id))
                })?;
                let subscription = extend_or_create(tx.as_mut(), user.id, &plan, now).await?;

                Some(PaymentNotice {
                    user_id: user.id,
                    telegram_id: user.telegram_id,
                    plan_name: plan.name,
                    expires_at: subscription.expires_at,
                })
            }
        };

        tx.commit().await?;

        tracing::info!(
            event_id = %payload.event_id,
            order_id = %order.id,
            status = payload.status.as_str(),
            "FakePay event applied"
        );

        Ok((
            WebhookOutcome {
                idempotent: false,
                order_id: order.id,
                status: payload.status,
            },
            notice,
        ))
    }

    /// Provisioning and notification run detached; their failures are only
    /// logged since the payment is already committed.
    fn dispatch_post_commit(&self, notice: PaymentNotice) {
        let provisioning = self.provisioning.clone();
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            if let Err(e) = provisioning.ensure_provisioned(notice.user_id).await {
                tracing::error!(
                    user_id = %notice.user_id,
                    error = %e,
                    "Provisioning deferred after payment"
                );
            }

            let text = format!(
                "Payment received. Plan: {}. Access until {}.",
                notice.plan_name,
                notice.expires_at.date()
            );
            if let Err(e) = notifier.notify(notice.telegram_id, &text).await {
                tracing::warn!(
                    telegram_id = notice.telegram_id,
                    error = %e,
                    "Failed to send payment notification"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip_and_tamper() {
        let body = br#"{"eventId":"x"}"#;
        let signature = sign_payload("whsec", body);

        assert_eq!(signature.len(), 64);
        assert!(verify_signature("whsec", body, Some(&signature)));
        assert!(!verify_signature("other", body, Some(&signature)));
        assert!(!verify_signature("whsec", br#"{"eventId":"y"}"#, Some(&signature)));
    }

    #[test]
    fn missing_or_truncated_signature_is_rejected() {
        let body = b"{}";
        let signature = sign_payload("s", body);

        assert!(!verify_signature("s", body, None));
        assert!(!verify_signature("s", body, Some("")));
        assert!(!verify_signature("s", body, Some(&signature[..10])));
    }

    #[test]
    fn payload_uses_camel_case_wire_names() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "eventId": "6f1c1c1e-8a6b-4d8e-9d2a-4c4f3f2f1a10",
            "providerPaymentId": "1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed",
            "status": "succeeded",
            "amount": 29900,
            "currency": "RUB",
            "metadata": { "orderId": "abc" }
        }))
        .unwrap();

        assert_eq!(payload.status, PaymentStatus::Succeeded);
        assert_eq!(payload.metadata.order_id, "abc");
        payload.validate().unwrap();
    }

    #[test]
    fn negative_amount_and_blank_currency_fail_validation() {
        let mut payload = WebhookPayload {
            event_id: Uuid::new_v4(),
            provider_payment_id: Uuid::new_v4(),
            status: PaymentStatus::Failed,
            amount: -1,
            currency: "RUB".to_string(),
            metadata: WebhookMetadata {
                order_id: "o".to_string(),
            },
        };
        assert!(matches!(payload.validate(), Err(BillingError::Validation(_))));

        payload.amount = 0;
        payload.currency = " ".to_string();
        assert!(matches!(payload.validate(), Err(BillingError::Validation(_))));
    }

    #[test]
    fn unknown_status_is_not_a_payload() {
        let parsed = serde_json::from_value::<WebhookPayload>(serde_json::json!({
            "eventId": Uuid::new_v4(),
            "providerPaymentId": Uuid::new_v4(),
            "status": "refunded",
            "amount": 1,
            "currency": "RUB",
            "metadata": { "orderId": "abc" }
        }));
        assert!(parsed.is_err());
    }
}
