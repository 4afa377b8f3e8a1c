//! Order manager
//!
//! Orders are created in two steps: the pending order (with its price
//! snapshot) commits first, then a payment session is opened and its id is
//! recorded against the order. An order left without a session can be
//! recovered with [`OrderManager::reissue_payment_session`].

use std::sync::Arc;

use passgate_shared::{Order, OrderStatus, Plan, Store};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payment::PaymentGateway;

/// A pending order together with its checkout link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub payment_url: String,
}

#[derive(Debug, Clone, Copy)]
pub enum OrderLookup<'a> {
    Id(Uuid),
    ProviderPaymentId(&'a str),
}

#[derive(Clone)]
pub struct OrderManager {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl OrderManager {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into(),
        }
    }

    /// Create a purchase order for a plan referenced by id or code.
    pub async fn create_order(
        &self,
        telegram_id: i64,
        plan_ref: &str,
        return_to: Option<&str>,
    ) -> BillingResult<CreatedOrder> {
        validate_telegram_id(telegram_id)?;
        let plan_ref = plan_ref.trim();
        if plan_ref.is_empty() {
            return Err(BillingError::Validation("planId is required".to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self.store.begin().await?;
        let user = tx.upsert_user(telegram_id, now).await?;
        let plan = tx
            .find_active_plan(plan_ref)
            .await?
            .ok_or_else(|| BillingError::NotFound("Plan not found".to_string()))?;
        let order = self.pending_order(user.id, &plan, now);
        tx.insert_order(&order).await?;
        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            telegram_id,
            plan = %plan.code,
            amount = order.amount_cents,
            "Order created"
        );

        self.open_payment_session(&order, return_to).await
    }

    /// Create a renewal order for the plan of the live subscription.
    pub async fn create_renew_order(
        &self,
        telegram_id: i64,
        return_to: Option<&str>,
    ) -> BillingResult<CreatedOrder> {
        validate_telegram_id(telegram_id)?;
        let nothing_to_renew =
            || BillingError::NotFound("No active subscription to renew".to_string());

        let now = OffsetDateTime::now_utc();
        let mut tx = self.store.begin().await?;
        let user = tx
            .find_user_by_telegram_id(telegram_id)
            .await?
            .ok_or_else(nothing_to_renew)?;
        let plan_id = tx
            .live_subscription(user.id, now)
            .await?
            .and_then(|s| s.plan_id)
            .ok_or_else(nothing_to_renew)?;
        let plan = tx
            .find_plan(plan_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| BillingError::NotFound("Plan not found for renewal".to_string()))?;
        let order = self.pending_order(user.id, &plan, now);
        tx.insert_order(&order).await?;
        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            telegram_id,
            plan = %plan.code,
            "Renewal order created"
        );

        self.open_payment_session(&order, return_to).await
    }

    pub async fn get_order(&self, lookup: OrderLookup<'_>) -> BillingResult<Order> {
        let mut tx = self.store.begin().await?;
        let order = match lookup {
            OrderLookup::Id(id) => tx.find_order(id).await?,
            OrderLookup::ProviderPaymentId(id) => tx.find_order_by_provider_payment_id(id).await?,
        };
        order.ok_or_else(|| BillingError::NotFound("Order not found".to_string()))
    }

    /// Checkout link for a pending order, opening a payment session if the
    /// order never got one.
    pub async fn reissue_payment_session(
        &self,
        order_id: Uuid,
        return_to: Option<&str>,
    ) -> BillingResult<CreatedOrder> {
        let order = self.get_order(OrderLookup::Id(order_id)).await?;
        if order.status != OrderStatus::PendingPayment {
            return Err(BillingError::Conflict(format!(
                "order {} is already {}",
                order.id, order.status
            )));
        }

        match &order.provider_payment_id {
            Some(provider_payment_id) => Ok(CreatedOrder {
                order_id: order.id,
                amount: order.amount_cents,
                currency: order.currency.clone(),
                payment_url: self
                    .gateway
                    .confirmation_url(provider_payment_id, order.id, return_to),
            }),
            None => {
                tracing::info!(order_id = %order.id, "Reissuing payment session");
                self.open_payment_session(&order, return_to).await
            }
        }
    }

    fn pending_order(&self, user_id: Uuid, plan: &Plan, now: OffsetDateTime) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id,
            plan_id: plan.id,
            status: OrderStatus::PendingPayment,
            amount_cents: plan.price_cents,
            currency: self.currency.clone(),
            provider_payment_id: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn open_payment_session(
        &self,
        order: &Order,
        return_to: Option<&str>,
    ) -> BillingResult<CreatedOrder> {
        let session = self
            .gateway
            .create_payment(order.id, return_to)
            .await
            .map_err(|e| match e {
                BillingError::Upstream(_) => e,
                other => BillingError::Upstream(format!("payment provider: {other}")),
            })?;

        let mut tx = self.store.begin().await?;
        let attached = tx
            .attach_provider_payment_id(
                order.id,
                &session.provider_payment_id,
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !attached {
            return Err(BillingError::Conflict(format!(
                "order {} already has a payment session",
                order.id
            )));
        }
        tx.commit().await?;

        Ok(CreatedOrder {
            order_id: order.id,
            amount: order.amount_cents,
            currency: order.currency.clone(),
            payment_url: session.confirmation_url,
        })
    }
}

fn validate_telegram_id(telegram_id: i64) -> BillingResult<()> {
    if telegram_id <= 0 {
        return Err(BillingError::Validation(
            "telegramId must be a positive integer".to_string(),
        ));
    }
    Ok(())
}
