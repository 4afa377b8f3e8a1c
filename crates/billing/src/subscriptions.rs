//! Subscription ledger
//!
//! Owns the entitlement lifecycle. Only `active` and `blocked` are stored;
//! "expired" is derived from `expires_at` whenever a view is built.

use std::sync::Arc;

use passgate_shared::{Plan, Store, StoreTx, Subscription, SubscriptionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::provisioning::{DeprovisionOutcome, ProvisioningOrchestrator};

const MILLIS_PER_DAY: i128 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    Active,
    Expired,
    Blocked,
}

/// What a user sees about their entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub status: EntitlementStatus,
    pub days_left: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub plan_id: Option<Uuid>,
    pub plan_title: Option<String>,
}

impl SubscriptionView {
    /// The view of a user who never had a subscription.
    pub fn none() -> Self {
        Self {
            status: EntitlementStatus::Expired,
            days_left: 0,
            expires_at: None,
            plan_id: None,
            plan_title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    #[serde(flatten)]
    pub view: SubscriptionView,
    pub deprovision: DeprovisionOutcome,
}

/// Whole days left, rounded up. Zero once expired.
pub fn days_left(expires_at: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let remaining = (expires_at - now).whole_milliseconds();
    if remaining <= 0 {
        return 0;
    }
    let days = (remaining + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY;
    i64::try_from(days).unwrap_or(i64::MAX)
}

pub fn derive_status(subscription: &Subscription, now: OffsetDateTime) -> EntitlementStatus {
    match subscription.status {
        SubscriptionStatus::Blocked => EntitlementStatus::Blocked,
        SubscriptionStatus::Active if subscription.expires_at > now => EntitlementStatus::Active,
        SubscriptionStatus::Active => EntitlementStatus::Expired,
    }
}

pub fn derive_view(
    subscription: &Subscription,
    plan: Option<&Plan>,
    now: OffsetDateTime,
) -> SubscriptionView {
    let status = derive_status(subscription, now);
    let days_left = match status {
        EntitlementStatus::Active => days_left(subscription.expires_at, now),
        EntitlementStatus::Expired | EntitlementStatus::Blocked => 0,
    };
    SubscriptionView {
        status,
        days_left,
        expires_at: Some(subscription.expires_at),
        plan_id: subscription.plan_id,
        plan_title: plan.map(|p| p.name.clone()),
    }
}

/// UTC calendar-day extension.
pub fn extended_expiry(from: OffsetDateTime, days: i32) -> OffsetDateTime {
    from.saturating_add(Duration::days(i64::from(days)))
}

/// Extend the live subscription by the plan's duration, or start a fresh
/// one. Runs inside the caller's unit of work.
pub async fn extend_or_create(
    tx: &mut dyn StoreTx,
    user_id: Uuid,
    plan: &Plan,
    now: OffsetDateTime,
) -> BillingResult<Subscription> {
    if let Some(mut subscription) = tx.live_subscription(user_id, now).await? {
        let previous = subscription.expires_at;
        subscription.expires_at = extended_expiry(previous, plan.duration_days);
        subscription.plan_id = Some(plan.id);
        subscription.needs_provisioning = true;
        subscription.last_provisioned_at = None;
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            from = %previous,
            to = %subscription.expires_at,
            "Subscription extended"
        );
        return Ok(subscription);
    }

    let subscription = Subscription {
        id: Uuid::new_v4(),
        user_id,
        plan_id: Some(plan.id),
        status: SubscriptionStatus::Active,
        starts_at: now,
        expires_at: extended_expiry(now, plan.duration_days),
        needs_provisioning: true,
        last_provisioned_at: None,
        created_at: now,
        updated_at: now,
    };
    tx.insert_subscription(&subscription).await?;

    tracing::info!(
        user_id = %user_id,
        subscription_id = %subscription.id,
        expires_at = %subscription.expires_at,
        "Subscription created"
    );
    Ok(subscription)
}

#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn Store>,
    provisioning: ProvisioningOrchestrator,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn Store>, provisioning: ProvisioningOrchestrator) -> Self {
        Self {
            store,
            provisioning,
        }
    }

    pub async fn view(&self, telegram_id: i64) -> BillingResult<SubscriptionView> {
        self.view_at(telegram_id, OffsetDateTime::now_utc()).await
    }

    pub async fn view_at(
        &self,
        telegram_id: i64,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionView> {
        let mut tx = self.store.begin().await?;
        let Some(user) = tx.find_user_by_telegram_id(telegram_id).await? else {
            return Ok(SubscriptionView::none());
        };
        let Some(subscription) = tx.latest_subscription(user.id).await? else {
            return Ok(SubscriptionView::none());
        };
        let plan = match subscription.plan_id {
            Some(plan_id) => tx.find_plan(plan_id).await?,
            None => None,
        };
        Ok(derive_view(&subscription, plan.as_ref(), now))
    }

    /// Block the user's entitlement, then remove their panel client.
    ///
    /// The block is committed first; a failed panel removal is reported in
    /// the outcome and never undoes it.
    pub async fn cancel(&self, telegram_id: i64) -> BillingResult<CancelOutcome> {
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let Some(user) = tx.find_user_by_telegram_id(telegram_id).await? else {
            return Ok(CancelOutcome {
                view: SubscriptionView::none(),
                deprovision: DeprovisionOutcome::NotProvisioned,
            });
        };
        let Some(mut subscription) = tx.latest_subscription(user.id).await? else {
            return Ok(CancelOutcome {
                view: SubscriptionView::none(),
                deprovision: DeprovisionOutcome::NotProvisioned,
            });
        };

        subscription.status = SubscriptionStatus::Blocked;
        subscription.needs_provisioning = false;
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;
        let plan = match subscription.plan_id {
            Some(plan_id) => tx.find_plan(plan_id).await?,
            None => None,
        };
        tx.commit().await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription.id,
            "Subscription blocked"
        );

        let deprovision = match self.provisioning.deprovision(user.id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    user_id = %user.id,
                    error = %e,
                    "Deprovisioning failed after cancel, panel client left in place"
                );
                DeprovisionOutcome::Failed(e.to_string())
            }
        };

        Ok(CancelOutcome {
            view: derive_view(&subscription, plan.as_ref(), now),
            deprovision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn subscription(status: SubscriptionStatus, expires_at: OffsetDateTime) -> Subscription {
        let now = datetime!(2026-01-01 00:00 UTC);
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: None,
            status,
            starts_at: now,
            expires_at,
            needs_provisioning: false,
            last_provisioned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn days_left_rounds_up() {
        let now = datetime!(2026-01-01 00:00 UTC);
        assert_eq!(days_left(now + Duration::days(30), now), 30);
        assert_eq!(days_left(now + Duration::hours(1), now), 1);
        assert_eq!(days_left(now + Duration::days(4) + Duration::milliseconds(1), now), 5);
        assert_eq!(days_left(now, now), 0);
        assert_eq!(days_left(now - Duration::days(3), now), 0);
    }

    #[test]
    fn expired_is_derived_from_timestamps() {
        let now = datetime!(2026-01-10 00:00 UTC);
        let sub = subscription(SubscriptionStatus::Active, now - Duration::seconds(1));

        let view = derive_view(&sub, None, now);
        assert_eq!(view.status, EntitlementStatus::Expired);
        assert_eq!(view.days_left, 0);
    }

    #[test]
    fn blocked_overrides_remaining_time() {
        let now = datetime!(2026-01-10 00:00 UTC);
        let sub = subscription(SubscriptionStatus::Blocked, now + Duration::days(5));

        let view = derive_view(&sub, None, now);
        assert_eq!(view.status, EntitlementStatus::Blocked);
        assert_eq!(view.days_left, 0);
    }

    #[test]
    fn extension_uses_calendar_days() {
        let from = datetime!(2026-02-27 12:30 UTC);
        assert_eq!(extended_expiry(from, 30), datetime!(2026-03-29 12:30 UTC));
    }
}
