use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, StoreTx};
use crate::types::{
    Order, OrderStatus, PaymentEvent, Plan, ProfileAccessToken, ProfileWebSession, Subscription,
    SubscriptionStatus, User, VpnAccount,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    plans: Vec<Plan>,
    orders: HashMap<Uuid, Order>,
    payment_events: HashMap<String, PaymentEvent>,
    // Insertion order doubles as creation order.
    subscriptions: Vec<Subscription>,
    vpn_accounts: HashMap<Uuid, VpnAccount>,
    access_tokens: Vec<ProfileAccessToken>,
    web_sessions: Vec<ProfileWebSession>,
}

/// In-process store. A unit of work holds the state lock for its whole
/// lifetime and edits a private copy, so transactions are fully serialized
/// and a dropped transaction leaves no trace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with the standard 7/30/90 day catalog.
    pub fn with_default_plans() -> Self {
        let state = MemoryState {
            plans: vec![
                seed_plan("plan_7", "7 days", 7, 9_900),
                seed_plan("plan_30", "30 days", 30, 29_900),
                seed_plan("plan_90", "90 days", 90, 79_900),
            ],
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.state.lock().await.plans.push(plan);
    }

    pub async fn plan_by_code(&self, code: &str) -> Option<Plan> {
        let state = self.state.lock().await;
        state.plans.iter().find(|p| p.code == code).cloned()
    }

    pub async fn set_plan_price(&self, code: &str, price_cents: i64) {
        let mut state = self.state.lock().await;
        if let Some(plan) = state.plans.iter_mut().find(|p| p.code == code) {
            plan.price_cents = price_cents;
        }
    }

    pub async fn set_plan_active(&self, code: &str, is_active: bool) {
        let mut state = self.state.lock().await;
        if let Some(plan) = state.plans.iter_mut().find(|p| p.code == code) {
            plan.is_active = is_active;
        }
    }

    pub async fn subscriptions_for(&self, user_id: Uuid) -> Vec<Subscription> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn payment_event_count(&self) -> usize {
        self.state.lock().await.payment_events.len()
    }

    /// Overwrite a stored subscription, e.g. to move time around in tests.
    pub async fn replace_subscription(&self, subscription: Subscription) {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            *existing = subscription;
        }
    }
}

fn seed_plan(code: &str, name: &str, duration_days: i32, price_cents: i64) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        code: code.to_string(),
        name: name.to_string(),
        duration_days,
        price_cents,
        is_active: true,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn upsert_user(&mut self, telegram_id: i64, now: OffsetDateTime) -> StoreResult<User> {
        if let Some(user) = self
            .work
            .users
            .values()
            .find(|u| u.telegram_id == telegram_id)
        {
            return Ok(user.clone());
        }
        let user = User {
            id: Uuid::new_v4(),
            telegram_id,
            created_at: now,
        };
        self.work.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&mut self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.work.users.get(&user_id).cloned())
    }

    async fn find_user_by_telegram_id(&mut self, telegram_id: i64) -> StoreResult<Option<User>> {
        Ok(self
            .work
            .users
            .values()
            .find(|u| u.telegram_id == telegram_id)
            .cloned())
    }

    async fn list_active_plans(&mut self) -> StoreResult<Vec<Plan>> {
        let mut plans: Vec<Plan> = self
            .work
            .plans
            .iter()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.duration_days);
        Ok(plans)
    }

    async fn find_active_plan(&mut self, reference: &str) -> StoreResult<Option<Plan>> {
        let by_id = Uuid::parse_str(reference).ok();
        Ok(self
            .work
            .plans
            .iter()
            .find(|p| p.is_active && (Some(p.id) == by_id || p.code == reference))
            .cloned())
    }

    async fn find_plan(&mut self, plan_id: Uuid) -> StoreResult<Option<Plan>> {
        Ok(self.work.plans.iter().find(|p| p.id == plan_id).cloned())
    }

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        if self.work.orders.contains_key(&order.id) {
            return Err(StoreError::Conflict(format!("order {} exists", order.id)));
        }
        self.work.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(&mut self, order_id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.work.orders.get(&order_id).cloned())
    }

    async fn find_order_by_provider_payment_id(
        &mut self,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>> {
        Ok(self
            .work
            .orders
            .values()
            .find(|o| o.provider_payment_id.as_deref() == Some(provider_payment_id))
            .cloned())
    }

    async fn find_order_for_payment(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>> {
        Ok(self
            .work
            .orders
            .get(&order_id)
            .filter(|o| o.provider_payment_id.as_deref() == Some(provider_payment_id))
            .cloned())
    }

    async fn attach_provider_payment_id(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        let taken = self
            .work
            .orders
            .values()
            .any(|o| o.provider_payment_id.as_deref() == Some(provider_payment_id));
        if taken {
            return Err(StoreError::Conflict(format!(
                "provider payment id {provider_payment_id} already attached"
            )));
        }
        match self.work.orders.get_mut(&order_id) {
            Some(order) if order.provider_payment_id.is_none() => {
                order.provider_payment_id = Some(provider_payment_id.to_string());
                order.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        paid_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        if let Some(order) = self.work.orders.get_mut(&order_id) {
            order.status = status;
            if paid_at.is_some() {
                order.paid_at = paid_at;
            }
            order.updated_at = now;
        }
        Ok(())
    }

    async fn insert_payment_event(&mut self, event: &PaymentEvent) -> StoreResult<bool> {
        if self.work.payment_events.contains_key(&event.event_id) {
            return Ok(false);
        }
        self.work
            .payment_events
            .insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn latest_subscription(&mut self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        Ok(self
            .work
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.user_id == user_id)
            .cloned())
    }

    async fn live_subscription(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .work
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_live_at(now))
            .max_by_key(|s| s.expires_at)
            .cloned())
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> StoreResult<()> {
        self.work.subscriptions.push(subscription.clone());
        Ok(())
    }

    async fn update_subscription(&mut self, subscription: &Subscription) -> StoreResult<()> {
        if let Some(existing) = self
            .work
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            existing.plan_id = subscription.plan_id;
            existing.status = subscription.status;
            existing.expires_at = subscription.expires_at;
            existing.needs_provisioning = subscription.needs_provisioning;
            existing.last_provisioned_at = subscription.last_provisioned_at;
            existing.updated_at = subscription.updated_at;
        }
        Ok(())
    }

    async fn mark_subscription_provisioned(
        &mut self,
        subscription_id: Uuid,
        provisioned_expiry: OffsetDateTime,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        match self.work.subscriptions.iter_mut().find(|s| {
            s.id == subscription_id
                && s.expires_at == provisioned_expiry
                && s.status == SubscriptionStatus::Active
        }) {
            Some(subscription) => {
                subscription.needs_provisioning = false;
                subscription.last_provisioned_at = Some(now);
                subscription.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn subscriptions_needing_provisioning(
        &mut self,
        now: OffsetDateTime,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let mut pending: Vec<Subscription> = self
            .work
            .subscriptions
            .iter()
            .filter(|s| s.needs_provisioning && s.is_live_at(now))
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.updated_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn find_vpn_account(&mut self, user_id: Uuid) -> StoreResult<Option<VpnAccount>> {
        Ok(self.work.vpn_accounts.get(&user_id).cloned())
    }

    async fn upsert_vpn_account(&mut self, account: &VpnAccount) -> StoreResult<()> {
        let created_at = self
            .work
            .vpn_accounts
            .get(&account.user_id)
            .map(|a| a.created_at)
            .unwrap_or(account.created_at);
        let mut stored = account.clone();
        stored.created_at = created_at;
        self.work.vpn_accounts.insert(account.user_id, stored);
        Ok(())
    }

    async fn mark_vpn_account_deleted(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        match self.work.vpn_accounts.get_mut(&user_id) {
            Some(account) if account.deleted_at.is_none() => {
                account.deleted_at = Some(now);
                account.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume_live_access_tokens(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<u64> {
        let mut consumed = 0;
        for token in self
            .work
            .access_tokens
            .iter_mut()
            .filter(|t| t.user_id == user_id && t.is_live_at(now))
        {
            token.consumed_at = Some(now);
            consumed += 1;
        }
        Ok(consumed)
    }

    async fn insert_access_token(&mut self, token: &ProfileAccessToken) -> StoreResult<()> {
        if self.work.access_tokens.iter().any(|t| t.token == token.token) {
            return Err(StoreError::Conflict("access token exists".to_string()));
        }
        self.work.access_tokens.push(token.clone());
        Ok(())
    }

    async fn find_access_token(&mut self, token: &str) -> StoreResult<Option<ProfileAccessToken>> {
        Ok(self
            .work
            .access_tokens
            .iter()
            .find(|t| t.token == token)
            .cloned())
    }

    async fn mark_access_token_consumed(
        &mut self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<u64> {
        match self
            .work
            .access_tokens
            .iter_mut()
            .find(|t| t.id == token_id && t.is_live_at(now))
        {
            Some(token) => {
                token.consumed_at = Some(now);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn insert_web_session(&mut self, session: &ProfileWebSession) -> StoreResult<()> {
        self.work.web_sessions.push(session.clone());
        Ok(())
    }

    async fn find_web_session(
        &mut self,
        session_key: &str,
    ) -> StoreResult<Option<ProfileWebSession>> {
        Ok(self
            .work
            .web_sessions
            .iter()
            .find(|s| s.session_key == session_key)
            .cloned())
    }

    async fn latest_live_web_session(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<Option<ProfileWebSession>> {
        Ok(self
            .work
            .web_sessions
            .iter()
            .rev()
            .find(|s| s.user_id == user_id && s.expires_at > now)
            .cloned())
    }

    async fn touch_web_session(
        &mut self,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        if let Some(session) = self
            .work
            .web_sessions
            .iter_mut()
            .find(|s| s.id == session_id)
        {
            session.last_seen_at = now;
        }
        Ok(())
    }

    async fn delete_web_session(&mut self, session_key: &str) -> StoreResult<u64> {
        let before = self.work.web_sessions.len();
        self.work
            .web_sessions
            .retain(|s| s.session_key != session_key);
        Ok((before - self.work.web_sessions.len()) as u64)
    }

    async fn purge_access_tokens(&mut self, now: OffsetDateTime) -> StoreResult<u64> {
        let before = self.work.access_tokens.len();
        self.work
            .access_tokens
            .retain(|t| t.expires_at > now && t.consumed_at.is_none());
        Ok((before - self.work.access_tokens.len()) as u64)
    }

    async fn purge_web_sessions(&mut self, now: OffsetDateTime) -> StoreResult<u64> {
        let before = self.work.web_sessions.len();
        self.work.web_sessions.retain(|s| s.expires_at > now);
        Ok((before - self.work.web_sessions.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert_user(42, now).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.find_user_by_telegram_id(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_user_upsert_is_stable() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        let mut tx = store.begin().await.unwrap();
        let first = tx.upsert_user(7, now).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let second = tx.upsert_user(7, now).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn duplicate_payment_event_is_rejected() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let event = PaymentEvent {
            id: Uuid::new_v4(),
            event_id: "evt-1".to_string(),
            provider_payment_id: "pay-1".to_string(),
            status: crate::types::PaymentStatus::Succeeded,
            amount_cents: 100,
            currency: "RUB".to_string(),
            payload: serde_json::json!({}),
            order_id: Uuid::new_v4(),
            created_at: now,
        };

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_payment_event(&event).await.unwrap());
        assert!(!tx.insert_payment_event(&event).await.unwrap());
    }

    #[tokio::test]
    async fn token_can_only_be_consumed_once() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let mut tx = store.begin().await.unwrap();
        let user = tx.upsert_user(1, now).await.unwrap();
        let token = ProfileAccessToken {
            id: Uuid::new_v4(),
            token: "t".to_string(),
            user_id: user.id,
            expires_at: now + time::Duration::hours(1),
            consumed_at: None,
            created_at: now,
        };
        tx.insert_access_token(&token).await.unwrap();

        assert_eq!(tx.mark_access_token_consumed(token.id, now).await.unwrap(), 1);
        assert_eq!(tx.mark_access_token_consumed(token.id, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn plans_are_listed_by_duration() {
        let store = MemoryStore::with_default_plans();
        store.set_plan_active("plan_7", false).await;

        let mut tx = store.begin().await.unwrap();
        let codes: Vec<String> = tx
            .list_active_plans()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.code)
            .collect();
        assert_eq!(codes, vec!["plan_30", "plan_90"]);
    }
}
