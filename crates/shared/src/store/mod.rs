//! Transactional storage seam.
//!
//! Business logic talks to a [`Store`] and performs all of its reads and
//! writes through a [`StoreTx`]. Each `StoreTx` is one unit of work: it is
//! committed explicitly and discarded (rolled back) when dropped. Two
//! implementations exist: [`PgStore`] for production and [`MemoryStore`] for
//! tests and local runs without a database.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{
    Order, OrderStatus, PaymentEvent, Plan, ProfileAccessToken, ProfileWebSession, Subscription,
    User, VpnAccount,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::Conflict(db.message().to_string());
            }
        }
        StoreError::Database(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a new unit of work.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
}

#[async_trait]
pub trait StoreTx: Send {
    // Users

    async fn upsert_user(&mut self, telegram_id: i64, now: OffsetDateTime) -> StoreResult<User>;
    async fn find_user(&mut self, user_id: Uuid) -> StoreResult<Option<User>>;
    async fn find_user_by_telegram_id(&mut self, telegram_id: i64) -> StoreResult<Option<User>>;

    // Plans

    /// Active plans ordered by duration.
    async fn list_active_plans(&mut self) -> StoreResult<Vec<Plan>>;
    /// Resolve an active plan by id or by code.
    async fn find_active_plan(&mut self, reference: &str) -> StoreResult<Option<Plan>>;
    async fn find_plan(&mut self, plan_id: Uuid) -> StoreResult<Option<Plan>>;

    // Orders

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()>;
    async fn find_order(&mut self, order_id: Uuid) -> StoreResult<Option<Order>>;
    async fn find_order_by_provider_payment_id(
        &mut self,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>>;
    /// Resolve the order a payment notification refers to, locking it for the
    /// rest of the unit of work.
    async fn find_order_for_payment(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>>;
    /// Record the payment session id. Only succeeds while it is still unset.
    async fn attach_provider_payment_id(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
        now: OffsetDateTime,
    ) -> StoreResult<bool>;
    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        paid_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> StoreResult<()>;

    // Payment events

    /// Returns `false` when an event with the same `event_id` already exists.
    async fn insert_payment_event(&mut self, event: &PaymentEvent) -> StoreResult<bool>;

    // Subscriptions

    /// Most recently created subscription row, whatever its state.
    async fn latest_subscription(&mut self, user_id: Uuid) -> StoreResult<Option<Subscription>>;
    /// Active, non-expired subscription with the furthest expiry, locked for
    /// the rest of the unit of work.
    async fn live_subscription(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<Option<Subscription>>;
    async fn insert_subscription(&mut self, subscription: &Subscription) -> StoreResult<()>;
    async fn update_subscription(&mut self, subscription: &Subscription) -> StoreResult<()>;
    /// Clear `needs_provisioning` if the subscription still expires at
    /// `provisioned_expiry`.
    async fn mark_subscription_provisioned(
        &mut self,
        subscription_id: Uuid,
        provisioned_expiry: OffsetDateTime,
        now: OffsetDateTime,
    ) -> StoreResult<bool>;
    async fn subscriptions_needing_provisioning(
        &mut self,
        now: OffsetDateTime,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>>;

    // Panel accounts

    async fn find_vpn_account(&mut self, user_id: Uuid) -> StoreResult<Option<VpnAccount>>;
    async fn upsert_vpn_account(&mut self, account: &VpnAccount) -> StoreResult<()>;
    async fn mark_vpn_account_deleted(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<bool>;

    // Profile tokens and sessions

    /// Consume every unconsumed, unexpired token of the user.
    async fn consume_live_access_tokens(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<u64>;
    async fn insert_access_token(&mut self, token: &ProfileAccessToken) -> StoreResult<()>;
    async fn find_access_token(&mut self, token: &str) -> StoreResult<Option<ProfileAccessToken>>;
    /// Conditionally consume one token: only an unconsumed, unexpired row is
    /// affected.
    async fn mark_access_token_consumed(
        &mut self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<u64>;
    async fn insert_web_session(&mut self, session: &ProfileWebSession) -> StoreResult<()>;
    async fn find_web_session(
        &mut self,
        session_key: &str,
    ) -> StoreResult<Option<ProfileWebSession>>;
    /// Newest unexpired session of the user.
    async fn latest_live_web_session(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<Option<ProfileWebSession>>;
    async fn touch_web_session(&mut self, session_id: Uuid, now: OffsetDateTime)
        -> StoreResult<()>;
    async fn delete_web_session(&mut self, session_key: &str) -> StoreResult<u64>;
    /// Delete tokens that are expired or already consumed.
    async fn purge_access_tokens(&mut self, now: OffsetDateTime) -> StoreResult<u64>;
    async fn purge_web_sessions(&mut self, now: OffsetDateTime) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
