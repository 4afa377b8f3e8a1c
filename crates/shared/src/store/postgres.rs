use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, StoreTx};
use crate::types::{
    Order, OrderStatus, PaymentEvent, Plan, ProfileAccessToken, ProfileWebSession, Subscription,
    SubscriptionStatus, User, VpnAccount,
};

/// PostgreSQL-backed store. Every [`StoreTx`] wraps one database transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

const ORDER_COLUMNS: &str = "id, user_id, plan_id, status, amount_cents, currency, \
     provider_payment_id, paid_at, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, starts_at, expires_at, \
     needs_provisioning, last_provisioned_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    status: String,
    amount_cents: i64,
    currency: String,
    provider_payment_id: Option<String>,
    paid_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::parse(&row.status).ok_or_else(|| {
            StoreError::InvalidRow(format!("order {} has status {}", row.id, row.status))
        })?;
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status,
            amount_cents: row.amount_cents,
            currency: row.currency,
            provider_payment_id: row.provider_payment_id,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Option<Uuid>,
    status: String,
    starts_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    needs_provisioning: bool,
    last_provisioned_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            StoreError::InvalidRow(format!("subscription {} has status {}", row.id, row.status))
        })?;
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status,
            starts_at: row.starts_at,
            expires_at: row.expires_at,
            needs_provisioning: row.needs_provisioning,
            last_provisioned_at: row.last_provisioned_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert<R, T>(row: Option<R>) -> StoreResult<Option<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    row.map(T::try_from).transpose()
}

#[async_trait]
impl StoreTx for PgTx {
    async fn upsert_user(&mut self, telegram_id: i64, now: OffsetDateTime) -> StoreResult<User> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let user: User = sqlx::query_as(
            r#"
            INSERT INTO users (id, telegram_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (telegram_id) DO UPDATE SET telegram_id = EXCLUDED.telegram_id
            RETURNING id, telegram_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(telegram_id)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(user)
    }

    async fn find_user(&mut self, user_id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as("SELECT id, telegram_id, created_at FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn find_user_by_telegram_id(&mut self, telegram_id: i64) -> StoreResult<Option<User>> {
        let user = sqlx::query_as(
            "SELECT id, telegram_id, created_at FROM users WHERE telegram_id = $1",
        )
        .bind(telegram_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(user)
    }

    async fn list_active_plans(&mut self) -> StoreResult<Vec<Plan>> {
        let plans = sqlx::query_as(
            r#"
            SELECT id, code, name, duration_days, price_cents, is_active
            FROM plans
            WHERE is_active = TRUE
            ORDER BY duration_days ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(plans)
    }

    async fn find_active_plan(&mut self, reference: &str) -> StoreResult<Option<Plan>> {
        let by_id = Uuid::parse_str(reference).ok();
        let plan = sqlx::query_as(
            r#"
            SELECT id, code, name, duration_days, price_cents, is_active
            FROM plans
            WHERE is_active = TRUE AND (id = $1 OR code = $2)
            LIMIT 1
            "#,
        )
        .bind(by_id)
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(plan)
    }

    async fn find_plan(&mut self, plan_id: Uuid) -> StoreResult<Option<Plan>> {
        let plan = sqlx::query_as(
            "SELECT id, code, name, duration_days, price_cents, is_active FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(plan)
    }

    async fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, plan_id, status, amount_cents, currency,
                                provider_payment_id, paid_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.plan_id)
        .bind(order.status.as_str())
        .bind(order.amount_cents)
        .bind(&order.currency)
        .bind(&order.provider_payment_id)
        .bind(order.paid_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_order(&mut self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let row: Option<OrderRow> =
            sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
                .bind(order_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        convert(row)
    }

    async fn find_order_by_provider_payment_id(
        &mut self,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE provider_payment_id = $1"
        ))
        .bind(provider_payment_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        convert(row)
    }

    async fn find_order_for_payment(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE id = $1 AND provider_payment_id = $2 FOR UPDATE"
        ))
        .bind(order_id)
        .bind(provider_payment_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        convert(row)
    }

    async fn attach_provider_payment_id(
        &mut self,
        order_id: Uuid,
        provider_payment_id: &str,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET provider_payment_id = $2, updated_at = $3
            WHERE id = $1 AND provider_payment_id IS NULL
            "#,
        )
        .bind(order_id)
        .bind(provider_payment_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
        paid_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, paid_at = COALESCE($3, paid_at), updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(paid_at)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_payment_event(&mut self, event: &PaymentEvent) -> StoreResult<bool> {
        // Concurrent deliveries of the same event block on the unique index;
        // the loser sees zero rows and takes the idempotent path.
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO payment_events (id, event_id, provider_payment_id, status, amount_cents,
                                        currency, payload, order_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.id)
        .bind(&event.event_id)
        .bind(&event.provider_payment_id)
        .bind(event.status.as_str())
        .bind(event.amount_cents)
        .bind(&event.currency)
        .bind(&event.payload)
        .bind(event.order_id)
        .bind(event.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(inserted.is_some())
    }

    async fn latest_subscription(&mut self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        convert(row)
    }

    async fn live_subscription(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND status = 'active' AND expires_at > $2 \
             ORDER BY expires_at DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(user_id)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;
        convert(row)
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, user_id, plan_id, status, starts_at, expires_at,
                                       needs_provisioning, last_provisioned_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.starts_at)
        .bind(subscription.expires_at)
        .bind(subscription.needs_provisioning)
        .bind(subscription.last_provisioned_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_subscription(&mut self, subscription: &Subscription) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = $2, status = $3, expires_at = $4, needs_provisioning = $5,
                last_provisioned_at = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.expires_at)
        .bind(subscription.needs_provisioning)
        .bind(subscription.last_provisioned_at)
        .bind(subscription.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_subscription_provisioned(
        &mut self,
        subscription_id: Uuid,
        provisioned_expiry: OffsetDateTime,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET needs_provisioning = FALSE, last_provisioned_at = $3, updated_at = $3
            WHERE id = $1 AND expires_at = $2 AND status = 'active'
            "#,
        )
        .bind(subscription_id)
        .bind(provisioned_expiry)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn subscriptions_needing_provisioning(
        &mut self,
        now: OffsetDateTime,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE needs_provisioning = TRUE AND status = 'active' AND expires_at > $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn find_vpn_account(&mut self, user_id: Uuid) -> StoreResult<Option<VpnAccount>> {
        let account = sqlx::query_as(
            r#"
            SELECT user_id, xui_client_id, xui_sub_id, xui_inbound_id, vless_uri,
                   subscription_url, deleted_at, last_provisioned_at, created_at, updated_at
            FROM vpn_accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn upsert_vpn_account(&mut self, account: &VpnAccount) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vpn_accounts (user_id, xui_client_id, xui_sub_id, xui_inbound_id, vless_uri,
                                      subscription_url, deleted_at, last_provisioned_at,
                                      created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE SET
                xui_client_id = EXCLUDED.xui_client_id,
                xui_sub_id = EXCLUDED.xui_sub_id,
                xui_inbound_id = EXCLUDED.xui_inbound_id,
                vless_uri = EXCLUDED.vless_uri,
                subscription_url = EXCLUDED.subscription_url,
                deleted_at = EXCLUDED.deleted_at,
                last_provisioned_at = EXCLUDED.last_provisioned_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(account.user_id)
        .bind(&account.xui_client_id)
        .bind(&account.xui_sub_id)
        .bind(account.xui_inbound_id)
        .bind(&account.vless_uri)
        .bind(&account.subscription_url)
        .bind(account.deleted_at)
        .bind(account.last_provisioned_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_vpn_account_deleted(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE vpn_accounts
            SET deleted_at = $2, updated_at = $2
            WHERE user_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn consume_live_access_tokens(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE profile_access_tokens
            SET consumed_at = $2
            WHERE user_id = $1 AND consumed_at IS NULL AND expires_at > $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_access_token(&mut self, token: &ProfileAccessToken) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profile_access_tokens (id, token, user_id, expires_at, consumed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(&token.token)
        .bind(token.user_id)
        .bind(token.expires_at)
        .bind(token.consumed_at)
        .bind(token.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_access_token(&mut self, token: &str) -> StoreResult<Option<ProfileAccessToken>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, token, user_id, expires_at, consumed_at, created_at
            FROM profile_access_tokens
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn mark_access_token_consumed(
        &mut self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE profile_access_tokens
            SET consumed_at = $2
            WHERE id = $1 AND consumed_at IS NULL AND expires_at > $2
            "#,
        )
        .bind(token_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_web_session(&mut self, session: &ProfileWebSession) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profile_web_sessions (id, session_key, user_id, expires_at, last_seen_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(session.id)
        .bind(&session.session_key)
        .bind(session.user_id)
        .bind(session.expires_at)
        .bind(session.last_seen_at)
        .bind(session.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_web_session(
        &mut self,
        session_key: &str,
    ) -> StoreResult<Option<ProfileWebSession>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, session_key, user_id, expires_at, last_seen_at, created_at
            FROM profile_web_sessions
            WHERE session_key = $1
            "#,
        )
        .bind(session_key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn latest_live_web_session(
        &mut self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<Option<ProfileWebSession>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, session_key, user_id, expires_at, last_seen_at, created_at
            FROM profile_web_sessions
            WHERE user_id = $1 AND expires_at > $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn touch_web_session(
        &mut self,
        session_id: Uuid,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE profile_web_sessions SET last_seen_at = $2 WHERE id = $1")
            .bind(session_id)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_web_session(&mut self, session_key: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM profile_web_sessions WHERE session_key = $1")
            .bind(session_key)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_access_tokens(&mut self, now: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM profile_access_tokens WHERE expires_at <= $1 OR consumed_at IS NOT NULL",
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_web_sessions(&mut self, now: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM profile_web_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
