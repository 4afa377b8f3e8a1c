//! Provisioning orchestrator
//!
//! Reconciles a user's live entitlement with a client on the panel. The
//! panel call happens outside any local transaction; local state is only
//! written once the panel confirmed the change.

use std::sync::Arc;

use passgate_shared::{Store, Subscription, VpnAccount};
use rand::RngCore;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{BillingError, BillingResult};
use crate::panel::{PanelClient, RemoteClient};

/// Result of removing a user's panel client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "error", rename_all = "snake_case")]
pub enum DeprovisionOutcome {
    Deleted,
    AlreadyDeleted,
    NotProvisioned,
    /// The panel could not be reached; the local account stays undeleted.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnConfigStatus {
    Ready,
    NotProvisioned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnConfigView {
    pub status: VpnConfigStatus,
    pub vless_uri: Option<String>,
    pub subscription_url: Option<String>,
}

impl VpnConfigView {
    fn not_provisioned() -> Self {
        Self {
            status: VpnConfigStatus::NotProvisioned,
            vless_uri: None,
            subscription_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub provisioned: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ProvisioningOrchestrator {
    store: Arc<dyn Store>,
    panel: Arc<dyn PanelClient>,
    connection: Arc<ConnectionConfig>,
    subscription_base_url: Option<String>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        panel: Arc<dyn PanelClient>,
        connection: ConnectionConfig,
        subscription_base_url: Option<String>,
    ) -> Self {
        Self {
            store,
            panel,
            connection: Arc::new(connection),
            subscription_base_url,
        }
    }

    /// Make sure the user's live entitlement exists on the panel with the
    /// current expiry.
    pub async fn ensure_provisioned(&self, user_id: Uuid) -> BillingResult<VpnAccount> {
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let user = tx
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("User not found".to_string()))?;
        let subscription = tx.live_subscription(user_id, now).await?.ok_or_else(|| {
            BillingError::NotFound("No active subscription for provisioning".to_string())
        })?;
        let existing = tx.find_vpn_account(user_id).await?;
        // Read-only; release the row lock before talking to the panel.
        drop(tx);

        let client_id = existing
            .as_ref()
            .map(|a| a.xui_client_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sub_id = existing
            .as_ref()
            .map(|a| a.xui_sub_id.clone())
            .unwrap_or_else(new_sub_id);
        let email = client_email(user.telegram_id);
        let vless_uri =
            build_connection_uri(&self.connection, &client_id, &email, user.telegram_id)?;

        let remote = RemoteClient {
            client_id: client_id.clone(),
            email,
            sub_id: sub_id.clone(),
            flow: self.connection.flow.clone(),
            expires_at: subscription.expires_at,
        };

        if let Err(e) = self.panel.upsert_client(&remote).await {
            tracing::error!(
                user_id = %user_id,
                client_id = %client_id,
                error = %e,
                "Panel provisioning failed"
            );
            return Err(BillingError::Upstream(format!("3x-ui provision failed: {e}")));
        }

        let account = VpnAccount {
            user_id,
            xui_client_id: client_id,
            subscription_url: self.subscription_url(&sub_id),
            xui_sub_id: sub_id,
            xui_inbound_id: self.panel.inbound_id(),
            vless_uri,
            deleted_at: None,
            last_provisioned_at: Some(now),
            created_at: existing.as_ref().map(|a| a.created_at).unwrap_or(now),
            updated_at: now,
        };

        let mut tx = self.store.begin().await?;
        if tx.live_subscription(user_id, now).await?.is_none() {
            // Canceled while the panel call was in flight; the cancel may
            // already have deprovisioned, so take the client down again.
            drop(tx);
            tracing::warn!(
                user_id = %user_id,
                client_id = %account.xui_client_id,
                "Entitlement ended during provisioning, removing panel client"
            );
            if let Err(e) = self.panel.delete_client(&account.xui_client_id).await {
                tracing::error!(
                    user_id = %user_id,
                    client_id = %account.xui_client_id,
                    error = %e,
                    "Failed to remove panel client after canceled provisioning"
                );
            }
            return Err(BillingError::NotFound(
                "No active subscription for provisioning".to_string(),
            ));
        }
        tx.upsert_vpn_account(&account).await?;
        let cleared = tx
            .mark_subscription_provisioned(subscription.id, subscription.expires_at, now)
            .await?;
        tx.commit().await?;

        if !cleared {
            // A renewal or cancel landed while the panel call was in flight;
            // the flag stays set so the next attempt picks up the new state.
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                "Subscription changed during provisioning, leaving it flagged"
            );
        }

        tracing::info!(
            user_id = %user_id,
            telegram_id = user.telegram_id,
            expires_at = %subscription.expires_at,
            "User provisioned on panel"
        );
        Ok(account)
    }

    pub async fn ensure_provisioned_for_telegram(
        &self,
        telegram_id: i64,
    ) -> BillingResult<VpnAccount> {
        let mut tx = self.store.begin().await?;
        let user = tx
            .find_user_by_telegram_id(telegram_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("User not found".to_string()))?;
        drop(tx);
        self.ensure_provisioned(user.id).await
    }

    /// Remove the user's client from the panel, then mark the local account
    /// deleted. Local state is untouched when the panel call fails.
    pub async fn deprovision(&self, user_id: Uuid) -> BillingResult<DeprovisionOutcome> {
        let mut tx = self.store.begin().await?;
        let account = tx.find_vpn_account(user_id).await?;
        drop(tx);

        let account = match account {
            None => return Ok(DeprovisionOutcome::NotProvisioned),
            Some(a) if a.deleted_at.is_some() => return Ok(DeprovisionOutcome::AlreadyDeleted),
            Some(a) => a,
        };

        self.panel.delete_client(&account.xui_client_id).await?;

        let mut tx = self.store.begin().await?;
        tx.mark_vpn_account_deleted(user_id, OffsetDateTime::now_utc())
            .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            client_id = %account.xui_client_id,
            "User deprovisioned from panel"
        );
        Ok(DeprovisionOutcome::Deleted)
    }

    /// Connection details for the user. When the entitlement is live but the
    /// account is missing, provisioning is retried once first.
    pub async fn vpn_config(&self, telegram_id: i64) -> BillingResult<VpnConfigView> {
        let state = self.config_state(telegram_id).await?;
        let Some((user_id, subscription, account)) = state else {
            return Ok(VpnConfigView::not_provisioned());
        };

        if let Some(view) = ready_view(subscription.as_ref(), account.as_ref()) {
            return Ok(view);
        }
        if subscription.is_none() {
            return Ok(VpnConfigView::not_provisioned());
        }

        match self.ensure_provisioned(user_id).await {
            Ok(account) => Ok(ready_view(subscription.as_ref(), Some(&account))
                .unwrap_or_else(VpnConfigView::not_provisioned)),
            Err(e) => {
                tracing::warn!(
                    telegram_id,
                    error = %e,
                    "Opportunistic provisioning failed"
                );
                Ok(VpnConfigView::not_provisioned())
            }
        }
    }

    async fn config_state(
        &self,
        telegram_id: i64,
    ) -> BillingResult<Option<(Uuid, Option<Subscription>, Option<VpnAccount>)>> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.store.begin().await?;
        let Some(user) = tx.find_user_by_telegram_id(telegram_id).await? else {
            return Ok(None);
        };
        let subscription = tx.live_subscription(user.id, now).await?;
        let account = tx.find_vpn_account(user.id).await?;
        Ok(Some((user.id, subscription, account)))
    }

    /// Retry provisioning for live subscriptions still flagged as pending.
    pub async fn reprovision_pending(&self, limit: i64) -> BillingResult<SweepReport> {
        let mut tx = self.store.begin().await?;
        let pending = tx
            .subscriptions_needing_provisioning(OffsetDateTime::now_utc(), limit)
            .await?;
        drop(tx);

        let mut report = SweepReport::default();
        for subscription in pending {
            report.attempted += 1;
            match self.ensure_provisioned(subscription.user_id).await {
                Ok(_) => report.provisioned += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        user_id = %subscription.user_id,
                        subscription_id = %subscription.id,
                        error = %e,
                        "Reprovisioning attempt failed"
                    );
                }
            }
        }
        Ok(report)
    }

    fn subscription_url(&self, sub_id: &str) -> Option<String> {
        self.subscription_base_url.as_ref().map(|base| {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("name", sub_id)
                .finish();
            format!("{base}?{query}")
        })
    }
}

fn ready_view(
    subscription: Option<&Subscription>,
    account: Option<&VpnAccount>,
) -> Option<VpnConfigView> {
    subscription?;
    let account = account.filter(|a| a.deleted_at.is_none() && !a.vless_uri.is_empty())?;
    Some(VpnConfigView {
        status: VpnConfigStatus::Ready,
        vless_uri: Some(account.vless_uri.clone()),
        subscription_url: account.subscription_url.clone(),
    })
}

/// Panel-side identity of a user.
pub fn client_email(telegram_id: i64) -> String {
    format!("tg-{telegram_id}")
}

/// 16 hex characters.
fn new_sub_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Connection URI handed to the user's client application.
pub fn build_connection_uri(
    config: &ConnectionConfig,
    client_id: &str,
    email: &str,
    telegram_id: i64,
) -> BillingResult<String> {
    if let Some(template) = &config.uri_template {
        return Ok(template
            .replace("{uuid}", client_id)
            .replace("{email}", &encode_component(email))
            .replace("{telegramId}", &telegram_id.to_string()));
    }

    if config.host.is_empty() {
        return Err(BillingError::Config(
            "VPN_PUBLIC_HOST or VPN_PUBLIC_VLESS_URI must be set".to_string(),
        ));
    }

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("type", &config.network_type);
    query.append_pair("security", &config.security);
    for (key, value) in [
        ("sni", &config.sni),
        ("flow", &config.flow),
        ("pbk", &config.public_key),
        ("sid", &config.short_id),
        ("spx", &config.spider_x),
        ("fp", &config.fingerprint),
    ] {
        if !value.is_empty() {
            query.append_pair(key, value);
        }
    }

    let tag = config
        .tag_template
        .replace("{telegramId}", &telegram_id.to_string());

    Ok(format!(
        "vless://{}@{}:{}?{}#{}",
        client_id,
        config.host,
        config.port,
        query.finish(),
        encode_component(&tag)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reality() -> ConnectionConfig {
        ConnectionConfig {
            host: "vpn.example.com".to_string(),
            sni: "www.example.org".to_string(),
            public_key: "PBK".to_string(),
            short_id: "ab12".to_string(),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn builds_reality_uri_from_parameters() {
        let uri = build_connection_uri(&reality(), "client-1", "tg-5", 5).unwrap();
        assert_eq!(
            uri,
            "vless://client-1@vpn.example.com:443?type=tcp&security=reality&sni=www.example.org\
             &flow=xtls-rprx-vision&pbk=PBK&sid=ab12&spx=%2F&fp=chrome#reality-tg-5"
        );
    }

    #[test]
    fn empty_parameters_are_skipped() {
        let config = ConnectionConfig {
            host: "h".to_string(),
            flow: String::new(),
            spider_x: String::new(),
            fingerprint: String::new(),
            ..ConnectionConfig::default()
        };
        let uri = build_connection_uri(&config, "c", "tg-1", 1).unwrap();
        assert_eq!(uri, "vless://c@h:443?type=tcp&security=reality#reality-tg-1");
    }

    #[test]
    fn template_overrides_parameters() {
        let config = ConnectionConfig {
            uri_template: Some("vless://{uuid}@edge:8443?x=1#{email}-{telegramId}".to_string()),
            ..ConnectionConfig::default()
        };
        let uri = build_connection_uri(&config, "abc", "tg 9", 9).unwrap();
        assert_eq!(uri, "vless://abc@edge:8443?x=1#tg+9-9");
    }

    #[test]
    fn missing_host_without_template_is_a_config_error() {
        let result = build_connection_uri(&ConnectionConfig::default(), "c", "tg-1", 1);
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn sub_ids_are_sixteen_hex_chars() {
        let id = new_sub_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
