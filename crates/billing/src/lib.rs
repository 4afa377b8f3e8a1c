// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PassGate Billing Module
//!
//! The payment-to-entitlement pipeline.
//!
//! ## Features
//!
//! - **Orders**: Pending purchase and renewal orders with a frozen price snapshot
//! - **Webhooks**: Signed FakePay notifications, applied at most once per event
//! - **Subscriptions**: Entitlement lifecycle, extension arithmetic and cancellation
//! - **Provisioning**: Reconcile live entitlements with clients on the 3x-ui panel
//! - **Notifications**: Telegram message after a confirmed payment

pub mod config;
pub mod error;
pub mod notify;
pub mod orders;
pub mod panel;
pub mod payment;
pub mod plans;
pub mod provisioning;
pub mod subscriptions;
pub mod webhooks;


use std::sync::Arc;

use passgate_shared::Store;

// Config
pub use config::{BillingConfig, ConnectionConfig, PanelConfig};

// Error
pub use error::{BillingError, BillingResult};

// Notifications
pub use notify::{DisabledNotifier, Notifier, TelegramNotifier};

// Orders
pub use orders::{CreatedOrder, OrderLookup, OrderManager};

// Panel
pub use panel::{InMemoryPanel, PanelClient, PanelError, RemoteClient, XuiPanelClient};

// Payments
pub use payment::{FakePayGateway, PaymentGateway, PaymentSession};

// Plans
pub use plans::PlanCatalog;

// Provisioning
pub use provisioning::{
    DeprovisionOutcome, ProvisioningOrchestrator, SweepReport, VpnConfigStatus, VpnConfigView,
};

// Subscriptions
pub use subscriptions::{CancelOutcome, EntitlementStatus, SubscriptionLedger, SubscriptionView};

// Webhooks
pub use webhooks::{
    WebhookMetadata, WebhookOutcome, WebhookPayload, WebhookProcessor, SIGNATURE_HEADER,
};

/// Combined billing service
pub struct BillingService {
    pub plans: PlanCatalog,
    pub orders: OrderManager,
    pub webhooks: WebhookProcessor,
    pub subscriptions: SubscriptionLedger,
    pub provisioning: ProvisioningOrchestrator,
}

impl BillingService {
    /// Wire the production collaborators: the 3x-ui panel, FakePay and
    /// Telegram (when a bot token is configured).
    pub fn new(store: Arc<dyn Store>, config: &BillingConfig) -> BillingResult<Self> {
        if !config.panel.is_configured() {
            tracing::warn!("THREEXUI_BASE_URL not set, provisioning will fail until configured");
        }
        let panel: Arc<dyn PanelClient> = Arc::new(XuiPanelClient::new(config.panel.clone())?);
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(FakePayGateway::new(config.app_base_url.clone()));
        let notifier: Arc<dyn Notifier> = match &config.bot_token {
            Some(token) => Arc::new(TelegramNotifier::new(token.clone())?),
            None => Arc::new(DisabledNotifier),
        };
        Ok(Self::with_components(store, config, panel, gateway, notifier))
    }

    pub fn from_env(store: Arc<dyn Store>) -> BillingResult<Self> {
        Self::new(store, &BillingConfig::from_env()?)
    }

    pub fn with_components(
        store: Arc<dyn Store>,
        config: &BillingConfig,
        panel: Arc<dyn PanelClient>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let provisioning = ProvisioningOrchestrator::new(
            store.clone(),
            panel,
            config.connection.clone(),
            config.panel.subscription_base_url.clone(),
        );
        Self {
            plans: PlanCatalog::new(store.clone()),
            orders: OrderManager::new(store.clone(), gateway, config.currency.clone()),
            webhooks: WebhookProcessor::new(
                store.clone(),
                config.webhook_secret.clone(),
                provisioning.clone(),
                notifier,
            ),
            subscriptions: SubscriptionLedger::new(store, provisioning.clone()),
            provisioning,
        }
    }
}
