//! Application state

use std::sync::Arc;

use passgate_billing::BillingService;
use passgate_shared::Store;

use crate::{auth::ProfileSessions, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    pub profiles: ProfileSessions,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>, billing: BillingService) -> Self {
        let profiles = ProfileSessions::new(store.clone(), config.billing.app_base_url.clone());
        Self {
            store,
            config: Arc::new(config),
            billing: Arc::new(billing),
            profiles,
        }
    }
}
