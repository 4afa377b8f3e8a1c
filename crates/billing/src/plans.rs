//! Read-only plan catalog.

use std::sync::Arc;

use passgate_shared::{Plan, Store};

use crate::error::BillingResult;

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn Store>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Active plans, shortest first.
    pub async fn list_active(&self) -> BillingResult<Vec<Plan>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_active_plans().await?)
    }
}
