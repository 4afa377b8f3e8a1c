//! Billing error types

use passgate_shared::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    /// An external collaborator (panel, payment provider) failed.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => BillingError::Conflict(msg),
            other => BillingError::Database(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
