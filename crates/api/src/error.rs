//! API error type and its JSON rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use passgate_billing::BillingError;
use passgate_shared::StoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
            ApiError::Database(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Storage details stay in the logs.
        let message = match &self {
            ApiError::Database(_) | ApiError::Internal(_) => {
                tracing::error!(error = %self, "Request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::Unauthorized("Invalid webhook signature".to_string())
            }
            BillingError::Upstream(msg) => ApiError::BadGateway(msg),
            BillingError::Conflict(msg) => ApiError::Conflict(msg),
            BillingError::Config(msg) => ApiError::Internal(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::from(BillingError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_http_statuses() {
        let cases = [
            (BillingError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::WebhookSignatureInvalid, StatusCode::UNAUTHORIZED),
            (BillingError::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (BillingError::Conflict("x".into()), StatusCode::CONFLICT),
            (BillingError::Database("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
