//! HTTP routes

pub mod admin;
pub mod api;
pub mod fakepay;
pub mod profile;
pub mod webhooks;


use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{auth::require_admin, security::security_headers_middleware, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/admin/provision", post(admin::provision))
        .route("/api/profile/links", post(admin::issue_profile_link))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let bot_routes = Router::new()
        .route("/api/plans", get(api::list_plans))
        .route("/api/users/telegram", post(api::upsert_telegram_user))
        .route("/api/subscription", get(api::get_subscription))
        .route("/api/subscription/renew", post(api::renew_subscription))
        .route("/api/subscription/cancel", post(api::cancel_subscription))
        .route("/api/orders", post(api::create_order))
        .route("/api/orders/{id}", get(api::get_order))
        .route("/api/orders/{id}/payment", post(api::reissue_payment))
        .route("/api/vpn/config", get(api::vpn_config))
        .route("/api/webhooks/fakepay", post(webhooks::fakepay_webhook));

    let profile_routes = Router::new()
        .route("/profile", get(profile::show))
        .route("/profile/access/{token}", get(profile::access))
        .route("/profile/setup", get(profile::setup))
        .route("/profile/actions/renew", post(profile::renew))
        .route("/profile/actions/cancel", post(profile::cancel))
        .route("/profile/logout", post(profile::logout));

    let fakepay_routes = Router::new()
        .route("/fakepay/checkout/{id}", get(fakepay::checkout))
        .route("/fakepay/complete/{id}", post(fakepay::complete));

    Router::new()
        .route("/health", get(health))
        .merge(admin_routes)
        .merge(bot_routes)
        .merge(profile_routes)
        .merge(fakepay_routes)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
