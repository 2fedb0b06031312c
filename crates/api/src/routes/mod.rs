//! HTTP routes

pub mod billing;
pub mod health;
pub mod webhook;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_internal_token, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/subscribers/{id}", post(billing::register_subscriber))
        .route(
            "/subscribers/{id}/entitlement",
            get(billing::get_entitlement),
        )
        .route("/subscribers/{id}/checkout", post(billing::create_checkout))
        .route("/subscribers/{id}/portal", post(billing::create_portal))
        .route(
            "/subscribers/{id}/downgrade",
            post(billing::request_downgrade),
        )
        .route("/webhooks", get(billing::list_webhooks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ));

    Router::new()
        .route("/webhook", post(webhook::receive_webhook))
        .route("/health", get(health::health))
        .nest("/internal", internal)
        .with_state(state)
}
