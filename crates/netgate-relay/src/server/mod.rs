//! Operational HTTP API.
//!
//! `/health` is public. Every other route needs the relay token, and
//! mutating routes are additionally signed when an API secret is set.

mod auth;
mod error;
mod handlers;
mod rate_limit;

use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use netgate_core::{Clock, Metrics};
use tower_http::trace::TraceLayer;

use crate::actions::ActionHandler;
use crate::jobs::JobStore;
use crate::machine::StateMachine;
use crate::provision::DeviceManager;

pub use self::auth::{
    MAX_SKEW_MS, SIGNATURE_HEADER, TOKEN_HEADER, TS_HEADER, client_key, signing_input,
};
pub use self::error::ApiError;
pub use self::rate_limit::RateLimiter;

/// Shared secrets checked by the auth middleware.
#[derive(Clone, Default)]
pub struct ApiAuth {
    pub token: Option<String>,
    pub api_secret: Option<String>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub actions: Arc<ActionHandler>,
    pub machine: Arc<StateMachine>,
    pub devices: Arc<DeviceManager>,
    pub store: JobStore,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    pub auth: Arc<ApiAuth>,
    pub limiter: Arc<RateLimiter>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/relay/action", post(handlers::action))
        .route("/relay/events", post(handlers::inject_event))
        .route(
            "/relay/devices",
            post(handlers::provision_device).get(handlers::list_devices),
        )
        .route(
            "/relay/devices/{id}",
            get(handlers::device_health).delete(handlers::deprovision_device),
        )
        .route("/relay/devices/{id}/sync", post(handlers::sync_device))
        .route("/relay/peers", get(handlers::list_peers))
        .route(
            "/relay/bindings",
            get(handlers::list_bindings).put(handlers::put_binding),
        )
        .route("/relay/bindings/{peer_key}", delete(handlers::delete_binding))
        .route_layer(from_fn_with_state(state.clone(), auth::require_signature))
        .route_layer(from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(from_fn_with_state(state.clone(), auth::rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
