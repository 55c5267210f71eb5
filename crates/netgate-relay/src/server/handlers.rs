use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use netgate_core::encoding::is_peer_key;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::AppState;
use super::error::ApiError;
use crate::actions::{ActionErrorCode, ActionRequest};
use crate::consumer::parse_event;
use crate::machine::Reason;
use crate::provision::ProvisionRequest;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.store.backend_name(),
    }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.stats().await.unwrap_or_default();
    let processed = state.store.processed_count().await.unwrap_or_default();
    let oldest_age_ms = stats
        .oldest_run_at
        .map_or(0, |run_at| (state.clock.now_ms() - run_at).max(0));
    let open = state.actions.circuit().open_count();

    let gauge = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
    let body = state.metrics.render(&[
        ("jobs_total", gauge(stats.total)),
        ("jobs_due", gauge(stats.due)),
        ("jobs_pending", gauge(stats.pending)),
        ("jobs_oldest_age_ms", oldest_age_ms),
        ("processed_events", gauge(processed)),
        ("circuits_open", i64::try_from(open).unwrap_or(i64::MAX)),
    ])?;
    Ok(([("content-type", "text/plain; version=0.0.4")], body))
}

/// `POST /relay/action`
pub async fn action(
    State(state): State<AppState>,
    Json(mut request): Json<ActionRequest>,
) -> Response {
    request.source.get_or_insert_with(|| "api".to_string());
    let response = state.actions.execute(request).await;
    let status = match response.error_code() {
        None => StatusCode::OK,
        Some(ActionErrorCode::ActionNotAllowed) => StatusCode::FORBIDDEN,
        Some(ActionErrorCode::Validation) => StatusCode::BAD_REQUEST,
        Some(ActionErrorCode::DriverError) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(response)).into_response()
}

/// `POST /relay/events`
pub async fn inject_event(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Response, ApiError> {
    let event = parse_event(raw).map_err(ApiError::BadRequest)?;
    info!(event_id = %event.event_id, event_type = %event.event_type, "Event injected over API");
    let outcome = state.machine.process_event(&event).await;
    let status = match outcome.reason {
        None | Some(Reason::Duplicate) => StatusCode::OK,
        Some(Reason::Validation | Reason::UnknownType) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(Reason::CircuitOpen | Reason::PeerOffline | Reason::StoreUnavailable) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(Reason::DriverError) => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(outcome)).into_response())
}

/// `POST /relay/devices`
pub async fn provision_device(
    State(state): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> Result<Response, ApiError> {
    let result = state.devices.provision(&request).await?;
    Ok((StatusCode::CREATED, Json(result)).into_response())
}

/// `GET /relay/devices`
pub async fn list_devices(State(state): State<AppState>) -> Result<Response, ApiError> {
    let devices = state.devices.db().list_devices().await?;
    Ok(Json(json!({ "devices": devices })).into_response())
}

/// `GET /relay/devices/{id}`
pub async fn device_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let health = state.devices.health(&id).await?;
    Ok(Json(health).into_response())
}

/// `DELETE /relay/devices/{id}`
pub async fn deprovision_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let device = state.devices.deprovision(&id).await?;
    Ok(Json(device).into_response())
}

/// `POST /relay/devices/{id}/sync`
pub async fn sync_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let device = state.devices.sync(&id).await?;
    Ok(Json(device).into_response())
}

/// `GET /relay/peers`
pub async fn list_peers(State(state): State<AppState>) -> Result<Response, ApiError> {
    let peers = state.devices.peers().await?;
    Ok(Json(json!({ "peers": peers })).into_response())
}

/// `GET /relay/bindings`
pub async fn list_bindings(State(state): State<AppState>) -> Result<Response, ApiError> {
    let bindings = state.devices.db().list_bindings().await?;
    Ok(Json(json!({ "bindings": bindings })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingRequest {
    pub peer_key: String,
    pub device_id: String,
    pub router_address: String,
}

/// `PUT /relay/bindings`
pub async fn put_binding(
    State(state): State<AppState>,
    Json(request): Json<BindingRequest>,
) -> Result<Response, ApiError> {
    let peer_key = request.peer_key.trim();
    if !is_peer_key(peer_key) {
        return Err(ApiError::BadRequest("invalid peerKey".to_string()));
    }
    let db = state.devices.db();
    let device = db.get_device(request.device_id.trim()).await?;
    let binding = db
        .upsert_binding(
            peer_key,
            &device.device_id,
            request.router_address.trim(),
            state.clock.now_ms(),
        )
        .await?;
    info!(peer_key, device_id = %device.device_id, "Binding stored");
    Ok(Json(binding).into_response())
}

/// `DELETE /relay/bindings/{peer_key}`
pub async fn delete_binding(
    State(state): State<AppState>,
    Path(peer_key): Path<String>,
) -> Result<Response, ApiError> {
    if state.devices.db().remove_binding(&peer_key).await? {
        info!(peer_key = %peer_key, "Binding removed");
        Ok(Json(json!({ "ok": true })).into_response())
    } else {
        Err(ApiError::NotFound(format!("binding {peer_key}")))
    }
}
