//! HTTP route handlers.
//!
//! | Group | Auth | Module |
//! |-------|------|--------|
//! | `/api/health` | none | [`health`] |
//! | `/api/beacon/*` | beacon key | [`beacon`] |
//! | `/api/beacons*`, `/api/tasks*` | api key | [`tasks`] |
//! | `/api/tunnels*` | api key | [`tunnels`] |
//! | `/api/transfers` | api key | [`transfers`] |
//!
//! Failures are `(StatusCode, Json({"error", "code"}))`.

pub mod beacon;
pub mod health;
pub mod tasks;
pub mod transfers;
pub mod tunnels;

use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey, BeaconKey};
use crate::state::AppState;
use crate::tasks::TaskError;
use crate::transfer::TransferError;
use crate::tunnel::TunnelError;

pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, code: &str, message: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(json!({"error": message.to_string(), "code": code})),
    )
}

pub(crate) fn task_error(e: &TaskError) -> ApiError {
    let status = match e {
        TaskError::NotFound(_) | TaskError::BeaconNotFound(_) => StatusCode::NOT_FOUND,
        TaskError::InvalidTransition { .. } | TaskError::BeaconExited(_) => StatusCode::CONFLICT,
        TaskError::UnknownCommand(_) => StatusCode::BAD_REQUEST,
        TaskError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.code(), e)
}

pub(crate) fn tunnel_error(e: &TunnelError) -> ApiError {
    let status = match e {
        TunnelError::NotFound(_) => StatusCode::NOT_FOUND,
        TunnelError::NotActive { .. } | TunnelError::Closed(_) => StatusCode::CONFLICT,
        TunnelError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        TunnelError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
    };
    api_error(status, e.code(), e)
}

pub(crate) fn transfer_error(e: &TransferError) -> ApiError {
    let status = match e {
        TransferError::NotFound(_) | TransferError::FileNotFound(_) => StatusCode::NOT_FOUND,
        TransferError::FileChanged => StatusCode::CONFLICT,
        TransferError::OutOfRange { .. }
        | TransferError::InvalidChunkSize { .. }
        | TransferError::TooManyChunks { .. }
        | TransferError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        TransferError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        TransferError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.code(), e)
}

/// The full HTTP surface, auth layers included.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let beacon_routes = Router::new()
        .route("/api/beacon/checkin", post(beacon::check_in))
        .route("/api/beacon/chunk/{task_id}/{chunk}", get(beacon::chunk))
        .layer(middleware::from_fn(auth::require_beacon_key))
        .layer(Extension(BeaconKey(state.config.auth.beacon_key.clone())));

    let operator_routes = Router::new()
        .route("/api/beacons", get(tasks::list_beacons))
        .route("/api/beacons/{id}/terminate", post(tasks::terminate_beacon))
        .route("/api/beacons/{id}/tasks", get(tasks::list_beacon_tasks))
        .route("/api/tasks", post(tasks::create_task))
        .route("/api/tasks/{id}", get(tasks::get_task))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel_task))
        .route(
            "/api/tunnels",
            post(tunnels::start_tunnel).get(tunnels::list_tunnels),
        )
        .route(
            "/api/tunnels/{id}",
            get(tunnels::get_tunnel).delete(tunnels::close_tunnel),
        )
        .route(
            "/api/tunnels/{id}/data",
            post(tunnels::push_data).get(tunnels::pull_data),
        )
        .route("/api/transfers", get(transfers::list_transfers))
        .layer(middleware::from_fn(auth::require_api_key))
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())));

    Router::new()
        .merge(public_routes)
        .merge(beacon_routes)
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
