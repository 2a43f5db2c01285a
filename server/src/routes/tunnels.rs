//! Operator endpoints for port-forwarding tunnels.
//!
//! - `POST   /api/tunnels`            request a tunnel through a beacon
//! - `GET    /api/tunnels`            list tunnels
//! - `GET    /api/tunnels/{id}`       one tunnel
//! - `DELETE /api/tunnels/{id}`       close
//! - `POST   /api/tunnels/{id}/data`  queue bytes toward the target
//! - `GET    /api/tunnels/{id}/data`  drain bytes received from the target

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{task_error, tunnel_error, ApiError};
use crate::state::AppState;
use crate::tasks::types::BeaconStatus;
use crate::tasks::TaskError;
use crate::tunnel::TunnelInfo;

#[derive(Deserialize)]
pub struct StartTunnelRequest {
    pub beacon_id: String,
    /// `host:port` as dialed from the beacon.
    pub target: String,
    pub operator: Option<String>,
}

#[derive(Deserialize)]
pub struct PushDataRequest {
    #[serde(with = "crate::protocol::b64", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub is_fin: bool,
}

/// `POST /api/tunnels`
pub async fn start_tunnel(
    State(state): State<AppState>,
    Json(req): Json<StartTunnelRequest>,
) -> Result<Json<TunnelInfo>, ApiError> {
    match state.tasks.get_beacon(&req.beacon_id) {
        None => return Err(task_error(&TaskError::BeaconNotFound(req.beacon_id))),
        Some(b) if b.status == BeaconStatus::Exited => {
            return Err(task_error(&TaskError::BeaconExited(req.beacon_id)));
        }
        Some(_) => {}
    }
    let operator = req.operator.as_deref().unwrap_or("operator");
    state
        .tunnels
        .start(&req.beacon_id, &req.target, operator)
        .await
        .map(Json)
        .map_err(|e| tunnel_error(&e))
}

/// `GET /api/tunnels`
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tunnels": state.tunnels.list().await }))
}

/// `GET /api/tunnels/{id}`
pub async fn get_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelInfo>, ApiError> {
    state
        .tunnels
        .get(&id)
        .await
        .map(Json)
        .map_err(|e| tunnel_error(&e))
}

/// `DELETE /api/tunnels/{id}`
pub async fn close_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelInfo>, ApiError> {
    state
        .tunnels
        .close(&id)
        .await
        .map(Json)
        .map_err(|e| tunnel_error(&e))
}

/// `POST /api/tunnels/{id}/data`
pub async fn push_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PushDataRequest>,
) -> Result<Json<Value>, ApiError> {
    let len = req.data.len();
    state
        .tunnels
        .push_outbound(&id, req.data, req.is_fin)
        .await
        .map_err(|e| tunnel_error(&e))?;
    Ok(Json(json!({ "queued": len })))
}

/// `GET /api/tunnels/{id}/data`
pub async fn pull_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let messages = state
        .tunnels
        .pull_inbound(&id)
        .await
        .map_err(|e| tunnel_error(&e))?;
    Ok(Json(json!({ "messages": messages })))
}
