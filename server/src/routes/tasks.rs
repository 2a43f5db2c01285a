//! Operator endpoints for beacons and tasks.
//!
//! - `GET  /api/beacons`                 list beacons
//! - `POST /api/beacons/{id}/terminate`  send `exit` on next poll
//! - `GET  /api/beacons/{id}/tasks`      tasks of one beacon, creation order
//! - `POST /api/tasks`                   queue a task
//! - `GET  /api/tasks/{id}`              one task
//! - `POST /api/tasks/{id}/cancel`       cancel while queued

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, task_error, ApiError};
use crate::state::AppState;
use crate::tasks::types::{Task, TaskOrigin};

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub beacon_id: String,
    pub command: String,
    /// Text arguments. Ignored when `arguments_b64` is set.
    #[serde(default)]
    pub arguments: String,
    /// Binary arguments, base64.
    pub arguments_b64: Option<String>,
    /// Operator name recorded as the task origin.
    pub operator: Option<String>,
}

/// `POST /api/tasks`
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let arguments = match req.arguments_b64 {
        Some(b64) => base64::engine::general_purpose::STANDARD
            .decode(b64.as_bytes())
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", format!("arguments_b64: {e}")))?,
        None => req.arguments.into_bytes(),
    };
    let origin = TaskOrigin::Operator(req.operator.unwrap_or_else(|| "operator".to_string()));
    state
        .tasks
        .create_task(&req.beacon_id, &req.command, arguments, origin)
        .map(Json)
        .map_err(|e| task_error(&e))
}

/// `GET /api/tasks/{id}`
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    state.tasks.get_task(&id).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "TASK_NOT_FOUND",
            format!("task '{id}' not found"),
        )
    })
}

/// `POST /api/tasks/{id}/cancel`
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    state
        .tasks
        .cancel(&id)
        .await
        .map(Json)
        .map_err(|e| task_error(&e))
}

/// `GET /api/beacons/{id}/tasks`
pub async fn list_beacon_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.tasks.get_beacon(&id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "BEACON_NOT_FOUND",
            format!("beacon '{id}' not found"),
        ));
    }
    Ok(Json(json!({ "tasks": state.tasks.list_tasks(&id) })))
}

/// `GET /api/beacons`
pub async fn list_beacons(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "beacons": state.tasks.list_beacons() }))
}

/// `POST /api/beacons/{id}/terminate`
pub async fn terminate_beacon(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let beacon = state
        .tasks
        .terminate_beacon(&id)
        .map_err(|e| task_error(&e))?;
    Ok(Json(json!({ "beacon": beacon })))
}
