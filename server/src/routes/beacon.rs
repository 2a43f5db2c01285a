//! Beacon-facing endpoints.
//!
//! - `POST /api/beacon/checkin`                  one poll exchange
//! - `GET  /api/beacon/chunk/{task_id}/{chunk}`  raw chunk bytes

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::{api_error, transfer_error, ApiError};
use crate::checkin::handle_check_in;
use crate::protocol::{CheckIn, CheckInResponse};
use crate::state::AppState;

/// `POST /api/beacon/checkin`: apply results and tunnel traffic, return work.
pub async fn check_in(
    State(state): State<AppState>,
    Json(payload): Json<CheckIn>,
) -> Result<Json<CheckInResponse>, ApiError> {
    if payload.beacon_id.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "beacon_id is required",
        ));
    }
    Ok(Json(
        handle_check_in(&state.tasks, &state.tunnels, payload).await,
    ))
}

/// `GET /api/beacon/chunk/{task_id}/{chunk}`: one chunk as
/// `application/octet-stream`.
pub async fn chunk(
    State(state): State<AppState>,
    Path((task_id, chunk)): Path<(String, u32)>,
) -> Result<Response, ApiError> {
    let bytes = state
        .transfers
        .serve_chunk(&task_id, chunk)
        .await
        .map_err(|e| transfer_error(&e))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}
