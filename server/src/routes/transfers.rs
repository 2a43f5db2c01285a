//! `GET /api/transfers`: downloads whose chunks are still being served.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn list_transfers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "transfers": state.transfers.list().await }))
}
