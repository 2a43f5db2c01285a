//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::tasks::types::BeaconStatus;
use crate::tunnel::TunnelStatus;

/// `GET /api/health`: liveness probe with coarse counters.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let beacons = state.tasks.list_beacons();
    let active_beacons = beacons
        .iter()
        .filter(|b| b.status != BeaconStatus::Exited)
        .count();
    let tunnels = state.tunnels.list().await;
    let open_tunnels = tunnels.iter().filter(|t| !t.status.is_terminal()).count();
    let active_tunnels = tunnels
        .iter()
        .filter(|t| t.status == TunnelStatus::Active)
        .count();

    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "beacons": {
            "known": beacons.len(),
            "active": active_beacons,
        },
        "tunnels": {
            "open": open_tunnels,
            "active": active_tunnels,
            "dropped_inbound": state.tunnels.dropped_inbound(),
        },
        "transfers": state.transfers.list().await.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{app, send_json};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn health_needs_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path());
        let (status, body) = send_json(&app, "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["beacons"]["known"], 0);
    }
}
