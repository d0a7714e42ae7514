//! Liveness and status endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::api::server::AppState;
use crate::models::{LifecycleState, RotationMode};

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "snap-proxy"
        })),
    )
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub instances: usize,
    pub running: usize,
    pub draining: usize,
    pub errored: usize,
    pub stopped: usize,
    pub engines: usize,
    pub allocated_addresses: usize,
    pub rotation_mode: RotationMode,
    pub rotation_scheduled: bool,
    pub network_interface: Option<String>,
}

/// Pool and scheduler overview
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let instances = state.pool.list();
    let mut response = StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        instances: instances.len(),
        engines: state.pool.engine_count(),
        allocated_addresses: state.pool.addresses().len(),
        rotation_mode: state.rotations.config().mode,
        rotation_scheduled: state.rotations.is_scheduled(),
        network_interface: state.rotations.network().map(|n| n.name),
        ..Default::default()
    };

    for instance in &instances {
        match instance.lifecycle_state {
            LifecycleState::Running => response.running += 1,
            LifecycleState::Draining => response.draining += 1,
            LifecycleState::Error => response.errored += 1,
            LifecycleState::Stopped => response.stopped += 1,
        }
    }

    Json(response)
}
