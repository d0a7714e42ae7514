//! Rotation handlers

use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

use super::batch_response;
use crate::api::server::AppState;
use crate::error::Result;
use crate::models::{RotationConfig, RotationOutcome, RotationStyle};
use crate::pool::allocator::canonicalize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateRequest {
    /// Target address; generated when absent
    #[serde(default, alias = "newAddress")]
    pub address: Option<String>,
    /// Overrides the configured style when present
    #[serde(default)]
    pub graceful: Option<bool>,
    #[serde(default, alias = "drainTimeout")]
    pub drain_timeout_ms: Option<u64>,
}

impl RotateRequest {
    fn style(&self, config: &RotationConfig, default_drain: Duration) -> RotationStyle {
        match self.graceful {
            Some(false) => RotationStyle::Simple,
            Some(true) => RotationStyle::Graceful {
                drain: self
                    .drain_timeout_ms
                    .or(config.drain_timeout_ms)
                    .map(Duration::from_millis)
                    .unwrap_or(default_drain),
            },
            None => match config.style(default_drain) {
                RotationStyle::Graceful { drain } => RotationStyle::Graceful {
                    drain: self.drain_timeout_ms.map(Duration::from_millis).unwrap_or(drain),
                },
                RotationStyle::Simple => RotationStyle::Simple,
            },
        }
    }
}

/// Rotate one instance
pub async fn rotate_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<RotateRequest>>,
) -> Result<Json<RotationOutcome>> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let address = request.address.as_deref().map(canonicalize).transpose()?;
    let style = request.style(&state.rotations.config(), state.rotations.default_drain());

    let outcome = state.rotations.rotate(id, address, style).await?;
    Ok(Json(outcome))
}

pub async fn get_config(State(state): State<AppState>) -> Json<RotationConfig> {
    Json(state.rotations.config())
}

pub async fn set_config(
    State(state): State<AppState>,
    Json(config): Json<RotationConfig>,
) -> Result<Json<RotationConfig>> {
    state.rotations.set_config(config).await?;
    Ok(Json(state.rotations.config()))
}

/// Rotate the whole pool now, following the current config
pub async fn rotate_now(State(state): State<AppState>) -> Result<Response> {
    let report = state.rotations.rotate_all().await?;
    Ok(batch_response(report))
}
