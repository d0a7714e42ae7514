//! Stored proxy config handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::{Result, SnapError};
use crate::models::InstanceSpec;

pub async fn list_configs(State(state): State<AppState>) -> Result<Json<Vec<InstanceSpec>>> {
    Ok(Json(state.store.load_all().await?))
}

/// Store descriptors; ids are reassigned after the highest stored one
pub async fn append_configs(
    State(state): State<AppState>,
    Json(specs): Json<Vec<InstanceSpec>>,
) -> Result<impl IntoResponse> {
    let stored = state.store.append(specs).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn delete_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    if !state.store.delete(id).await? {
        return Err(SnapError::InstanceNotFound { id });
    }
    Ok(Json(json!({ "deleted": id })))
}

pub async fn delete_all_configs(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let deleted = state.store.delete_all().await?;
    Ok(Json(json!({ "deleted": deleted })))
}
