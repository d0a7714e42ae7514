//! Proxy instance handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use super::batch_response;
use crate::api::server::AppState;
use crate::error::{Result, SnapError};
use crate::models::{InstanceSpec, ProxyInstance};

pub async fn list_instances(State(state): State<AppState>) -> Json<Vec<ProxyInstance>> {
    Json(state.pool.list())
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ProxyInstance>> {
    Ok(Json(state.pool.get(id)?))
}

/// Start one instance
pub async fn start_instance(
    State(state): State<AppState>,
    Json(spec): Json<InstanceSpec>,
) -> Result<impl IntoResponse> {
    let instance = state.pool.start(spec).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// Start many instances with shared gateway calls
pub async fn start_batch(
    State(state): State<AppState>,
    Json(specs): Json<Vec<InstanceSpec>>,
) -> Result<Response> {
    if specs.is_empty() {
        return Err(SnapError::InvalidRequest("no instances given".into()));
    }
    let report = state.pool.start_many(specs).await?;
    Ok(batch_response(report))
}

pub async fn instance_uri(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let uri = state.pool.proxy_uri(id)?;
    Ok(Json(json!({ "id": id, "uri": uri })))
}

/// Verify egress now, with retry
pub async fn check_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let healthy = state.pool.health_check(id).await?;
    Ok(Json(json!({ "id": id, "healthy": healthy })))
}

pub async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ProxyInstance>> {
    Ok(Json(state.pool.stop(id).await?))
}

/// Stop an instance and release its address
pub async fn remove_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ProxyInstance>> {
    Ok(Json(state.pool.remove(id).await?))
}

pub async fn stop_all(State(state): State<AppState>) -> impl IntoResponse {
    let stopped = state.pool.stop_all().await;
    info!(count = stopped.len(), "Stopped all instances on request");
    Json(json!({ "stopped": stopped.len() }))
}

/// Stop everything, release every address and forget the stored configs
pub async fn delete_all(State(state): State<AppState>) -> Result<Json<Value>> {
    let deleted = state.pool.delete_all().await;
    let configs_deleted = state.store.delete_all().await?;
    info!(count = deleted, configs_deleted, "Deleted all instances on request");
    Ok(Json(json!({ "deleted": deleted, "configsDeleted": configs_deleted })))
}
