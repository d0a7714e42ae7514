//! API request handlers

pub mod auth;
pub mod configs;
pub mod health;
pub mod instances;
pub mod network;
pub mod rotation;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::BatchReport;

/// 200 when every member succeeded, 207 when some failed
pub(crate) fn batch_response(report: BatchReport) -> Response {
    let status = if report.failed_ids().is_empty() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(report)).into_response()
}
