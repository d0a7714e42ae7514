//! Authentication handlers

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::middleware::AuthError;
use crate::api::server::AppState;

const TOKEN_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in: i64,
}

/// Exchange the operator credentials for a bearer token
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthError> {
    let admin = &state.config.admin;
    if admin.password.is_empty() || req.username != admin.username || req.password != admin.password {
        warn!(username = %req.username, "Login failed");
        return Err(AuthError::WrongCredentials);
    }

    let token = state.jwt_auth.generate_token(&req.username, TOKEN_EXPIRY_HOURS)?;
    info!(username = %req.username, "Operator logged in");

    Ok(Json(LoginResponse {
        token,
        expires_in: TOKEN_EXPIRY_HOURS * 3600,
    }))
}
