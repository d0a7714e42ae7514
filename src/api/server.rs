//! Control API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::{ApiServerConfig, Config};
use crate::error::{Result, SnapError};
use crate::pool::{ProxyPool, RotationOrchestrator};
use crate::repository::ConfigStore;

use super::middleware::{cors_layer, JwtAuth};
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<ProxyPool>,
    pub rotations: Arc<RotationOrchestrator>,
    pub store: Arc<dyn ConfigStore>,
    pub jwt_auth: JwtAuth,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        rotations: Arc<RotationOrchestrator>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self> {
        Ok(Self {
            jwt_auth: JwtAuth::new(&config.api.jwt_secret)?,
            pool: rotations.pool().clone(),
            config,
            rotations,
            store,
            started_at: Instant::now(),
        })
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self {
            config: state.config.api.clone(),
            state,
        }
    }

    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(cors_layer(&self.config.cors_origins))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| SnapError::InvalidConfig(format!("invalid API address: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "API server listening");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| SnapError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
