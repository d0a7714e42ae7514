//! Snap Proxy - Entry Point
//!
//! Restores the stored pool, serves the control API and tears the pool down on shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snap_proxy::api::{ApiServer, AppState};
use snap_proxy::config::Config;
use snap_proxy::pool::{
    CommandGateway, HttpEchoProbe, PoolSettings, ProcessLauncher, ProxyPool, RotationOrchestrator,
    SystemInterfaces,
};
use snap_proxy::repository::{ConfigStore, JsonConfigStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config);

    info!("Starting Snap Proxy");

    let pool = Arc::new(ProxyPool::new(
        PoolSettings::from_config(&config),
        Arc::new(CommandGateway::new(&config.gateway)),
        Arc::new(ProcessLauncher::new(config.engine.binary.clone())),
        Arc::new(HttpEchoProbe::new(&config.health)),
        Arc::new(SystemInterfaces::new(
            config.health.connectivity_target.clone(),
            config.health.connectivity_timeout,
        )),
    ));
    let rotations = Arc::new(RotationOrchestrator::new(pool.clone(), &config.rotation));
    let store: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::new(config.storage.state_file.clone()));

    restore(&pool, &rotations, store.as_ref()).await;

    let config = Arc::new(config);
    let state = AppState::new(config.clone(), rotations.clone(), store)
        .context("failed to build API state")?;
    let api_server = ApiServer::new(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(shutdown_rx).await {
            error!(error = %e, "API server error");
        }
    });

    info!(host = %config.api.host, port = config.api.port, "Control API started");

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    rotations.teardown();
    let stopped = pool.stop_all().await;
    info!(count = stopped.len(), "Instances stopped");
    rotations.flush_pending_releases().await;

    let _ = api_task.await;

    info!("Snap Proxy stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("snap_proxy={},tower_http=debug", config.log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Bring back the stored network selection and instances
async fn restore(pool: &ProxyPool, rotations: &RotationOrchestrator, store: &dyn ConfigStore) {
    match store.network().await {
        Ok(network) => rotations.set_network(network),
        Err(e) => warn!(error = %e, "Failed to load stored network interface"),
    }

    let specs = match store.load_all().await {
        Ok(specs) => specs,
        Err(e) => {
            warn!(error = %e, "Failed to load stored proxy configs");
            return;
        }
    };
    if specs.is_empty() {
        return;
    }

    match pool.start_many(specs).await {
        Ok(report) => {
            let failed = report.failed_ids();
            info!(
                started = report.len() - failed.len(),
                failed = failed.len(),
                "Stored instances restored"
            );
            if !failed.is_empty() {
                warn!(ids = ?failed, "Some stored instances failed to start");
            }
        }
        Err(e) => error!(error = %e, "Failed to restore stored instances"),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
