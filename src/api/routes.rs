//! API route definitions

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;

use super::handlers;
use super::middleware::require_auth;
use super::server::AppState;
use super::websocket;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // No auth required
        .route("/health", get(handlers::health::health_check))
        .route("/api/auth/login", post(handlers::auth::login))
        .nest("/api", protected_routes(state.clone()))
        .with_state(state)
}

/// Routes that require a bearer token
fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/status", get(handlers::health::status))
        // Network
        .route(
            "/network",
            get(handlers::network::get_network).put(handlers::network::set_network),
        )
        .route("/network/interfaces", get(handlers::network::list_interfaces))
        .route("/network/lan-ip", get(handlers::network::lan_ip))
        .route("/network/connectivity", get(handlers::network::test_connectivity))
        .route("/network/generate", post(handlers::network::generate_addresses))
        .route("/network/reset", post(handlers::network::reset_interface))
        // Instances
        .route(
            "/instances",
            get(handlers::instances::list_instances).post(handlers::instances::start_instance),
        )
        .route("/instances/batch", post(handlers::instances::start_batch))
        .route("/instances/stop-all", post(handlers::instances::stop_all))
        .route("/instances/delete-all", post(handlers::instances::delete_all))
        .route(
            "/instances/:id",
            get(handlers::instances::get_instance).delete(handlers::instances::remove_instance),
        )
        .route("/instances/:id/uri", get(handlers::instances::instance_uri))
        .route("/instances/:id/health", post(handlers::instances::check_health))
        .route("/instances/:id/stop", post(handlers::instances::stop_instance))
        .route("/instances/:id/rotate", post(handlers::rotation::rotate_instance))
        // Rotation
        .route(
            "/rotation/config",
            get(handlers::rotation::get_config).put(handlers::rotation::set_config),
        )
        .route("/rotation/rotate-now", post(handlers::rotation::rotate_now))
        // Stored configs
        .route(
            "/configs",
            get(handlers::configs::list_configs)
                .post(handlers::configs::append_configs)
                .delete(handlers::configs::delete_all_configs),
        )
        .route("/configs/:id", delete(handlers::configs::delete_config))
        // WebSocket
        .route("/ws/rotations", get(websocket::rotations::rotations_ws))
        .route_layer(from_fn_with_state(state, require_auth))
}
