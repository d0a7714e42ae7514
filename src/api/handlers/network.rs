//! Network interface handlers

use std::net::{IpAddr, Ipv6Addr};

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::api::server::AppState;
use crate::error::{Result, SnapError};
use crate::models::{InterfaceAddress, NetworkInterfaceDescriptor};
use crate::pool::gateway::validate_interface_name;

const MAX_GENERATE: usize = 1000;

/// Global addresses on the host's interfaces
pub async fn list_interfaces(State(state): State<AppState>) -> Result<Json<Vec<InterfaceAddress>>> {
    Ok(Json(state.pool.interfaces().global_addresses()?))
}

pub async fn lan_ip(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "lanIp": state.pool.interfaces().lan_address() }))
}

#[derive(Debug, Deserialize)]
pub struct ConnectivityQuery {
    /// Test from this local address instead of the default route
    #[serde(default)]
    pub source: Option<Ipv6Addr>,
}

/// Whether the host reaches the outside world over IPv6
pub async fn test_connectivity(
    State(state): State<AppState>,
    Query(query): Query<ConnectivityQuery>,
) -> Json<Value> {
    let connected = state.pool.interfaces().test_connectivity(query.source).await;
    Json(json!({ "connected": connected, "source": query.source }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetNetworkRequest {
    pub name: String,
    pub address: Ipv6Addr,
    #[serde(alias = "prefix")]
    pub prefix_length: u8,
}

pub async fn get_network(State(state): State<AppState>) -> Json<Option<NetworkInterfaceDescriptor>> {
    Json(state.rotations.network())
}

/// Select the interface and prefix new addresses are drawn from
pub async fn set_network(
    State(state): State<AppState>,
    Json(req): Json<SetNetworkRequest>,
) -> Result<Json<NetworkInterfaceDescriptor>> {
    validate_interface_name(&req.name)?;
    if req.prefix_length > 128 {
        return Err(SnapError::InvalidAddress(format!(
            "prefix length {} is out of range",
            req.prefix_length
        )));
    }

    let descriptor =
        NetworkInterfaceDescriptor::from_interface_address(&req.name, req.address, req.prefix_length);
    state.store.set_network(descriptor.clone()).await?;
    state.rotations.set_network(Some(descriptor.clone()));
    Ok(Json(descriptor))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub count: usize,
}

/// Fresh addresses in the configured prefix; nothing is reserved
pub async fn generate_addresses(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<Value>> {
    if req.count == 0 || req.count > MAX_GENERATE {
        return Err(SnapError::InvalidRequest(format!(
            "count must be between 1 and {}",
            MAX_GENERATE
        )));
    }
    let addresses = state.rotations.generate(req.count)?;
    Ok(Json(json!({ "addresses": addresses })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    /// Defaults to the configured interface
    #[serde(default)]
    pub interface: Option<String>,
    /// Defaults to the configured interface address
    #[serde(default)]
    pub keep: Option<Ipv6Addr>,
}

/// Release every stale global address on an interface
pub async fn reset_interface(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Result<Json<Value>> {
    let network = state.rotations.network();
    let interface = req
        .interface
        .or_else(|| network.as_ref().map(|n| n.name.clone()))
        .ok_or(SnapError::NetworkNotConfigured)?;
    let keep = match req.keep.or_else(|| network.as_ref().map(|n| n.address)) {
        Some(keep) => keep,
        None => primary_address(&state, &interface)?,
    };

    let released = state.pool.reset_interface(&interface, keep).await?;
    info!(interface = %interface, released, "Interface reset on request");
    Ok(Json(json!({ "interface": interface, "kept": keep, "released": released })))
}

/// First global address of an interface, kept when nothing else is specified
fn primary_address(state: &AppState, interface: &str) -> Result<Ipv6Addr> {
    state
        .pool
        .interfaces()
        .global_addresses()?
        .into_iter()
        .find_map(|a| match a.address {
            IpAddr::V6(v6) if a.interface_name == interface => Some(v6),
            _ => None,
        })
        .ok_or_else(|| {
            SnapError::InvalidRequest(format!("interface {} has no global IPv6 address", interface))
        })
}
