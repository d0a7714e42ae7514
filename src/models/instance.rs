use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Protocol served by a proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyKind {
    #[serde(rename = "HTTP", alias = "http", alias = "FORWARD_HTTP")]
    Http,
    #[serde(rename = "SOCKS5", alias = "socks5")]
    Socks5,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        }
    }

    /// URI scheme clients use to reach the local endpoint
    pub fn scheme(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Running,
    Error,
    Draining,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Running => "running",
            LifecycleState::Error => "error",
            LifecycleState::Draining => "draining",
        }
    }

    /// Whether the instance occupies its listen port
    pub fn is_active(&self) -> bool {
        !matches!(self, LifecycleState::Stopped)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of the most recent egress verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Checking,
    Healthy,
    Unhealthy,
}

/// Username/password pair required by a proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Identifier of a supervised engine process.
///
/// The live process handle is owned by the supervisor; instances only keep this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineHandleId(pub u64);

impl std::fmt::Display for EngineHandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Static description of a proxy instance, as persisted by the config store
/// and consumed when an instance is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub id: i64,
    #[serde(rename = "type", alias = "kind")]
    pub kind: ProxyKind,
    #[serde(alias = "port")]
    pub listen_port: u16,
    #[serde(alias = "ipv6")]
    pub bound_address: Ipv6Addr,
    pub interface_name: String,
    #[serde(alias = "prefix")]
    pub prefix_length: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// A managed proxy endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInstance {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub listen_port: u16,
    pub bound_address: Ipv6Addr,
    pub aux_address: Option<Ipv4Addr>,
    pub interface_name: String,
    pub prefix_length: u8,
    pub credentials: Option<Credentials>,
    pub lifecycle_state: LifecycleState,
    pub engine_handle: Option<EngineHandleId>,
    pub pid: Option<u32>,
    pub last_rotated_at: DateTime<Utc>,
    pub health_state: HealthState,
}

impl ProxyInstance {
    /// Build a stopped instance from its static description
    pub fn from_spec(spec: &InstanceSpec, aux_address: Option<Ipv4Addr>) -> Self {
        Self {
            id: spec.id,
            kind: spec.kind,
            listen_port: spec.listen_port,
            bound_address: spec.bound_address,
            aux_address,
            interface_name: spec.interface_name.clone(),
            prefix_length: spec.prefix_length,
            credentials: spec.credentials.clone(),
            lifecycle_state: LifecycleState::Stopped,
            engine_handle: None,
            pid: None,
            last_rotated_at: Utc::now(),
            health_state: HealthState::Unknown,
        }
    }

    /// Static description of this instance
    pub fn spec(&self) -> InstanceSpec {
        InstanceSpec {
            id: self.id,
            kind: self.kind,
            listen_port: self.listen_port,
            bound_address: self.bound_address,
            interface_name: self.interface_name.clone(),
            prefix_length: self.prefix_length,
            credentials: self.credentials.clone(),
        }
    }

    /// Change the bound address, keeping `last_rotated_at` non-decreasing
    pub fn rebind(&mut self, address: Ipv6Addr) {
        self.bound_address = address;
        let now = Utc::now();
        if now > self.last_rotated_at {
            self.last_rotated_at = now;
        }
    }

    /// Attach a freshly started engine process
    pub fn attach_engine(&mut self, handle: EngineHandleId, pid: Option<u32>) {
        self.engine_handle = Some(handle);
        self.pid = pid;
        self.lifecycle_state = LifecycleState::Running;
    }

    /// Drop the engine reference and mark the instance stopped
    pub fn detach_engine(&mut self) {
        self.engine_handle = None;
        self.pid = None;
        self.lifecycle_state = LifecycleState::Stopped;
    }

    /// Local URI clients use to reach this endpoint
    pub fn proxy_uri(&self) -> String {
        let mut uri = match Url::parse(&format!(
            "{}://127.0.0.1:{}",
            self.kind.scheme(),
            self.listen_port
        )) {
            Ok(uri) => uri,
            Err(_) => return format!("{}://127.0.0.1:{}", self.kind.scheme(), self.listen_port),
        };

        if let Some(credentials) = &self.credentials {
            let _ = uri.set_username(&credentials.username);
            let _ = uri.set_password(Some(&credentials.password));
        }

        uri.as_str().trim_end_matches('/').to_string()
    }
}
