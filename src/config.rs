use crate::error::{Result, SnapError};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API configuration
    pub api: ApiServerConfig,
    /// Admin credentials
    pub admin: AdminConfig,
    /// External proxy engine configuration
    pub engine: EngineConfig,
    /// Health probe configuration
    pub health: HealthConfig,
    /// Privileged network gateway configuration
    pub gateway: GatewayConfig,
    /// Persisted proxy configuration file
    pub storage: StorageConfig,
    /// Rotation timing defaults
    pub rotation: RotationDefaults,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
    /// JWT secret for token generation
    pub jwt_secret: String,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Admin username for the control API
    pub username: String,
    /// Admin password for the control API
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the proxy engine binary
    pub binary: PathBuf,
    /// Directory holding generated engine config files
    pub config_dir: PathBuf,
    /// Name server written into engine configs
    pub dns_server: String,
    /// Time given to a freshly spawned engine before it is probed
    pub startup_delay: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub kill_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Address-echo service queried through each proxy
    pub echo_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Attempts made by a health check with retry
    pub attempts: u32,
    /// Base delay of the linear retry backoff
    pub initial_delay: Duration,
    /// `host:port` dialed over IPv6 by the connectivity test
    pub connectivity_target: String,
    /// Timeout of the connectivity test
    pub connectivity_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// Run interface commands through sudo
    Sudo,
    /// Run interface commands directly (already privileged)
    Direct,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    /// Binary used to elevate commands in sudo mode
    pub sudo_binary: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// JSON file holding proxy descriptors and the network interface
    pub state_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RotationDefaults {
    /// Delay before an old address is released after a graceful rotation
    pub release_safety_delay: Duration,
    /// Drain timeout used when a rotation config does not carry one
    pub default_drain: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            api: ApiServerConfig {
                port: get_env_or("API_PORT", "8001").parse().map_err(|_| {
                    SnapError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "127.0.0.1"),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                jwt_secret: get_env_or("JWT_SECRET", ""),
            },
            admin: AdminConfig {
                username: get_env_or("SNAP_ADMIN_USER", "admin"),
                password: get_env_or("SNAP_ADMIN_PASSWORD", "admin"),
            },
            engine: EngineConfig {
                binary: match env::var("SNAP_ENGINE_BINARY") {
                    Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
                    _ => detect_engine_binary(),
                },
                config_dir: env::var("SNAP_CONFIG_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| env::temp_dir().join("snap-proxy-configs")),
                dns_server: get_env_or("SNAP_ENGINE_DNS", "8.8.8.8"),
                startup_delay: Duration::from_millis(parse_env("SNAP_ENGINE_STARTUP_DELAY_MS", 2000)?),
                kill_grace: Duration::from_millis(parse_env("SNAP_KILL_GRACE_MS", 2000)?),
            },
            health: HealthConfig {
                echo_url: parse_echo_url()?,
                timeout: Duration::from_secs(parse_env("SNAP_HEALTH_TIMEOUT_SECS", 10)?.max(1)),
                attempts: parse_env::<u32>("SNAP_HEALTH_ATTEMPTS", 3)?.max(1),
                initial_delay: Duration::from_millis(parse_env("SNAP_HEALTH_DELAY_MS", 2000)?),
                connectivity_target: get_env_or("SNAP_CONNECTIVITY_TARGET", "google.com:443"),
                connectivity_timeout: Duration::from_secs(
                    parse_env("SNAP_CONNECTIVITY_TIMEOUT_SECS", 5)?.max(1),
                ),
            },
            gateway: GatewayConfig {
                mode: match get_env_or("SNAP_GATEWAY_MODE", "sudo").to_lowercase().as_str() {
                    "sudo" => GatewayMode::Sudo,
                    "direct" => GatewayMode::Direct,
                    other => {
                        return Err(SnapError::InvalidConfig(format!(
                            "SNAP_GATEWAY_MODE must be 'sudo' or 'direct', got '{}'",
                            other
                        )))
                    }
                },
                sudo_binary: get_env_or("SNAP_SUDO_BINARY", "sudo"),
            },
            storage: StorageConfig {
                state_file: env::var("SNAP_STATE_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| default_state_file()),
            },
            rotation: RotationDefaults {
                release_safety_delay: Duration::from_millis(parse_env(
                    "SNAP_RELEASE_SAFETY_DELAY_MS",
                    5000,
                )?),
                default_drain: Duration::from_millis(parse_env("SNAP_DEFAULT_DRAIN_MS", 30000)?),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

fn parse_echo_url() -> Result<String> {
    let raw = get_env_or("SNAP_HEALTH_URL", "https://api64.ipify.org");
    let url = Url::parse(raw.trim()).map_err(|e| {
        SnapError::InvalidConfig(format!("SNAP_HEALTH_URL must be a valid URL: {}", e))
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(SnapError::InvalidConfig(format!(
            "SNAP_HEALTH_URL has unsupported scheme: {}",
            other
        ))),
    }
}

/// Find the proxy engine binary: bundled resources first, then system paths,
/// finally fall back to resolving through PATH.
fn detect_engine_binary() -> PathBuf {
    let bundled_name = format!("3proxy-{}", env::consts::OS);

    let mut candidates = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        candidates.push(cwd.join("resources").join("bin").join(&bundled_name));
    }
    if let Some(exe_dir) = env::current_exe().ok().as_deref().and_then(Path::parent) {
        candidates.push(exe_dir.join("resources").join("bin").join(&bundled_name));
    }
    candidates.push(PathBuf::from("/usr/local/bin/3proxy"));
    candidates.push(PathBuf::from("/usr/bin/3proxy"));

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from("3proxy"))
}

fn default_state_file() -> PathBuf {
    let base = env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| PathBuf::from(home).join(".local").join("share")))
        .unwrap_or_else(|_| env::temp_dir());

    base.join("snap-proxy").join("proxy-config.json")
}

/// Parse a numeric environment variable, rejecting malformed values
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            SnapError::InvalidConfig(format!("{} must be a valid number, got '{}'", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Held by tests that read or mutate the process environment
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
