//! Privileged network gateway
//!
//! Adds and removes addresses on an interface. A whole batch is rendered into one
//! shell script so that it costs a single privilege escalation.

use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{GatewayConfig, GatewayMode};
use crate::error::{Result, SnapError};
use crate::models::AddressBinding;

/// Capability to mutate interface addresses.
///
/// Both operations are batchable and idempotent: adding an address that already
/// exists, or removing one that does not, succeeds.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
    async fn reserve(&self, interface: &str, bindings: &[AddressBinding]) -> Result<()>;

    async fn release(&self, interface: &str, bindings: &[AddressBinding]) -> Result<()>;

    /// Obtain authorization up front, so later batches do not prompt
    async fn authorize(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedGateway = Arc<dyn NetworkGateway>;

/// Which userland tool manages interface addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStyle {
    /// `ip -6 addr add|del` (Linux)
    Iproute2,
    /// `ifconfig <if> inet6 .. add|delete` (macOS, BSD)
    Ifconfig,
}

impl CommandStyle {
    pub fn native() -> Self {
        if cfg!(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd")) {
            CommandStyle::Ifconfig
        } else {
            CommandStyle::Iproute2
        }
    }

    fn add_command(&self, interface: &str, binding: &AddressBinding) -> String {
        match self {
            CommandStyle::Iproute2 => format!(
                "ip -6 addr add {}/{} dev {}",
                binding.address, binding.prefix_length, interface
            ),
            CommandStyle::Ifconfig => format!(
                "ifconfig {} inet6 {} prefixlen {} add",
                interface, binding.address, binding.prefix_length
            ),
        }
    }

    fn delete_command(&self, interface: &str, binding: &AddressBinding) -> String {
        match self {
            CommandStyle::Iproute2 => format!(
                "ip -6 addr del {}/{} dev {}",
                binding.address, binding.prefix_length, interface
            ),
            CommandStyle::Ifconfig => format!(
                "ifconfig {} inet6 {} prefixlen {} delete",
                interface, binding.address, binding.prefix_length
            ),
        }
    }
}

/// Direction of a gateway batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOp {
    Reserve,
    Release,
}

impl GatewayOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayOp::Reserve => "reserve",
            GatewayOp::Release => "release",
        }
    }

    /// Output fragments that mean the interface is already in the wanted state
    fn tolerated(&self) -> &'static [&'static str] {
        match self {
            GatewayOp::Reserve => &["File exists", "already"],
            GatewayOp::Release => &[
                "Cannot assign requested address",
                "Can't assign requested address",
                "does not exist",
                "not found",
                "No such",
            ],
        }
    }
}

/// Reject interface names that could smuggle shell syntax into the batch script
pub fn validate_interface_name(interface: &str) -> Result<()> {
    let valid = !interface.is_empty()
        && interface.len() <= 32
        && interface
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '@'));

    if valid {
        Ok(())
    } else {
        Err(SnapError::InvalidRequest(format!(
            "invalid interface name: {:?}",
            interface
        )))
    }
}

fn tolerant_line(command: &str, tolerated: &[&str]) -> String {
    let patterns = tolerated
        .iter()
        .map(|p| format!("*\"{}\"*", p))
        .collect::<Vec<_>>()
        .join("|");

    format!(
        "out=$({} 2>&1) || case \"$out\" in {}) ;; *) echo \"$out\" >&2; exit 1 ;; esac",
        command, patterns
    )
}

/// Render one batch into a single shell script.
///
/// Every command runs in order; tolerated outcomes are swallowed and anything
/// else aborts the script with the command's output on stderr.
pub fn build_script(
    style: CommandStyle,
    op: GatewayOp,
    interface: &str,
    bindings: &[AddressBinding],
) -> Result<String> {
    validate_interface_name(interface)?;

    let lines: Vec<String> = bindings
        .iter()
        .map(|binding| {
            let command = match op {
                GatewayOp::Reserve => style.add_command(interface, binding),
                GatewayOp::Release => style.delete_command(interface, binding),
            };
            tolerant_line(&command, op.tolerated())
        })
        .collect();

    Ok(lines.join("\n"))
}

/// Gateway that shells out to the interface tools, optionally through sudo
pub struct CommandGateway {
    mode: GatewayMode,
    sudo_binary: String,
    style: CommandStyle,
    /// One authorization event covers one batch; batches never interleave
    serial: Mutex<()>,
}

impl CommandGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_style(config, CommandStyle::native())
    }

    pub fn with_style(config: &GatewayConfig, style: CommandStyle) -> Self {
        Self {
            mode: config.mode,
            sudo_binary: config.sudo_binary.clone(),
            style,
            serial: Mutex::new(()),
        }
    }

    fn command(&self, script: &str) -> Command {
        let mut command = match self.mode {
            GatewayMode::Sudo => {
                let mut c = Command::new(&self.sudo_binary);
                c.args(["sh", "-c", script]);
                c
            }
            GatewayMode::Direct => {
                let mut c = Command::new("sh");
                c.args(["-c", script]);
                c
            }
        };
        command.kill_on_drop(true);
        command
    }

    async fn run(&self, script: &str) -> Result<Output> {
        let _serial = self.serial.lock().await;

        let output = self.command(script).output().await.map_err(|e| {
            SnapError::PrivilegedOperationFailure(format!("failed to run command: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SnapError::PrivilegedOperationFailure(if stderr.is_empty() {
                format!("command exited with {}", output.status)
            } else {
                stderr
            }));
        }

        Ok(output)
    }

    async fn apply(&self, op: GatewayOp, interface: &str, bindings: &[AddressBinding]) -> Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }

        let script = build_script(self.style, op, interface, bindings)?;
        debug!(op = op.as_str(), interface, count = bindings.len(), "Running gateway batch");

        self.run(&script).await.map_err(|e| {
            warn!(op = op.as_str(), interface, error = %e, "Gateway batch failed");
            e
        })?;

        info!(
            op = op.as_str(),
            interface,
            count = bindings.len(),
            "Gateway batch applied"
        );
        Ok(())
    }
}

#[async_trait]
impl NetworkGateway for CommandGateway {
    #[instrument(skip(self, bindings), fields(count = bindings.len()))]
    async fn reserve(&self, interface: &str, bindings: &[AddressBinding]) -> Result<()> {
        self.apply(GatewayOp::Reserve, interface, bindings).await
    }

    #[instrument(skip(self, bindings), fields(count = bindings.len()))]
    async fn release(&self, interface: &str, bindings: &[AddressBinding]) -> Result<()> {
        self.apply(GatewayOp::Release, interface, bindings).await
    }

    async fn authorize(&self) -> Result<()> {
        if self.mode == GatewayMode::Direct {
            return Ok(());
        }
        self.run("true").await?;
        info!("Privileged gateway authorized");
        Ok(())
    }
}
