//! External proxy engine: config artifacts and process launching
//!
//! The engine is 3proxy. Each started process gets its own config file, so a
//! replacement process can run next to the original during a graceful rotation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::models::{InstanceSpec, ProxyKind};

/// Process-level signal emitted by a running engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The process could not be observed any more
    Error(String),
    /// The process exited without being asked to
    Exited(Option<i32>),
}

/// Request to terminate an engine process
pub struct StopRequest {
    /// Time between SIGTERM and SIGKILL
    pub grace: Duration,
    /// Signalled once the process is gone
    pub done: oneshot::Sender<()>,
}

/// A freshly launched engine process
pub struct SpawnedEngine {
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub stop: oneshot::Sender<StopRequest>,
}

/// Starts engine processes from a config artifact
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, instance_id: i64, config_path: &Path) -> std::io::Result<SpawnedEngine>;
}

/// Writes and removes engine config artifacts
pub struct EngineConfigWriter {
    dir: PathBuf,
    dns_server: String,
    generation: AtomicU64,
}

impl EngineConfigWriter {
    pub fn new(dir: impl Into<PathBuf>, dns_server: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            dns_server: dns_server.into(),
            generation: AtomicU64::new(0),
        }
    }

    /// Render the config consumed by the engine
    pub fn render(&self, spec: &InstanceSpec) -> String {
        let mut config = format!("# 3proxy configuration for proxy {}\n", spec.id);
        config.push_str(&format!("nserver {}\n", self.dns_server));
        config.push_str("nscache 65536\n");
        config.push_str("timeouts 1 5 30 60 180 1800 15 60\n");

        match &spec.credentials {
            Some(credentials) => {
                config.push_str(&format!(
                    "users {}:CL:{}\n",
                    credentials.username, credentials.password
                ));
                config.push_str("auth strong\n");
            }
            None => config.push_str("auth none\n"),
        }

        config.push_str("allow *\n");
        config.push_str(&format!("external {}\n", spec.bound_address));

        let service = match spec.kind {
            ProxyKind::Http => "proxy",
            ProxyKind::Socks5 => "socks",
        };
        config.push_str(&format!(
            "{} -6 -p{} -i127.0.0.1 -e{}\n",
            service, spec.listen_port, spec.bound_address
        ));

        config
    }

    /// Write a new artifact for `spec` and return its path
    pub async fn write(&self, spec: &InstanceSpec) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("proxy-{}-{}.cfg", spec.id, generation));

        tokio::fs::write(&path, self.render(spec)).await?;
        debug!(instance_id = spec.id, path = %path.display(), "Wrote engine config");
        Ok(path)
    }

    /// Remove an artifact; failures are logged
    pub async fn remove(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Removed engine config"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove engine config"),
        }
    }
}

/// Launches the engine binary as a child process
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

fn forward_output<R>(instance_id: i64, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stream == "stderr" {
                warn!(instance_id, stream, "{}", line);
            } else {
                debug!(instance_id, stream, "{}", line);
            }
        }
    });
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate(instance_id: i64, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(instance_id, pid, error = %e, "SIGTERM failed");
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(instance_id, ?status, "Engine exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(instance_id, error = %e, "Failed to wait for engine");
        }
        Err(_) => {
            warn!(instance_id, "Engine ignored SIGTERM, sending SIGKILL");
            if let Err(e) = child.start_kill() {
                debug!(instance_id, error = %e, "SIGKILL failed");
            }
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self, instance_id: i64, config_path: &Path) -> std::io::Result<SpawnedEngine> {
        let mut child = Command::new(&self.binary)
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        info!(instance_id, pid, binary = %self.binary.display(), "Engine process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(instance_id, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(instance_id, "stderr", stderr);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<StopRequest>();

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let event = match status {
                        Ok(status) => EngineEvent::Exited(status.code()),
                        Err(e) => EngineEvent::Error(e.to_string()),
                    };
                    let _ = event_tx.send(event);
                }
                request = stop_rx => {
                    if let Ok(request) = request {
                        terminate(instance_id, &mut child, request.grace).await;
                        let _ = request.done.send(());
                    } else {
                        terminate(instance_id, &mut child, Duration::ZERO).await;
                    }
                }
            }
        });

        Ok(SpawnedEngine {
            pid,
            events: event_rx,
            stop: stop_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credentials;

    fn spec(kind: ProxyKind, credentials: Option<Credentials>) -> InstanceSpec {
        InstanceSpec {
            id: 3,
            kind,
            listen_port: 10003,
            bound_address: "2001:db8::3".parse().unwrap(),
            interface_name: "eth0".into(),
            prefix_length: 64,
            credentials,
        }
    }

    #[test]
    fn test_render_http_without_auth() {
        let writer = EngineConfigWriter::new("/tmp", "8.8.8.8");
        let config = writer.render(&spec(ProxyKind::Http, None));

        assert!(config.contains("nserver 8.8.8.8\n"));
        assert!(config.contains("nscache 65536\n"));
        assert!(config.contains("timeouts 1 5 30 60 180 1800 15 60\n"));
        assert!(config.contains("auth none\n"));
        assert!(!config.contains("users "));
        assert!(config.contains("external 2001:db8::3\n"));
        assert!(config.ends_with("proxy -6 -p10003 -i127.0.0.1 -e2001:db8::3\n"));
    }

    #[test]
    fn test_render_socks_with_auth() {
        let writer = EngineConfigWriter::new("/tmp", "1.1.1.1");
        let config = writer.render(&spec(
            ProxyKind::Socks5,
            Some(Credentials {
                username: "alice".into(),
                password: "s3cret".into(),
            }),
        ));

        let users = config.find("users alice:CL:s3cret\n").unwrap();
        let auth = config.find("auth strong\n").unwrap();
        let allow = config.find("allow *\n").unwrap();
        assert!(users < auth && auth < allow);
        assert!(config.ends_with("socks -6 -p10003 -i127.0.0.1 -e2001:db8::3\n"));
    }

    #[tokio::test]
    async fn test_write_creates_distinct_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let writer = EngineConfigWriter::new(dir.path().join("configs"), "8.8.8.8");
        let spec = spec(ProxyKind::Http, None);

        let first = writer.write(&spec).await.unwrap();
        let second = writer.write(&spec).await.unwrap();

        assert_ne!(first, second);
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("proxy-3-"));
        assert_eq!(
            tokio::fs::read_to_string(&first).await.unwrap(),
            writer.render(&spec)
        );

        writer.remove(&first).await;
        assert!(!first.exists());
        assert!(second.exists());

        // Removing twice is harmless
        writer.remove(&first).await;
    }

    async fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("engine.sh");
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_launcher_reports_unexpected_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "exit 3\n").await;

        let mut engine = ProcessLauncher::new("sh").launch(1, &path).await.unwrap();
        assert!(engine.pid.is_some());
        assert_eq!(engine.events.recv().await, Some(EngineEvent::Exited(Some(3))));
    }

    #[tokio::test]
    async fn test_launcher_stops_with_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "exec sleep 30\n").await;

        let mut engine = ProcessLauncher::new("sh").launch(1, &path).await.unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        engine
            .stop
            .send(StopRequest {
                grace: Duration::from_secs(5),
                done: done_tx,
            })
            .ok()
            .unwrap();

        timeout(Duration::from_secs(3), done_rx).await.unwrap().unwrap();
        assert_eq!(engine.events.recv().await, None);
    }

    #[tokio::test]
    async fn test_launcher_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            dir.path(),
            "trap '' TERM\nwhile true; do sleep 0.1; done\n",
        )
        .await;

        let engine = ProcessLauncher::new("sh").launch(1, &path).await.unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (done_tx, done_rx) = oneshot::channel();
        engine
            .stop
            .send(StopRequest {
                grace: Duration::from_millis(300),
                done: done_tx,
            })
            .ok()
            .unwrap();

        timeout(Duration::from_secs(3), done_rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_launcher_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "").await;

        let result = ProcessLauncher::new("/nonexistent/3proxy").launch(1, &path).await;
        assert!(result.is_err());
    }
}
