//! Supervision of engine processes
//!
//! Live process handles stay here. Instances only carry the `EngineHandleId`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::engine::{EngineConfigWriter, EngineEvent, EngineLauncher, StopRequest};
use crate::error::{Result, SnapError};
use crate::models::{EngineHandleId, InstanceSpec};

struct LiveProcess {
    instance_id: i64,
    pid: Option<u32>,
    config_path: PathBuf,
    stop: oneshot::Sender<StopRequest>,
}

/// A started engine, as handed back to the lifecycle layer
pub struct StartedEngine {
    pub handle: EngineHandleId,
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Starts, stops and tracks one engine process per instance
pub struct ProcessSupervisor {
    launcher: Arc<dyn EngineLauncher>,
    writer: EngineConfigWriter,
    processes: DashMap<EngineHandleId, LiveProcess>,
    next_handle: AtomicU64,
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn EngineLauncher>, writer: EngineConfigWriter, kill_grace: Duration) -> Self {
        Self {
            launcher,
            writer,
            processes: DashMap::new(),
            next_handle: AtomicU64::new(1),
            kill_grace,
        }
    }

    /// Write a config artifact for `spec` and spawn an engine on it
    #[instrument(skip(self, spec), fields(instance_id = spec.id, address = %spec.bound_address))]
    pub async fn start(&self, spec: &InstanceSpec) -> Result<StartedEngine> {
        let config_path = self.writer.write(spec).await.map_err(|e| SnapError::EngineSpawnFailure {
            id: spec.id,
            reason: format!("failed to write config: {}", e),
        })?;

        let spawned = match self.launcher.launch(spec.id, &config_path).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.writer.remove(&config_path).await;
                return Err(SnapError::EngineSpawnFailure {
                    id: spec.id,
                    reason: e.to_string(),
                });
            }
        };

        let handle = EngineHandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.processes.insert(
            handle,
            LiveProcess {
                instance_id: spec.id,
                pid: spawned.pid,
                config_path,
                stop: spawned.stop,
            },
        );

        info!(%handle, pid = spawned.pid, "Engine started");

        Ok(StartedEngine {
            handle,
            pid: spawned.pid,
            events: spawned.events,
        })
    }

    /// Terminate an engine and remove its artifact.
    ///
    /// Stopping a process that already exited is not an error.
    #[instrument(skip(self))]
    pub async fn stop(&self, handle: EngineHandleId) {
        let Some((_, process)) = self.processes.remove(&handle) else {
            debug!("Engine already gone");
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let request = StopRequest {
            grace: self.kill_grace,
            done: done_tx,
        };

        if process.stop.send(request).is_ok() {
            if done_rx.await.is_err() {
                debug!(instance_id = process.instance_id, "Engine monitor ended before stop completed");
            }
        } else {
            debug!(instance_id = process.instance_id, "Engine had already exited");
        }

        self.writer.remove(&process.config_path).await;
        info!(instance_id = process.instance_id, pid = process.pid, "Engine stopped");
    }

    /// Forget an engine that exited on its own
    pub async fn reap(&self, handle: EngineHandleId) {
        if let Some((_, process)) = self.processes.remove(&handle) {
            self.writer.remove(&process.config_path).await;
            warn!(%handle, instance_id = process.instance_id, "Engine exited unexpectedly");
        }
    }

    pub fn running_count(&self) -> usize {
        self.processes.len()
    }
}
