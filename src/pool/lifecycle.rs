//! Instance lifecycle: start, stop, batch start and teardown

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::allocator::AddressPool;
use super::engine::{EngineConfigWriter, EngineEvent, EngineLauncher};
use super::gateway::{validate_interface_name, SharedGateway};
use super::health::{EgressProbe, HealthChecker};
use super::interfaces::SharedInterfaces;
use super::registry::{InstanceSlot, LockedSlot, ProxyPoolRegistry};
use super::supervisor::{ProcessSupervisor, StartedEngine};
use crate::config::Config;
use crate::error::Result;
use crate::models::{
    AddressBinding, BatchReport, EngineHandleId, InstanceSpec, LifecycleState, ProxyInstance,
};

/// Timing and engine settings of a pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub config_dir: PathBuf,
    pub dns_server: String,
    pub kill_grace: Duration,
    pub startup_delay: Duration,
    pub health_attempts: u32,
    pub health_delay: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            config_dir: config.engine.config_dir.clone(),
            dns_server: config.engine.dns_server.clone(),
            kill_grace: config.engine.kill_grace,
            startup_delay: config.engine.startup_delay,
            health_attempts: config.health.attempts,
            health_delay: config.health.initial_delay,
        }
    }
}

/// Group bindings per interface, keeping the order interfaces first appear in
pub(crate) fn group_by_interface<I>(items: I) -> Vec<(String, Vec<AddressBinding>)>
where
    I: IntoIterator<Item = (String, AddressBinding)>,
{
    let mut groups: Vec<(String, Vec<AddressBinding>)> = Vec::new();
    for (interface, binding) in items {
        match groups.iter_mut().find(|(name, _)| *name == interface) {
            Some((_, bindings)) => bindings.push(binding),
            None => groups.push((interface, vec![binding])),
        }
    }
    groups
}

/// The pool of proxy instances and the collaborators that run them
pub struct ProxyPool {
    pub(crate) registry: Arc<ProxyPoolRegistry>,
    pub(crate) addresses: Arc<AddressPool>,
    pub(crate) gateway: SharedGateway,
    pub(crate) supervisor: Arc<ProcessSupervisor>,
    pub(crate) health: Arc<HealthChecker>,
    pub(crate) interfaces: SharedInterfaces,
    pub(crate) startup_delay: Duration,
}

impl ProxyPool {
    pub fn new(
        settings: PoolSettings,
        gateway: SharedGateway,
        launcher: Arc<dyn EngineLauncher>,
        probe: Arc<dyn EgressProbe>,
        interfaces: SharedInterfaces,
    ) -> Self {
        let registry = Arc::new(ProxyPoolRegistry::new());
        let writer = EngineConfigWriter::new(settings.config_dir, settings.dns_server);
        let supervisor = Arc::new(ProcessSupervisor::new(launcher, writer, settings.kill_grace));
        let health = Arc::new(HealthChecker::new(
            registry.clone(),
            probe,
            settings.health_attempts,
            settings.health_delay,
        ));

        Self {
            registry,
            addresses: Arc::new(AddressPool::new()),
            gateway,
            supervisor,
            health,
            interfaces,
            startup_delay: settings.startup_delay,
        }
    }

    pub fn registry(&self) -> &Arc<ProxyPoolRegistry> {
        &self.registry
    }

    pub fn addresses(&self) -> &Arc<AddressPool> {
        &self.addresses
    }

    pub fn interfaces(&self) -> &SharedInterfaces {
        &self.interfaces
    }

    pub fn get(&self, id: i64) -> Result<ProxyInstance> {
        self.registry.snapshot(id)
    }

    pub fn list(&self) -> Vec<ProxyInstance> {
        self.registry.list()
    }

    /// Live engine processes, including ones still draining
    pub fn engine_count(&self) -> usize {
        self.supervisor.running_count()
    }

    pub fn proxy_uri(&self, id: i64) -> Result<String> {
        Ok(self.registry.snapshot(id)?.proxy_uri())
    }

    /// Run one health check with retry on an instance
    pub async fn health_check(&self, id: i64) -> Result<bool> {
        self.registry.get(id)?;
        Ok(self.health.verify(id).await)
    }

    /// Start a single configured instance.
    ///
    /// A rejected call leaves no trace in the registry. A spawn failure leaves
    /// the instance registered in `Error` and is propagated.
    #[instrument(skip(self, spec), fields(instance_id = spec.id, port = spec.listen_port, address = %spec.bound_address))]
    pub async fn start(&self, spec: InstanceSpec) -> Result<ProxyInstance> {
        validate_interface_name(&spec.interface_name)?;

        let aux = self.interfaces.lan_address();
        let locked = self.registry.insert(ProxyInstance::from_spec(&spec, aux))?;
        let slot = &locked.slot;

        if let Err(e) = self.addresses.reserve(spec.bound_address) {
            self.registry.remove_slot(slot);
            return Err(e);
        }

        let binding = AddressBinding::new(spec.bound_address, spec.prefix_length);
        if let Err(e) = self.gateway.reserve(&spec.interface_name, &[binding]).await {
            self.registry.remove_slot(slot);
            self.addresses.release(spec.bound_address);
            return Err(e);
        }

        match self.supervisor.start(&spec).await {
            Ok(started) => self.attach(slot, started),
            Err(e) => {
                slot.update(|instance| instance.lifecycle_state = LifecycleState::Error);
                error!(error = %e, "Failed to start engine");
                return Err(e);
            }
        }

        tokio::time::sleep(self.startup_delay).await;
        let healthy = self.health.verify(spec.id).await;
        info!(healthy, "Proxy instance started");

        Ok(slot.snapshot())
    }

    /// Start many configured instances with one gateway call per interface.
    ///
    /// Admission failures and spawn failures are reported per instance. A failed
    /// gateway call aborts the whole batch before any engine is started.
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn start_many(&self, specs: Vec<InstanceSpec>) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        let aux = self.interfaces.lan_address();

        let mut admitted: Vec<(LockedSlot, InstanceSpec)> = Vec::with_capacity(specs.len());
        for spec in specs {
            if let Err(e) = validate_interface_name(&spec.interface_name) {
                report.fail(spec.id, e);
                continue;
            }
            let slot = match self.registry.insert(ProxyInstance::from_spec(&spec, aux)) {
                Ok(slot) => slot,
                Err(e) => {
                    report.fail(spec.id, e);
                    continue;
                }
            };
            if let Err(e) = self.addresses.reserve(spec.bound_address) {
                self.registry.remove_slot(&slot.slot);
                report.fail(spec.id, e);
                continue;
            }
            admitted.push((slot, spec));
        }

        if admitted.is_empty() {
            return Ok(report);
        }

        let groups = group_by_interface(admitted.iter().map(|(_, spec)| {
            (
                spec.interface_name.clone(),
                AddressBinding::new(spec.bound_address, spec.prefix_length),
            )
        }));

        let mut reserved: Vec<&(String, Vec<AddressBinding>)> = Vec::new();
        for group in &groups {
            if let Err(e) = self.gateway.reserve(&group.0, &group.1).await {
                error!(interface = %group.0, error = %e, "Batch reservation failed, aborting");
                for (interface, bindings) in reserved {
                    if let Err(release_err) = self.gateway.release(interface, bindings).await {
                        warn!(interface = %interface, error = %release_err, "Failed to roll back reservation");
                    }
                }
                for (slot, spec) in &admitted {
                    self.registry.remove_slot(&slot.slot);
                    self.addresses.release(spec.bound_address);
                }
                return Err(e);
            }
            reserved.push(group);
        }

        let mut started_ids = Vec::new();
        for (slot, spec) in &admitted {
            match self.supervisor.start(spec).await {
                Ok(started) => {
                    self.attach(&slot.slot, started);
                    started_ids.push(spec.id);
                }
                Err(e) => {
                    slot.update(|instance| instance.lifecycle_state = LifecycleState::Error);
                    warn!(instance_id = spec.id, error = %e, "Failed to start engine");
                    report.fail(spec.id, e);
                }
            }
        }

        if !started_ids.is_empty() {
            tokio::time::sleep(self.startup_delay).await;
        }
        for (id, healthy) in self.health.verify_many(&started_ids).await {
            let address = self.registry.get(id).map(|slot| slot.read(|i| i.bound_address));
            match address {
                Ok(address) => report.succeed(id, address, healthy),
                Err(e) => report.fail(id, e),
            }
        }

        drop(admitted);
        info!(
            started = report.succeeded_ids().len(),
            failed = report.failed_ids().len(),
            "Batch start finished"
        );
        Ok(report)
    }

    /// Stop an instance. It stays registered in `Stopped`.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: i64) -> Result<ProxyInstance> {
        let locked = self.registry.lock(id).await?;
        self.retire(&locked.slot, None).await;
        info!("Proxy instance stopped");
        Ok(locked.snapshot())
    }

    /// Stop an instance, forget it and give its address back
    #[instrument(skip(self))]
    pub async fn remove(&self, id: i64) -> Result<ProxyInstance> {
        let locked = self.registry.lock(id).await?;
        self.retire(&locked.slot, None).await;
        self.registry.remove_slot(&locked.slot);

        let instance = locked.snapshot();
        self.addresses.release(instance.bound_address);

        let binding = AddressBinding::new(instance.bound_address, instance.prefix_length);
        if let Err(e) = self.gateway.release(&instance.interface_name, &[binding]).await {
            warn!(error = %e, "Failed to release address of removed instance");
        }

        info!("Proxy instance removed");
        Ok(instance)
    }

    /// Stop every instance concurrently and clear the registry
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> Vec<ProxyInstance> {
        let ids = self.registry.ids();

        let stopped = join_all(ids.into_iter().map(|id| async move {
            let locked = self.registry.lock(id).await.ok()?;
            self.retire(&locked.slot, None).await;
            self.registry.remove_slot(&locked.slot);
            let instance = locked.snapshot();
            self.addresses.release(instance.bound_address);
            Some(instance)
        }))
        .await;

        let stopped: Vec<_> = stopped.into_iter().flatten().collect();
        info!(count = stopped.len(), "All proxy instances stopped");
        stopped
    }

    /// Stop everything and release every bound address, one call per interface
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> usize {
        let stopped = self.stop_all().await;

        let groups = group_by_interface(stopped.iter().map(|instance| {
            (
                instance.interface_name.clone(),
                AddressBinding::new(instance.bound_address, instance.prefix_length),
            )
        }));

        for (interface, bindings) in &groups {
            if let Err(e) = self.gateway.release(interface, bindings).await {
                warn!(interface = %interface, error = %e, "Failed to release addresses");
            }
        }

        stopped.len()
    }

    /// Release every global address on `interface` except `keep` and the
    /// addresses of registered instances. Returns how many were released.
    #[instrument(skip(self))]
    pub async fn reset_interface(&self, interface: &str, keep: Ipv6Addr) -> Result<usize> {
        validate_interface_name(interface)?;

        let in_use: HashSet<Ipv6Addr> = self.addresses.exclusion_set();
        let stale: Vec<AddressBinding> = self
            .interfaces
            .addresses_on(interface)?
            .into_iter()
            .filter(|binding| binding.address != keep && !in_use.contains(&binding.address))
            .collect();

        if stale.is_empty() {
            debug!("No stale addresses on interface");
            return Ok(0);
        }

        self.gateway.release(interface, &stale).await?;
        info!(count = stale.len(), "Interface reset");
        Ok(stale.len())
    }

    /// Record a started engine on the instance and begin consuming its events
    pub(crate) fn attach(&self, slot: &Arc<InstanceSlot>, started: StartedEngine) {
        slot.update(|instance| instance.attach_engine(started.handle, started.pid));
        self.dispatch(slot.clone(), started.handle, started.events);
    }

    /// Single dispatch point for the events of one engine process.
    ///
    /// Events from an engine that is no longer the instance's current one only
    /// reap the process; they never change the instance.
    pub(crate) fn dispatch(
        &self,
        slot: Arc<InstanceSlot>,
        handle: EngineHandleId,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let supervisor = self.supervisor.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::Error(reason) => {
                        let current = slot.update(|instance| {
                            let current = instance.engine_handle == Some(handle);
                            if current {
                                instance.lifecycle_state = LifecycleState::Error;
                            }
                            current
                        });
                        if current {
                            error!(instance_id = slot.id(), %handle, reason, "Engine reported an error");
                        }
                    }
                    EngineEvent::Exited(code) => {
                        let stopped = slot.update(|instance| {
                            let live = instance.engine_handle == Some(handle)
                                && instance.lifecycle_state != LifecycleState::Draining;
                            if live {
                                instance.detach_engine();
                            }
                            live
                        });
                        supervisor.reap(handle).await;
                        if stopped {
                            warn!(instance_id = slot.id(), %handle, ?code, "Engine exited, instance stopped");
                        }
                    }
                }
            }
        });
    }

    /// Stop the instance's current engine, after an optional drain period
    pub(crate) async fn retire(&self, slot: &InstanceSlot, drain: Option<Duration>) {
        if let Some(drain) = drain {
            slot.update(|instance| {
                if instance.engine_handle.is_some() {
                    instance.lifecycle_state = LifecycleState::Draining;
                }
            });
            tokio::time::sleep(drain).await;
        }

        let handle = slot.read(|instance| instance.engine_handle);
        if let Some(handle) = handle {
            self.supervisor.stop(handle).await;
        }
        slot.update(|instance| instance.detach_engine());
    }
}
