//! Address rotation, single and batched, simple and graceful
//!
//! Simple rotations reserve the new address, stop the engine, release the old
//! address and start again on the new one. Graceful rotations start the
//! replacement first, drain the original and release its address only after a
//! safety delay. Gateway calls of a batch are grouped per interface, so a batch
//! costs one privileged call per interface and direction.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::allocator::{prefix_base, AddressAllocator};
use super::gateway::GatewayOp;
use super::lifecycle::{group_by_interface, ProxyPool};
use super::registry::InstanceSlot;
use crate::config::RotationDefaults;
use crate::error::{Result, SnapError};
use crate::models::{
    AddressBinding, BatchReport, LifecycleState, NetworkInterfaceDescriptor, ProxyInstance,
    RotationConfig, RotationEvent, RotationMode, RotationOutcome, RotationStyle, RotationTarget,
};
use crate::services::rotation_scheduler::RotationScheduler;

const EVENT_CHANNEL_CAPACITY: usize = 256;

type Groups = Vec<(String, Vec<AddressBinding>)>;

/// One instance's planned move, with its new address already claimed in the pool
struct Plan {
    slot: Arc<InstanceSlot>,
    before: ProxyInstance,
    new_address: Ipv6Addr,
}

impl Plan {
    fn id(&self) -> i64 {
        self.before.id
    }

    fn old_binding(&self) -> (String, AddressBinding) {
        (
            self.before.interface_name.clone(),
            AddressBinding::new(self.before.bound_address, self.before.prefix_length),
        )
    }

    fn new_binding(&self) -> (String, AddressBinding) {
        (
            self.before.interface_name.clone(),
            AddressBinding::new(self.new_address, self.before.prefix_length),
        )
    }

    /// Whether the instance should serve again after the move
    fn restarts(&self) -> bool {
        self.before.lifecycle_state != LifecycleState::Stopped
    }
}

/// Result of one planned move that got past the gateway
struct Settled {
    id: i64,
    old_address: Ipv6Addr,
    new_address: Ipv6Addr,
    result: Result<bool>,
}

pub struct RotationOrchestrator {
    pool: Arc<ProxyPool>,
    config: ArcSwap<RotationConfig>,
    /// Serializes reconfiguration so cancel and re-arm are one step
    reconfigure: AsyncMutex<()>,
    network: RwLock<Option<NetworkInterfaceDescriptor>>,
    events: broadcast::Sender<RotationEvent>,
    scheduler: RotationScheduler,
    pending_releases: Mutex<Vec<JoinHandle<()>>>,
    release_safety_delay: Duration,
    default_drain: Duration,
    torn_down: AtomicBool,
}

impl RotationOrchestrator {
    pub fn new(pool: Arc<ProxyPool>, defaults: &RotationDefaults) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            config: ArcSwap::from_pointee(RotationConfig::default()),
            reconfigure: AsyncMutex::new(()),
            network: RwLock::new(None),
            events,
            scheduler: RotationScheduler::new(),
            pending_releases: Mutex::new(Vec::new()),
            release_safety_delay: defaults.release_safety_delay,
            default_drain: defaults.default_drain,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn config(&self) -> RotationConfig {
        RotationConfig::clone(&self.config.load())
    }

    pub fn default_drain(&self) -> Duration {
        self.default_drain
    }

    pub fn network(&self) -> Option<NetworkInterfaceDescriptor> {
        self.network.read().clone()
    }

    pub fn set_network(&self, descriptor: Option<NetworkInterfaceDescriptor>) {
        if let Some(descriptor) = &descriptor {
            info!(interface = %descriptor.name, prefix = %descriptor.prefix_base, "Network interface set");
        }
        *self.network.write() = descriptor;
    }

    /// Receiver of rotation-completed events
    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.events.subscribe()
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduler.is_armed()
    }

    /// Fresh addresses in the configured prefix, not yet claimed by anything
    pub fn generate(&self, count: usize) -> Result<Vec<Ipv6Addr>> {
        let network = self.network().ok_or(SnapError::NetworkNotConfigured)?;
        AddressAllocator::generate_many(
            network.prefix_base,
            network.prefix_length,
            count,
            &self.pool.addresses.exclusion_set(),
        )
    }

    /// Replace the rotation config.
    ///
    /// Any armed timer is cancelled before the new one is armed. Interval mode
    /// asks the gateway for authorization up front so ticks never prompt.
    #[instrument(skip(self, config), fields(mode = ?config.mode, interval = ?config.interval_seconds))]
    pub async fn set_config(self: &Arc<Self>, config: RotationConfig) -> Result<()> {
        config.validate()?;
        let _reconfigure = self.reconfigure.lock().await;

        self.ensure_running()?;
        if config.mode == RotationMode::Interval {
            self.pool.gateway.authorize().await?;
            // Teardown does not wait for reconfiguration
            self.ensure_running()?;
        }

        self.scheduler.cancel();
        let period = config.period();
        self.config.store(Arc::new(config));

        if let Some(period) = period {
            let orchestrator = Arc::downgrade(self);
            self.scheduler.arm(period, move || {
                let orchestrator = orchestrator.clone();
                async move {
                    if let Some(orchestrator) = orchestrator.upgrade() {
                        orchestrator.run_scheduled().await;
                    }
                }
            });
            if self.torn_down.load(Ordering::SeqCst) {
                self.scheduler.cancel();
            }
        }

        info!("Rotation config updated");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SnapError::InvalidRequest(
                "rotation orchestrator has been shut down".into(),
            ));
        }
        Ok(())
    }

    async fn run_scheduled(&self) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        match self.rotate_all().await {
            Ok(report) => info!(
                rotated = report.succeeded_ids().len(),
                failed = report.failed_ids().len(),
                "Scheduled rotation finished"
            ),
            Err(e) => error!(error = %e, "Scheduled rotation failed"),
        }
    }

    /// Cancel the timer for good. No scheduled rotation starts afterwards.
    pub fn teardown(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
        if self.scheduler.cancel() {
            info!("Rotation scheduler stopped");
        }
    }

    /// Wait for every deferred address release to finish
    pub async fn flush_pending_releases(&self) {
        let pending = std::mem::take(&mut *self.pending_releases.lock());
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Waiting for deferred address releases");
        join_all(pending).await;
    }

    /// Rotate every instance that is not stopped, following the current config
    #[instrument(skip(self))]
    pub async fn rotate_all(&self) -> Result<BatchReport> {
        let config = self.config();
        let style = config.style(self.default_drain);
        let ids: Vec<i64> = self
            .pool
            .list()
            .into_iter()
            .filter(|instance| instance.lifecycle_state != LifecycleState::Stopped)
            .map(|instance| instance.id)
            .collect();

        if ids.is_empty() {
            debug!("No instances to rotate");
            return Ok(BatchReport::new());
        }

        let Some(stagger) = config.stagger() else {
            return self
                .rotate_many(ids.into_iter().map(RotationTarget::generated).collect(), style)
                .await;
        };

        let mut report = BatchReport::new();
        for (index, id) in ids.iter().copied().enumerate() {
            if self.torn_down.load(Ordering::SeqCst) {
                info!(remaining = ids.len() - index, "Staggered rotation interrupted by shutdown");
                break;
            }
            match self.rotate(id, None, style).await {
                Ok(outcome) => report.succeed(id, outcome.new_address, outcome.healthy),
                Err(e) => {
                    warn!(instance_id = id, error = %e, "Staggered rotation failed");
                    report.fail(id, e);
                }
            }
            if index + 1 < ids.len() {
                tokio::time::sleep(stagger).await;
            }
        }
        Ok(report)
    }

    /// Move one instance to `new_address`, or to a generated address
    #[instrument(skip(self, style), fields(style = style.as_str()))]
    pub async fn rotate(
        &self,
        id: i64,
        new_address: Option<Ipv6Addr>,
        style: RotationStyle,
    ) -> Result<RotationOutcome> {
        let locked = self.pool.registry.lock(id).await?;
        let plan = self.plan(&locked.slot, new_address)?;
        let rotation_id = Uuid::new_v4();

        let settled = match style {
            RotationStyle::Graceful { drain } if plan.before.engine_handle.is_some() => {
                self.run_graceful(vec![plan], drain, rotation_id).await?
            }
            _ => self.run_simple(vec![plan], rotation_id).await?,
        };

        let settled = settled
            .into_iter()
            .next()
            .ok_or_else(|| SnapError::Internal(format!("rotation of instance {} settled nothing", id)))?;
        let healthy = settled.result?;

        info!(old = %settled.old_address, new = %settled.new_address, healthy, "Instance rotated");
        Ok(RotationOutcome {
            instance_id: id,
            old_address: settled.old_address,
            new_address: settled.new_address,
            healthy,
        })
    }

    /// Rotate several instances with shared gateway calls.
    ///
    /// Unknown ids and address claims are reported per instance. A refused
    /// gateway call fails the whole batch and leaves every instance as it was.
    #[instrument(skip(self, targets, style), fields(count = targets.len(), style = style.as_str()))]
    pub async fn rotate_many(
        &self,
        targets: Vec<RotationTarget>,
        style: RotationStyle,
    ) -> Result<BatchReport> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = targets.iter().find(|target| !seen.insert(target.id)) {
            return Err(SnapError::InvalidRequest(format!(
                "instance {} is listed more than once",
                duplicate.id
            )));
        }

        let mut report = BatchReport::new();
        let targets: Vec<RotationTarget> = targets
            .into_iter()
            .filter(|target| {
                let known = self.pool.registry.contains(target.id);
                if !known {
                    report.fail(target.id, SnapError::InstanceNotFound { id: target.id });
                }
                known
            })
            .collect();

        // Ascending id order, so two batches never deadlock
        let mut ids: Vec<i64> = targets.iter().map(|target| target.id).collect();
        ids.sort_unstable();

        let mut locked = Vec::with_capacity(ids.len());
        for id in ids {
            match self.pool.registry.lock(id).await {
                Ok(slot) => locked.push(slot),
                Err(e) => {
                    warn!(instance_id = id, error = %e, "Instance vanished before rotation");
                    report.fail(id, e);
                }
            }
        }

        let mut plans = Vec::with_capacity(targets.len());
        for target in &targets {
            let Some(slot) = locked.iter().find(|l| l.id() == target.id) else {
                continue;
            };
            match self.plan(&slot.slot, target.new_address) {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    warn!(instance_id = target.id, error = %e, "Cannot plan rotation");
                    report.fail(target.id, e);
                }
            }
        }

        if plans.is_empty() {
            return Ok(report);
        }

        let rotation_id = Uuid::new_v4();
        let settled = match style {
            RotationStyle::Simple => self.run_simple(plans, rotation_id).await?,
            RotationStyle::Graceful { drain } => {
                let (live, idle): (Vec<_>, Vec<_>) = plans
                    .into_iter()
                    .partition(|plan| plan.before.engine_handle.is_some());

                let mut settled = match self.run_graceful(live, drain, rotation_id).await {
                    Ok(settled) => settled,
                    Err(e) => {
                        self.abandon(&idle);
                        return Err(e);
                    }
                };
                let idle_ids: Vec<i64> = idle.iter().map(Plan::id).collect();
                match self.run_simple(idle, rotation_id).await {
                    Ok(rest) => settled.extend(rest),
                    Err(e) if settled.is_empty() => return Err(e),
                    Err(e) => {
                        for id in idle_ids {
                            report.fail(id, &e);
                        }
                    }
                }
                settled
            }
        };

        for entry in settled {
            match entry.result {
                Ok(healthy) => report.succeed(entry.id, entry.new_address, healthy),
                Err(e) => report.fail(entry.id, e),
            }
        }

        drop(locked);
        info!(
            rotated = report.succeeded_ids().len(),
            failed = report.failed_ids().len(),
            "Batch rotation finished"
        );
        Ok(report)
    }

    /// Claim the target address of one instance in the pool
    fn plan(&self, slot: &Arc<InstanceSlot>, requested: Option<Ipv6Addr>) -> Result<Plan> {
        let before = slot.snapshot();

        let new_address = match requested {
            Some(address) if address == before.bound_address => {
                return Err(SnapError::InvalidRequest(format!(
                    "instance {} is already bound to {}",
                    before.id, address
                )))
            }
            Some(address) => {
                self.pool.addresses.reserve(address)?;
                address
            }
            None => {
                let (base, prefix_length) = self.prefix_for(&before);
                self.pool.addresses.allocate(base, prefix_length)?
            }
        };

        Ok(Plan {
            slot: slot.clone(),
            before,
            new_address,
        })
    }

    /// Prefix new addresses are drawn from: the configured network when the
    /// instance lives on it, otherwise the instance's own prefix
    fn prefix_for(&self, instance: &ProxyInstance) -> (Ipv6Addr, u8) {
        match self.network.read().as_ref() {
            Some(network) if network.name == instance.interface_name => {
                (network.prefix_base, network.prefix_length)
            }
            _ => (
                prefix_base(instance.bound_address, instance.prefix_length),
                instance.prefix_length,
            ),
        }
    }

    /// Give back the claimed addresses of plans that will not run
    fn abandon(&self, plans: &[Plan]) {
        let addresses: Vec<Ipv6Addr> = plans.iter().map(|plan| plan.new_address).collect();
        self.pool.addresses.release_many(&addresses);
    }

    async fn gateway_call(&self, op: GatewayOp, interface: &str, bindings: &[AddressBinding]) -> Result<()> {
        match op {
            GatewayOp::Reserve => self.pool.gateway.reserve(interface, bindings).await,
            GatewayOp::Release => self.pool.gateway.release(interface, bindings).await,
        }
    }

    /// Apply `op` to every group, undoing the applied ones if a call fails
    async fn apply(&self, op: GatewayOp, groups: &Groups) -> Result<()> {
        for (index, (interface, bindings)) in groups.iter().enumerate() {
            if let Err(e) = self.gateway_call(op, interface, bindings).await {
                error!(op = op.as_str(), interface = %interface, error = %e, "Gateway call failed");
                self.undo(op, &groups[..index]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn undo(&self, op: GatewayOp, groups: &[(String, Vec<AddressBinding>)]) {
        let inverse = match op {
            GatewayOp::Reserve => GatewayOp::Release,
            GatewayOp::Release => GatewayOp::Reserve,
        };
        for (interface, bindings) in groups {
            if let Err(e) = self.gateway_call(inverse, interface, bindings).await {
                warn!(op = inverse.as_str(), interface = %interface, error = %e, "Gateway rollback failed");
            }
        }
    }

    /// Start the original engines again after an aborted simple rotation
    async fn restore(&self, plans: &[Plan]) {
        for plan in plans.iter().filter(|plan| plan.restarts()) {
            match self.pool.supervisor.start(&plan.before.spec()).await {
                Ok(started) => self.pool.attach(&plan.slot, started),
                Err(e) => {
                    plan.slot
                        .update(|instance| instance.lifecycle_state = LifecycleState::Error);
                    error!(instance_id = plan.id(), error = %e, "Failed to restore engine");
                }
            }
        }
    }

    fn emit(&self, rotation_id: Uuid, instance_id: i64, new_address: Ipv6Addr) {
        // No receivers is fine
        let _ = self.events.send(RotationEvent {
            rotation_id,
            instance_id,
            new_address,
            rotated_at: Utc::now(),
        });
    }

    async fn run_simple(&self, plans: Vec<Plan>, rotation_id: Uuid) -> Result<Vec<Settled>> {
        if plans.is_empty() {
            return Ok(Vec::new());
        }

        let new_groups = group_by_interface(plans.iter().map(Plan::new_binding));
        if let Err(e) = self.apply(GatewayOp::Reserve, &new_groups).await {
            self.abandon(&plans);
            return Err(e);
        }

        join_all(plans.iter().map(|plan| self.pool.retire(&plan.slot, None))).await;

        let old_groups = group_by_interface(plans.iter().map(Plan::old_binding));
        if let Err(e) = self.apply(GatewayOp::Release, &old_groups).await {
            self.undo(GatewayOp::Reserve, &new_groups).await;
            self.abandon(&plans);
            self.restore(&plans).await;
            return Err(e);
        }
        let old_addresses: Vec<Ipv6Addr> = plans.iter().map(|plan| plan.before.bound_address).collect();
        self.pool.addresses.release_many(&old_addresses);

        let mut settled = Vec::with_capacity(plans.len());
        let mut started = Vec::new();
        for plan in &plans {
            plan.slot.update(|instance| instance.rebind(plan.new_address));

            if !plan.restarts() {
                self.emit(rotation_id, plan.id(), plan.new_address);
                settled.push(Settled {
                    id: plan.id(),
                    old_address: plan.before.bound_address,
                    new_address: plan.new_address,
                    result: Ok(false),
                });
                continue;
            }

            let spec = plan.slot.read(|instance| instance.spec());
            match self.pool.supervisor.start(&spec).await {
                Ok(engine) => {
                    self.pool.attach(&plan.slot, engine);
                    self.emit(rotation_id, plan.id(), plan.new_address);
                    started.push(plan);
                }
                Err(e) => {
                    plan.slot
                        .update(|instance| instance.lifecycle_state = LifecycleState::Error);
                    warn!(instance_id = plan.id(), error = %e, "Failed to start engine on new address");
                    settled.push(Settled {
                        id: plan.id(),
                        old_address: plan.before.bound_address,
                        new_address: plan.new_address,
                        result: Err(e),
                    });
                }
            }
        }

        if !started.is_empty() {
            tokio::time::sleep(self.pool.startup_delay).await;
        }
        let ids: Vec<i64> = started.iter().map(|plan| plan.id()).collect();
        let health = self.pool.health.verify_many(&ids).await;
        for (plan, (_, healthy)) in started.iter().zip(health) {
            settled.push(Settled {
                id: plan.id(),
                old_address: plan.before.bound_address,
                new_address: plan.new_address,
                result: Ok(healthy),
            });
        }

        Ok(settled)
    }

    async fn run_graceful(
        &self,
        plans: Vec<Plan>,
        drain: Duration,
        rotation_id: Uuid,
    ) -> Result<Vec<Settled>> {
        if plans.is_empty() {
            return Ok(Vec::new());
        }

        let new_groups = group_by_interface(plans.iter().map(Plan::new_binding));
        if let Err(e) = self.apply(GatewayOp::Reserve, &new_groups).await {
            self.abandon(&plans);
            return Err(e);
        }

        let mut settled = Vec::with_capacity(plans.len());
        let mut replacements = Vec::with_capacity(plans.len());
        let mut failed = Vec::new();
        for plan in plans {
            let mut spec = plan.before.spec();
            spec.bound_address = plan.new_address;
            match self.pool.supervisor.start(&spec).await {
                Ok(engine) => replacements.push((plan, engine)),
                Err(e) => {
                    warn!(instance_id = plan.id(), error = %e, "Failed to start replacement engine");
                    settled.push(Settled {
                        id: plan.id(),
                        old_address: plan.before.bound_address,
                        new_address: plan.new_address,
                        result: Err(e),
                    });
                    failed.push(plan);
                }
            }
        }

        if !failed.is_empty() {
            let groups = group_by_interface(failed.iter().map(Plan::new_binding));
            self.undo(GatewayOp::Reserve, &groups).await;
            self.abandon(&failed);
        }
        if replacements.is_empty() {
            return Ok(settled);
        }

        for (plan, _) in &replacements {
            plan.slot.update(|instance| {
                if instance.engine_handle.is_some() {
                    instance.lifecycle_state = LifecycleState::Draining;
                }
            });
        }
        debug!(count = replacements.len(), drain_ms = drain.as_millis() as u64, "Draining original engines");
        tokio::time::sleep(drain).await;

        join_all(
            replacements
                .iter()
                .map(|(plan, _)| self.pool.retire(&plan.slot, None)),
        )
        .await;

        let mut promoted = Vec::with_capacity(replacements.len());
        for (plan, engine) in replacements {
            plan.slot.update(|instance| instance.rebind(plan.new_address));
            self.pool.attach(&plan.slot, engine);
            self.emit(rotation_id, plan.id(), plan.new_address);
            promoted.push(plan);
        }

        self.release_later(group_by_interface(promoted.iter().map(Plan::old_binding)));

        let remaining = self.pool.startup_delay.saturating_sub(drain);
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
        let ids: Vec<i64> = promoted.iter().map(Plan::id).collect();
        let health = self.pool.health.verify_many(&ids).await;
        for (plan, (_, healthy)) in promoted.iter().zip(health) {
            settled.push(Settled {
                id: plan.id(),
                old_address: plan.before.bound_address,
                new_address: plan.new_address,
                result: Ok(healthy),
            });
        }

        Ok(settled)
    }

    /// Release drained addresses after the safety delay, off the caller's path
    fn release_later(&self, groups: Groups) {
        let pool = self.pool.clone();
        let delay = self.release_safety_delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for (interface, bindings) in groups {
                if let Err(e) = pool.gateway.release(&interface, &bindings).await {
                    warn!(interface = %interface, error = %e, "Deferred address release failed");
                }
                let addresses: Vec<Ipv6Addr> = bindings.iter().map(|b| b.address).collect();
                pool.addresses.release_many(&addresses);
                debug!(interface = %interface, count = addresses.len(), "Drained addresses released");
            }
        });

        let mut pending = self.pending_releases.lock();
        pending.retain(|task| !task.is_finished());
        pending.push(handle);
    }
}

impl Drop for RotationOrchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}
