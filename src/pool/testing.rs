//! In-memory collaborators for pool tests

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::engine::{EngineEvent, EngineLauncher, SpawnedEngine, StopRequest};
use super::gateway::{GatewayOp, NetworkGateway};
use super::health::EgressProbe;
use super::interfaces::InterfaceQuery;
use super::lifecycle::{PoolSettings, ProxyPool};
use crate::error::{Result, SnapError};
use crate::models::{AddressBinding, InstanceSpec, InterfaceAddress, ProxyInstance, ProxyKind};

/// One recorded gateway batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub op: GatewayOp,
    pub interface: String,
    pub addresses: Vec<Ipv6Addr>,
}

/// Gateway that keeps interface state in memory
#[derive(Default)]
pub struct FakeGateway {
    calls: Mutex<Vec<GatewayCall>>,
    on_interface: Mutex<HashSet<Ipv6Addr>>,
    fail_reserve: AtomicBool,
    fail_release: AtomicBool,
    authorizations: AtomicU64,
    authorize_delay: Mutex<Duration>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, op: GatewayOp) -> Vec<GatewayCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn is_on_interface(&self, address: &Ipv6Addr) -> bool {
        self.on_interface.lock().contains(address)
    }

    /// Make every authorization take `delay`
    pub fn delay_authorize(&self, delay: Duration) {
        *self.authorize_delay.lock() = delay;
    }

    pub fn authorizations(&self) -> u64 {
        self.authorizations.load(Ordering::SeqCst)
    }

    fn record(&self, op: GatewayOp, interface: &str, bindings: &[AddressBinding]) {
        self.calls.lock().push(GatewayCall {
            op,
            interface: interface.to_string(),
            addresses: bindings.iter().map(|b| b.address).collect(),
        });
    }
}

#[async_trait]
impl NetworkGateway for FakeGateway {
    async fn reserve(&self, interface: &str, bindings: &[AddressBinding]) -> Result<()> {
        self.record(GatewayOp::Reserve, interface, bindings);
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(SnapError::PrivilegedOperationFailure("authorization denied".into()));
        }
        self.on_interface
            .lock()
            .extend(bindings.iter().map(|b| b.address));
        Ok(())
    }

    async fn release(&self, interface: &str, bindings: &[AddressBinding]) -> Result<()> {
        self.record(GatewayOp::Release, interface, bindings);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(SnapError::PrivilegedOperationFailure("authorization denied".into()));
        }
        let mut on_interface = self.on_interface.lock();
        for binding in bindings {
            on_interface.remove(&binding.address);
        }
        Ok(())
    }

    async fn authorize(&self) -> Result<()> {
        self.authorizations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.authorize_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

struct FakeProcess {
    instance_id: i64,
    address: Option<Ipv6Addr>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

#[derive(Default)]
struct LauncherState {
    next: u64,
    running: HashMap<u64, FakeProcess>,
    launches: Vec<(i64, Option<Ipv6Addr>)>,
}

/// Launcher that simulates engine processes without spawning anything
#[derive(Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
    fail_all: AtomicBool,
    fail_ids: Mutex<HashSet<i64>>,
}

fn external_address(config_path: &Path) -> Option<Ipv6Addr> {
    let config = std::fs::read_to_string(config_path).ok()?;
    config
        .lines()
        .find_map(|line| line.strip_prefix("external "))
        .and_then(|addr| addr.trim().parse().ok())
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_instance(&self, id: i64) {
        self.fail_ids.lock().insert(id);
    }

    /// Number of live processes for an instance
    pub fn running_on(&self, instance_id: i64) -> usize {
        self.state
            .lock()
            .running
            .values()
            .filter(|p| p.instance_id == instance_id)
            .count()
    }

    /// Outbound addresses of the live processes of an instance
    pub fn running_addresses(&self, instance_id: i64) -> Vec<Ipv6Addr> {
        let mut addresses: Vec<_> = self
            .state
            .lock()
            .running
            .values()
            .filter(|p| p.instance_id == instance_id)
            .filter_map(|p| p.address)
            .collect();
        addresses.sort();
        addresses
    }

    pub fn total_running(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Instance ids in launch order
    pub fn launch_order(&self) -> Vec<i64> {
        self.state.lock().launches.iter().map(|(id, _)| *id).collect()
    }

    /// Make every process of an instance exit with status 1
    pub fn crash(&self, instance_id: i64) {
        self.state.lock().running.retain(|_, p| {
            if p.instance_id == instance_id {
                let _ = p.events.send(EngineEvent::Exited(Some(1)));
                false
            } else {
                true
            }
        });
    }

    /// Emit an error event from every process of an instance
    pub fn emit_error(&self, instance_id: i64, message: &str) {
        for process in self.state.lock().running.values() {
            if process.instance_id == instance_id {
                let _ = process.events.send(EngineEvent::Error(message.to_string()));
            }
        }
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self, instance_id: i64, config_path: &Path) -> std::io::Result<SpawnedEngine> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_ids.lock().contains(&instance_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "engine binary not found",
            ));
        }

        let address = external_address(config_path);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<StopRequest>();

        let key = {
            let mut state = self.state.lock();
            let key = state.next;
            state.next += 1;
            state.running.insert(
                key,
                FakeProcess {
                    instance_id,
                    address,
                    events: event_tx,
                },
            );
            state.launches.push((instance_id, address));
            key
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            if let Ok(request) = stop_rx.await {
                state.lock().running.remove(&key);
                let _ = request.done.send(());
            }
        });

        Ok(SpawnedEngine {
            pid: Some(40000 + key as u32),
            events: event_rx,
            stop: stop_tx,
        })
    }
}

/// Behaviour of a [`FakeProbe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Report the instance's bound address
    Echo,
    /// Report a fixed address
    Fixed(Ipv6Addr),
    /// Fail every request
    Fail,
    /// Fail the first n requests, then echo
    FailTimes(u32),
}

pub struct FakeProbe {
    mode: Mutex<ProbeMode>,
    failing_ports: Mutex<HashSet<u16>>,
    calls: Mutex<Vec<Instant>>,
}

impl FakeProbe {
    pub fn new(mode: ProbeMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            failing_ports: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: ProbeMode) {
        *self.mode.lock() = mode;
    }

    pub fn fail_port(&self, port: u16) {
        self.failing_ports.lock().insert(port);
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl EgressProbe for FakeProbe {
    async fn egress_address(&self, instance: &ProxyInstance) -> anyhow::Result<IpAddr> {
        self.calls.lock().push(Instant::now());

        if self.failing_ports.lock().contains(&instance.listen_port) {
            anyhow::bail!("connection refused");
        }

        let mut mode = self.mode.lock();
        match *mode {
            ProbeMode::Echo => Ok(IpAddr::V6(instance.bound_address)),
            ProbeMode::Fixed(address) => Ok(IpAddr::V6(address)),
            ProbeMode::Fail => anyhow::bail!("connection refused"),
            ProbeMode::FailTimes(0) => {
                *mode = ProbeMode::Echo;
                Ok(IpAddr::V6(instance.bound_address))
            }
            ProbeMode::FailTimes(n) => {
                *mode = ProbeMode::FailTimes(n - 1);
                anyhow::bail!("connection refused")
            }
        }
    }
}

/// Interface query over a fixed address list
#[derive(Default)]
pub struct FakeInterfaces {
    addresses: Mutex<Vec<InterfaceAddress>>,
    lan: Option<Ipv4Addr>,
    offline: AtomicBool,
}

impl FakeInterfaces {
    pub fn new(lan: Option<Ipv4Addr>) -> Self {
        Self {
            addresses: Mutex::new(Vec::new()),
            lan,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn add(&self, interface: &str, address: Ipv6Addr, prefix_length: u8) {
        self.addresses.lock().push(InterfaceAddress {
            interface_name: interface.to_string(),
            address: IpAddr::V6(address),
            prefix_length,
        });
    }
}

#[async_trait]
impl InterfaceQuery for FakeInterfaces {
    fn global_addresses(&self) -> Result<Vec<InterfaceAddress>> {
        Ok(self.addresses.lock().clone())
    }

    fn lan_address(&self) -> Option<Ipv4Addr> {
        self.lan
    }

    /// Online unless told otherwise; a source must be one of the listed addresses
    async fn test_connectivity(&self, source: Option<Ipv6Addr>) -> bool {
        if self.offline.load(Ordering::SeqCst) {
            return false;
        }
        source.map_or(true, |source| {
            self.addresses
                .lock()
                .iter()
                .any(|entry| entry.address == IpAddr::V6(source))
        })
    }
}

/// Small pause that lets spawned dispatch tasks observe engine events
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// A pool wired to fakes, with the fakes kept for assertions
pub struct Harness {
    pub pool: Arc<ProxyPool>,
    pub gateway: Arc<FakeGateway>,
    pub launcher: Arc<FakeLauncher>,
    pub probe: Arc<FakeProbe>,
    pub interfaces: Arc<FakeInterfaces>,
    _dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(FakeGateway::new());
    let launcher = Arc::new(FakeLauncher::new());
    let probe = Arc::new(FakeProbe::new(ProbeMode::Echo));
    let interfaces = Arc::new(FakeInterfaces::new(Some(Ipv4Addr::new(192, 168, 1, 20))));

    let pool = Arc::new(ProxyPool::new(
        PoolSettings {
            config_dir: dir.path().to_path_buf(),
            dns_server: "8.8.8.8".into(),
            kill_grace: Duration::from_millis(100),
            startup_delay: Duration::from_millis(2000),
            health_attempts: 3,
            health_delay: Duration::from_millis(2000),
        },
        gateway.clone(),
        launcher.clone(),
        probe.clone(),
        interfaces.clone(),
    ));

    Harness {
        pool,
        gateway,
        launcher,
        probe,
        interfaces,
        _dir: dir,
    }
}

/// Instance `id` listening on `10000 + id`, bound to `2001:db8::a<id>`
pub fn spec(id: i64) -> InstanceSpec {
    InstanceSpec {
        id,
        kind: ProxyKind::Http,
        listen_port: 10000 + id as u16,
        bound_address: format!("2001:db8::{:x}", 0xa00 + id).parse().unwrap(),
        interface_name: "eth0".into(),
        prefix_length: 64,
        credentials: None,
    }
}
