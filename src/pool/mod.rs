//! Proxy pool core: addresses, engines, health and rotation

pub mod allocator;
pub mod engine;
pub mod gateway;
pub mod health;
pub mod interfaces;
pub mod lifecycle;
pub mod registry;
pub mod rotation;
pub mod supervisor;

#[cfg(test)]
pub mod testing;

pub use allocator::{AddressAllocator, AddressPool};
pub use engine::{EngineConfigWriter, EngineLauncher, ProcessLauncher};
pub use gateway::{CommandGateway, NetworkGateway, SharedGateway};
pub use health::{EgressProbe, HealthChecker, HttpEchoProbe};
pub use interfaces::{InterfaceQuery, SharedInterfaces, SystemInterfaces};
pub use lifecycle::{PoolSettings, ProxyPool};
pub use registry::ProxyPoolRegistry;
pub use rotation::RotationOrchestrator;
pub use supervisor::ProcessSupervisor;
