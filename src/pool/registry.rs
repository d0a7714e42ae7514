//! In-memory source of truth for proxy instances
//!
//! Each instance lives in its own slot with two locks:
//! - `state` is a short synchronous lock for atomic read-modify-write of the record.
//! - `op` is held across a whole lifecycle or rotation operation on that id, so
//!   operations on one id queue behind each other while other ids run freely.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Result, SnapError};
use crate::models::ProxyInstance;

pub struct InstanceSlot {
    id: i64,
    state: RwLock<ProxyInstance>,
    op: Arc<AsyncMutex<()>>,
}

impl InstanceSlot {
    fn new(instance: ProxyInstance) -> Self {
        Self {
            id: instance.id,
            state: RwLock::new(instance),
            op: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn snapshot(&self) -> ProxyInstance {
        self.state.read().clone()
    }

    /// Read a single field without cloning the record
    pub fn read<R>(&self, f: impl FnOnce(&ProxyInstance) -> R) -> R {
        f(&self.state.read())
    }

    /// Atomic read-modify-write of the record
    pub fn update<R>(&self, f: impl FnOnce(&mut ProxyInstance) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Wait for exclusive use of this instance
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.op.clone().lock_owned().await
    }
}

/// A slot together with its held operation lock
pub struct LockedSlot {
    pub slot: Arc<InstanceSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl std::ops::Deref for LockedSlot {
    type Target = InstanceSlot;

    fn deref(&self) -> &Self::Target {
        &self.slot
    }
}

#[derive(Default)]
pub struct ProxyPoolRegistry {
    slots: DashMap<i64, Arc<InstanceSlot>>,
    /// Serializes admission so the port check and the insert are one step
    admission: Mutex<()>,
}

impl ProxyPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new instance, handing it back with its operation lock held.
    ///
    /// Fails without touching the registry if the id is taken or another
    /// registered instance owns the port. A registered instance keeps its port
    /// while stopped, so admission never races with a start in flight. The slot
    /// is locked before it becomes visible, so no other operation on the id can
    /// run until the caller finishes admitting it.
    pub fn insert(&self, instance: ProxyInstance) -> Result<LockedSlot> {
        let _admission = self.admission.lock();

        if self.slots.contains_key(&instance.id) {
            return Err(SnapError::DuplicateInstance { id: instance.id });
        }
        if let Some(owner) = self.port_owner(instance.listen_port) {
            return Err(SnapError::PortInUse {
                port: instance.listen_port,
                owner,
            });
        }

        let slot = Arc::new(InstanceSlot::new(instance));
        let guard = slot
            .op
            .clone()
            .try_lock_owned()
            .map_err(|_| SnapError::Internal(format!("new slot {} is already locked", slot.id)))?;
        self.slots.insert(slot.id, slot.clone());
        debug!(instance_id = slot.id, "Instance registered");
        Ok(LockedSlot {
            slot,
            _guard: guard,
        })
    }

    /// Id of the registered instance listening on `port`
    pub fn port_owner(&self, port: u16) -> Option<i64> {
        self.slots.iter().find_map(|entry| {
            entry
                .value()
                .read(|instance| (instance.listen_port == port).then_some(instance.id))
        })
    }

    pub fn get(&self, id: i64) -> Result<Arc<InstanceSlot>> {
        self.slots
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(SnapError::InstanceNotFound { id })
    }

    pub fn contains(&self, id: i64) -> bool {
        self.slots.contains_key(&id)
    }

    /// Take the operation lock of `id`.
    ///
    /// Fails with `InstanceNotFound` if the instance was removed while waiting.
    pub async fn lock(&self, id: i64) -> Result<LockedSlot> {
        let slot = self.get(id)?;
        let guard = slot.lock().await;

        match self.slots.get(&id) {
            Some(current) if Arc::ptr_eq(current.value(), &slot) => Ok(LockedSlot {
                slot,
                _guard: guard,
            }),
            _ => Err(SnapError::InstanceNotFound { id }),
        }
    }

    pub fn snapshot(&self, id: i64) -> Result<ProxyInstance> {
        Ok(self.get(id)?.snapshot())
    }

    /// All instances, ordered by id
    pub fn list(&self) -> Vec<ProxyInstance> {
        let mut instances: Vec<_> = self
            .slots
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        instances.sort_by_key(|instance| instance.id);
        instances
    }

    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<_> = self.slots.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Remove `slot` if it is still the registered one for its id
    pub fn remove_slot(&self, slot: &Arc<InstanceSlot>) -> bool {
        self.slots
            .remove_if(&slot.id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
