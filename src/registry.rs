//! Resource registry.
//!
//! The registry is the authoritative index of VMs (with their snapshots),
//! storage pools (with their volumes) and images. It provides:
//!
//! - per-VM in-flight markers: at most one mutating operation per VM
//! - per-pool operation locks: at most one capacity-affecting operation per pool
//! - compare-and-swap commits after a driver call
//! - change notification over a broadcast channel
//! - optional write-through to the redb database
//!
//! Record locks are only held for bookkeeping, never across a driver call.
//! Lock order: VM in-flight marker, then pool operation lock, then record locks.

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::VmdeckDb;
use crate::error::{Error, Result};
use crate::image::{Image, ImageStatus};
use crate::snapshot::Snapshot;
use crate::storage::{PoolRecord, Volume};
use crate::vm::{LifecycleAction, VirtualMachine, VmId, VmMetrics, VmState};

/// Capacity of the change-event channel. Slow subscribers lag and skip.
const EVENT_CAPACITY: usize = 256;

/// A mutating operation that can be in flight on a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Reboot,
    Pause,
    Resume,
    Delete,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
    AttachDisk,
    DetachDisk,
    AttachNetwork,
    DetachNetwork,
}

impl Operation {
    /// Get the operation name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Reboot => "reboot",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
            Operation::Delete => "delete",
            Operation::SnapshotCreate => "snapshot create",
            Operation::SnapshotRevert => "snapshot revert",
            Operation::SnapshotDelete => "snapshot delete",
            Operation::AttachDisk => "attach disk",
            Operation::DetachDisk => "detach disk",
            Operation::AttachNetwork => "attach network",
            Operation::DetachNetwork => "detach network",
        }
    }
}

impl From<LifecycleAction> for Operation {
    fn from(action: LifecycleAction) -> Self {
        match action {
            LifecycleAction::Start => Operation::Start,
            LifecycleAction::Stop => Operation::Stop,
            LifecycleAction::Reboot => Operation::Reboot,
            LifecycleAction::Pause => Operation::Pause,
            LifecycleAction::Resume => Operation::Resume,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted form of a VM: the VM plus the snapshots it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    /// The VM itself.
    pub vm: VirtualMachine,
    /// Snapshots, oldest first.
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

/// Change notification published after every commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RegistryEvent {
    /// A VM was created or changed.
    VmUpdated {
        id: VmId,
        name: String,
        state: VmState,
    },
    /// A VM was deleted.
    VmRemoved { id: VmId, name: String },
    /// The snapshot list of a VM changed.
    SnapshotsChanged { id: VmId, count: usize },
    /// A pool was created or its volume set changed.
    PoolUpdated {
        name: String,
        allocation_b: u64,
        capacity_b: u64,
    },
    /// A pool was deleted.
    PoolRemoved { name: String },
    /// An image was registered or its status changed.
    ImageUpdated { id: Uuid, status: ImageStatus },
    /// An image was deleted.
    ImageRemoved { id: Uuid },
}

impl RegistryEvent {
    /// Event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            RegistryEvent::VmUpdated { .. } => "vmUpdated",
            RegistryEvent::VmRemoved { .. } => "vmRemoved",
            RegistryEvent::SnapshotsChanged { .. } => "snapshotsChanged",
            RegistryEvent::PoolUpdated { .. } => "poolUpdated",
            RegistryEvent::PoolRemoved { .. } => "poolRemoved",
            RegistryEvent::ImageUpdated { .. } => "imageUpdated",
            RegistryEvent::ImageRemoved { .. } => "imageRemoved",
        }
    }
}

// ============================================================================
// VM slots
// ============================================================================

/// Registry entry for one VM.
pub struct VmSlot {
    id: VmId,
    record: RwLock<VmRecord>,
    in_flight: Mutex<Option<Operation>>,
    removed: AtomicBool,
    /// Bumped on every claim and every commit.
    generation: AtomicU64,
}

impl VmSlot {
    fn new(record: VmRecord) -> Self {
        Self {
            id: record.vm.id,
            record: RwLock::new(record),
            in_flight: Mutex::new(None),
            removed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// VM identity.
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Claim the in-flight marker for `op`.
    ///
    /// Fails with a conflict naming the running operation if another one is
    /// in flight, and with not-found if the VM was deleted meanwhile.
    pub fn begin(&self, op: Operation) -> Result<InFlight<'_>> {
        let mut current = self.in_flight.lock();
        if self.removed.load(Ordering::SeqCst) {
            return Err(Error::not_found("vm", self.id.to_string()));
        }
        if let Some(running) = *current {
            return Err(Error::conflict(format!(
                "vm {} is busy: {} in progress",
                self.name(),
                running
            )));
        }
        *current = Some(op);
        self.generation.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(vm = %self.id, op = %op, "operation started");
        Ok(InFlight { slot: self, op })
    }

    /// Change counter for the slot. Two equal reads mean no operation was
    /// claimed and nothing was committed in between.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Operation currently in flight, if any.
    pub fn in_flight(&self) -> Option<Operation> {
        *self.in_flight.lock()
    }

    /// Snapshot of the current VM.
    pub fn vm(&self) -> VirtualMachine {
        self.record.read().vm.clone()
    }

    /// Current VM name.
    pub fn name(&self) -> String {
        self.record.read().vm.name.clone()
    }

    /// Current recorded state.
    pub fn state(&self) -> VmState {
        self.record.read().vm.state
    }

    /// Read the record under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&VmRecord) -> T) -> T {
        f(&self.record.read())
    }
}

/// Claim on a VM's in-flight marker, released on drop.
pub struct InFlight<'a> {
    slot: &'a VmSlot,
    op: Operation,
}

impl InFlight<'_> {
    /// The claimed operation.
    pub fn operation(&self) -> Operation {
        self.op
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.slot.in_flight.lock() = None;
        tracing::debug!(vm = %self.slot.id, op = %self.op, "operation finished");
    }
}

// ============================================================================
// Pool slots
// ============================================================================

/// Registry entry for one storage pool.
pub struct PoolSlot {
    name: String,
    record: RwLock<PoolRecord>,
    op_lock: Mutex<()>,
    removed: AtomicBool,
}

impl PoolSlot {
    fn new(record: PoolRecord) -> Self {
        Self {
            name: record.name.clone(),
            record: RwLock::new(record),
            op_lock: Mutex::new(()),
            removed: AtomicBool::new(false),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the pool's operation lock, waiting for any running
    /// capacity-affecting operation to finish.
    pub fn lock_ops(&self) -> Result<PoolOpGuard<'_>> {
        let guard = self.op_lock.lock();
        if self.removed.load(Ordering::SeqCst) {
            return Err(Error::not_found("pool", self.name.clone()));
        }
        Ok(PoolOpGuard {
            slot: self,
            _guard: guard,
        })
    }

    /// Snapshot of the current pool record.
    pub fn record(&self) -> PoolRecord {
        self.record.read().clone()
    }

    /// Read the record under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&PoolRecord) -> T) -> T {
        f(&self.record.read())
    }
}

/// Held pool operation lock.
pub struct PoolOpGuard<'a> {
    slot: &'a PoolSlot,
    _guard: MutexGuard<'a, ()>,
}

impl PoolOpGuard<'_> {
    /// Name of the locked pool.
    pub fn pool(&self) -> &str {
        &self.slot.name
    }
}

/// Name held for an entity that is being created. Released on drop.
pub struct NameReservation<'a> {
    names: &'a Mutex<HashSet<String>>,
    name: String,
}

impl NameReservation<'_> {
    /// The reserved name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.names.lock().remove(&self.name);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Authoritative index of VMs, pools and images.
pub struct Registry {
    vms: RwLock<HashMap<VmId, Arc<VmSlot>>>,
    pending_vms: Mutex<HashSet<String>>,
    pools: RwLock<BTreeMap<String, Arc<PoolSlot>>>,
    pending_pools: Mutex<HashSet<String>>,
    images: RwLock<BTreeMap<Uuid, Image>>,
    db: Option<Arc<VmdeckDb>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Create an empty registry without persistence.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            vms: RwLock::new(HashMap::new()),
            pending_vms: Mutex::new(HashSet::new()),
            pools: RwLock::new(BTreeMap::new()),
            pending_pools: Mutex::new(HashSet::new()),
            images: RwLock::new(BTreeMap::new()),
            db: None,
            events,
        }
    }

    /// Rebuild the registry from the database and write through to it.
    pub fn open(db: Arc<VmdeckDb>) -> Result<Self> {
        let mut registry = Self::in_memory();

        let vms = db.load_vms()?;
        let pools = db.load_pools()?;
        let images = db.load_images()?;
        tracing::info!(
            vms = vms.len(),
            pools = pools.len(),
            images = images.len(),
            "loaded registry from database"
        );

        {
            let mut map = registry.vms.write();
            for record in vms {
                map.insert(record.vm.id, Arc::new(VmSlot::new(record)));
            }
        }
        {
            let mut map = registry.pools.write();
            for record in pools {
                map.insert(record.name.clone(), Arc::new(PoolSlot::new(record)));
            }
        }
        {
            let mut map = registry.images.write();
            for image in images {
                map.insert(image.id, image);
            }
        }

        registry.db = Some(db);
        Ok(registry)
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn persist(&self, what: &str, write: impl FnOnce(&VmdeckDb) -> Result<()>) {
        if let Some(db) = &self.db {
            if let Err(e) = write(db) {
                tracing::warn!(entity = what, error = %e, "failed to persist registry change");
            }
        }
    }

    // ------------------------------------------------------------------
    // VMs
    // ------------------------------------------------------------------

    /// Look up a VM by UUID, falling back to its name.
    pub fn vm(&self, id_or_name: &str) -> Result<Arc<VmSlot>> {
        let vms = self.vms.read();
        if let Some(id) = VmId::parse(id_or_name) {
            if let Some(slot) = vms.get(&id) {
                return Ok(slot.clone());
            }
        }
        vms.values()
            .find(|slot| slot.read(|r| r.vm.name == id_or_name))
            .cloned()
            .ok_or_else(|| Error::not_found("vm", id_or_name))
    }

    /// All VMs, oldest first.
    pub fn list_vms(&self) -> Vec<VirtualMachine> {
        let mut vms: Vec<VirtualMachine> = self.vm_slots().iter().map(|s| s.vm()).collect();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        vms
    }

    /// All VM slots, in no particular order.
    pub fn vm_slots(&self) -> Vec<Arc<VmSlot>> {
        self.vms.read().values().cloned().collect()
    }

    /// Names of VMs with a disk backed by `volume_path`.
    pub fn volume_users(&self, volume_path: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .vm_slots()
            .iter()
            .filter_map(|slot| {
                slot.read(|r| r.vm.references_volume(volume_path).then(|| r.vm.name.clone()))
            })
            .collect();
        users.sort();
        users
    }

    /// Reserve a VM name for a create in progress.
    pub fn reserve_vm_name(&self, name: &str) -> Result<NameReservation<'_>> {
        let mut pending = self.pending_vms.lock();
        let taken = pending.contains(name)
            || self
                .vms
                .read()
                .values()
                .any(|slot| slot.read(|r| r.vm.name == name));
        if taken {
            return Err(Error::conflict(format!("vm {} already exists", name)));
        }
        pending.insert(name.to_string());
        Ok(NameReservation {
            names: &self.pending_vms,
            name: name.to_string(),
        })
    }

    /// Register a newly defined VM under its reserved name.
    pub fn insert_vm(&self, reservation: NameReservation<'_>, vm: VirtualMachine) -> Arc<VmSlot> {
        debug_assert_eq!(reservation.name(), vm.name);
        let record = VmRecord {
            vm,
            snapshots: Vec::new(),
        };
        let slot = Arc::new(VmSlot::new(record.clone()));
        self.vms.write().insert(record.vm.id, slot.clone());
        drop(reservation);

        self.persist("vm", |db| db.put_vm(&record));
        self.publish(RegistryEvent::VmUpdated {
            id: record.vm.id,
            name: record.vm.name.clone(),
            state: record.vm.state,
        });
        slot
    }

    /// Apply `f` to a copy of the VM record and commit it if `f` succeeds.
    /// On error the record is left untouched.
    pub fn update_vm<T>(
        &self,
        slot: &VmSlot,
        _claim: &InFlight<'_>,
        f: impl FnOnce(&mut VmRecord) -> Result<T>,
    ) -> Result<T> {
        self.commit_vm(slot, f)
    }

    /// Commit a state transition observed before a driver call. Fails with
    /// a conflict if the recorded state moved meanwhile.
    pub fn transition_vm(
        &self,
        slot: &VmSlot,
        claim: &InFlight<'_>,
        from: VmState,
        to: VmState,
    ) -> Result<VirtualMachine> {
        self.update_vm(slot, claim, |record| {
            if record.vm.state != from {
                return Err(Error::conflict(format!(
                    "vm {} changed state concurrently: expected {}, found {}",
                    record.vm.name, from, record.vm.state
                )));
            }
            record.vm.state = to;
            if !matches!(to, VmState::Running | VmState::Paused) {
                record.vm.metrics = VmMetrics::default();
            }
            Ok(record.vm.clone())
        })
    }

    /// Record hypervisor-observed state for a VM with no operation in flight.
    ///
    /// `generation` is the slot's [`VmSlot::generation`] read before the
    /// driver was queried. Returns `Ok(None)` without changing anything if an
    /// operation is in flight or the slot changed since that read, even if
    /// it has since returned to the same state.
    pub fn observe_vm(
        &self,
        slot: &VmSlot,
        generation: u64,
        f: impl FnOnce(&mut VmRecord),
    ) -> Result<Option<VirtualMachine>> {
        // Holding the marker mutex keeps operations from starting meanwhile.
        let in_flight = slot.in_flight.lock();
        if in_flight.is_some() || slot.removed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let result = self.commit_vm(slot, |record| {
            if slot.generation() != generation {
                return Ok(None);
            }
            f(record);
            Ok(Some(record.vm.clone()))
        });
        drop(in_flight);
        result
    }

    fn commit_vm<T>(&self, slot: &VmSlot, f: impl FnOnce(&mut VmRecord) -> Result<T>) -> Result<T> {
        let (result, before, after) = {
            let mut guard = slot.record.write();
            let mut next = guard.clone();
            let result = f(&mut next)?;
            let before = std::mem::replace(&mut *guard, next.clone());
            slot.generation.fetch_add(1, Ordering::SeqCst);
            (result, before, next)
        };

        if before == after {
            return Ok(result);
        }

        self.persist("vm", |db| db.put_vm(&after));
        if before.vm != after.vm {
            self.publish(RegistryEvent::VmUpdated {
                id: after.vm.id,
                name: after.vm.name.clone(),
                state: after.vm.state,
            });
        }
        if before.snapshots != after.snapshots {
            self.publish(RegistryEvent::SnapshotsChanged {
                id: after.vm.id,
                count: after.snapshots.len(),
            });
        }
        Ok(result)
    }

    /// Remove a VM. Later `begin` calls on the slot fail with not-found.
    pub fn remove_vm(&self, slot: &VmSlot, _claim: &InFlight<'_>) {
        slot.removed.store(true, Ordering::SeqCst);
        self.vms.write().remove(&slot.id);

        let name = slot.name();
        self.persist("vm", |db| db.delete_vm(&slot.id.to_string()));
        self.publish(RegistryEvent::VmRemoved { id: slot.id, name });
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Look up a pool by name.
    pub fn pool(&self, name: &str) -> Result<Arc<PoolSlot>> {
        self.pools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("pool", name))
    }

    /// All pool records, ordered by name.
    pub fn list_pools(&self) -> Vec<PoolRecord> {
        self.pools.read().values().map(|slot| slot.record()).collect()
    }

    /// Find the pool and volume backing `path`.
    pub fn find_volume(&self, path: &str) -> Option<(Arc<PoolSlot>, Volume)> {
        self.pools.read().values().find_map(|slot| {
            slot.read(|r| r.volumes.iter().find(|v| v.path == path).cloned())
                .map(|volume| (slot.clone(), volume))
        })
    }

    /// Reserve a pool name for a create in progress.
    pub fn reserve_pool_name(&self, name: &str) -> Result<NameReservation<'_>> {
        let mut pending = self.pending_pools.lock();
        if pending.contains(name) || self.pools.read().contains_key(name) {
            return Err(Error::conflict(format!("pool {} already exists", name)));
        }
        pending.insert(name.to_string());
        Ok(NameReservation {
            names: &self.pending_pools,
            name: name.to_string(),
        })
    }

    /// Register a newly created pool under its reserved name.
    pub fn insert_pool(&self, reservation: NameReservation<'_>, record: PoolRecord) -> Arc<PoolSlot> {
        debug_assert_eq!(reservation.name(), record.name);
        let slot = Arc::new(PoolSlot::new(record.clone()));
        self.pools.write().insert(record.name.clone(), slot.clone());
        drop(reservation);

        self.persist("pool", |db| db.put_pool(&record));
        self.publish(pool_event(&record));
        slot
    }

    /// Apply `f` to a copy of the pool record and commit it if `f` succeeds.
    pub fn update_pool<T>(
        &self,
        slot: &PoolSlot,
        _guard: &PoolOpGuard<'_>,
        f: impl FnOnce(&mut PoolRecord) -> Result<T>,
    ) -> Result<T> {
        let (result, after) = {
            let mut guard = slot.record.write();
            let mut next = guard.clone();
            let result = f(&mut next)?;
            *guard = next.clone();
            (result, next)
        };

        self.persist("pool", |db| db.put_pool(&after));
        self.publish(pool_event(&after));
        Ok(result)
    }

    /// Remove a pool. Later `lock_ops` calls on the slot fail with not-found.
    pub fn remove_pool(&self, slot: &PoolSlot, _guard: &PoolOpGuard<'_>) {
        slot.removed.store(true, Ordering::SeqCst);
        self.pools.write().remove(&slot.name);

        self.persist("pool", |db| db.delete_pool(&slot.name));
        self.publish(RegistryEvent::PoolRemoved {
            name: slot.name.clone(),
        });
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Look up an image by id.
    pub fn image(&self, id: &Uuid) -> Result<Image> {
        self.images
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("image", id.to_string()))
    }

    /// All images, oldest first.
    pub fn list_images(&self) -> Vec<Image> {
        let mut images: Vec<Image> = self.images.read().values().cloned().collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        images
    }

    /// Register an image. Names are unique.
    pub fn insert_image(&self, image: Image) -> Result<Image> {
        {
            let mut images = self.images.write();
            if images.values().any(|i| i.name == image.name) {
                return Err(Error::conflict(format!("image {} already exists", image.name)));
            }
            images.insert(image.id, image.clone());
        }
        self.persist("image", |db| db.put_image(&image));
        self.publish(RegistryEvent::ImageUpdated {
            id: image.id,
            status: image.status,
        });
        Ok(image)
    }

    /// Apply `f` to an image and commit the result.
    pub fn update_image(&self, id: &Uuid, f: impl FnOnce(&mut Image)) -> Result<Image> {
        let image = {
            let mut images = self.images.write();
            let image = images
                .get_mut(id)
                .ok_or_else(|| Error::not_found("image", id.to_string()))?;
            f(image);
            image.clone()
        };
        self.persist("image", |db| db.put_image(&image));
        self.publish(RegistryEvent::ImageUpdated {
            id: image.id,
            status: image.status,
        });
        Ok(image)
    }

    /// Remove an image.
    pub fn remove_image(&self, id: &Uuid) -> Result<Image> {
        let image = self
            .images
            .write()
            .remove(id)
            .ok_or_else(|| Error::not_found("image", id.to_string()))?;
        self.persist("image", |db| db.delete_image(&id.to_string()));
        self.publish(RegistryEvent::ImageRemoved { id: *id });
        Ok(image)
    }
}

fn pool_event(record: &PoolRecord) -> RegistryEvent {
    RegistryEvent::PoolUpdated {
        name: record.name.clone(),
        allocation_b: record.allocation_b(),
        capacity_b: record.capacity_b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::image::ImageKind;
    use crate::storage::PoolState;
    use crate::vm::VmSpec;

    fn registry_with_vm(name: &str) -> (Registry, Arc<VmSlot>) {
        let registry = Registry::in_memory();
        let reservation = registry.reserve_vm_name(name).unwrap();
        let slot = registry.insert_vm(reservation, VirtualMachine::from_spec(&VmSpec::builder(name).build()));
        (registry, slot)
    }

    fn pool_record(name: &str) -> PoolRecord {
        PoolRecord {
            name: name.into(),
            state: PoolState::Active,
            path: format!("/pools/{}", name),
            capacity_b: 100,
            volumes: Vec::new(),
        }
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let (registry, slot) = registry_with_vm("vm-1");
        assert_eq!(registry.vm(&slot.id().to_string()).unwrap().id(), slot.id());
        assert_eq!(registry.vm("vm-1").unwrap().id(), slot.id());
        assert_eq!(registry.vm("vm-2").err().unwrap().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_duplicate_vm_name_conflicts() {
        let (registry, _slot) = registry_with_vm("vm-1");
        let err = registry.reserve_vm_name("vm-1").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let held = registry.reserve_vm_name("vm-2").unwrap();
        assert!(registry.reserve_vm_name("vm-2").is_err(), "pending name is taken");
        drop(held);
        assert!(registry.reserve_vm_name("vm-2").is_ok());
    }

    #[test]
    fn test_in_flight_marker_is_exclusive() {
        let (_registry, slot) = registry_with_vm("vm-1");
        let claim = slot.begin(Operation::Start).unwrap();
        assert_eq!(slot.in_flight(), Some(Operation::Start));

        let err = slot.begin(Operation::Stop).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("start in progress"));

        // Readers never wait on the marker.
        assert_eq!(slot.state(), VmState::ShutOff);

        drop(claim);
        assert_eq!(slot.in_flight(), None);
        assert!(slot.begin(Operation::Stop).is_ok());
    }

    #[test]
    fn test_transition_is_compare_and_swap() {
        let (registry, slot) = registry_with_vm("vm-1");
        let claim = slot.begin(Operation::Start).unwrap();

        let vm = registry
            .transition_vm(&slot, &claim, VmState::ShutOff, VmState::Running)
            .unwrap();
        assert_eq!(vm.state, VmState::Running);

        let err = registry
            .transition_vm(&slot, &claim, VmState::ShutOff, VmState::Running)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(slot.state(), VmState::Running);
    }

    #[test]
    fn test_failed_update_leaves_record_untouched() {
        let (registry, slot) = registry_with_vm("vm-1");
        let claim = slot.begin(Operation::AttachDisk).unwrap();
        let result: Result<()> = registry.update_vm(&slot, &claim, |record| {
            record.vm.state = VmState::Crashed;
            Err(Error::validation("nope"))
        });
        assert!(result.is_err());
        assert_eq!(slot.state(), VmState::ShutOff);
    }

    #[test]
    fn test_observe_skips_busy_vm() {
        let (registry, slot) = registry_with_vm("vm-1");
        let claim = slot.begin(Operation::Start).unwrap();
        let observed = registry
            .observe_vm(&slot, slot.generation(), |r| r.vm.state = VmState::Crashed)
            .unwrap();
        assert!(observed.is_none());
        drop(claim);

        let observed = registry
            .observe_vm(&slot, slot.generation(), |r| r.vm.state = VmState::Crashed)
            .unwrap();
        assert_eq!(observed.unwrap().state, VmState::Crashed);
    }

    #[test]
    fn test_observe_rejects_round_trip_through_same_state() {
        let (registry, slot) = registry_with_vm("vm-1");
        let generation = slot.generation();

        for (from, to) in [
            (VmState::ShutOff, VmState::Running),
            (VmState::Running, VmState::ShutOff),
        ] {
            let claim = slot.begin(Operation::Start).unwrap();
            registry.transition_vm(&slot, &claim, from, to).unwrap();
        }
        assert_eq!(slot.state(), VmState::ShutOff);

        let observed = registry
            .observe_vm(&slot, generation, |r| r.vm.state = VmState::Running)
            .unwrap();
        assert!(observed.is_none());
        assert_eq!(slot.state(), VmState::ShutOff);
    }

    #[test]
    fn test_removed_vm_rejects_new_operations() {
        let (registry, slot) = registry_with_vm("vm-1");
        {
            let claim = slot.begin(Operation::Delete).unwrap();
            registry.remove_vm(&slot, &claim);
        }
        assert_eq!(slot.begin(Operation::Start).err().unwrap().kind(), ErrorKind::NotFound);
        assert!(registry.list_vms().is_empty());
        assert!(registry.reserve_vm_name("vm-1").is_ok());
    }

    #[tokio::test]
    async fn test_commits_publish_events() {
        let (registry, slot) = registry_with_vm("vm-1");
        let mut events = registry.subscribe();

        let claim = slot.begin(Operation::Start).unwrap();
        registry
            .transition_vm(&slot, &claim, VmState::ShutOff, VmState::Running)
            .unwrap();

        match events.recv().await.unwrap() {
            RegistryEvent::VmUpdated { name, state, .. } => {
                assert_eq!(name, "vm-1");
                assert_eq!(state, VmState::Running);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = RegistryEvent::PoolUpdated {
            name: "default".into(),
            allocation_b: 1,
            capacity_b: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "poolUpdated");
        assert_eq!(json["allocationB"], 1);
    }

    #[test]
    fn test_pool_lock_and_volume_lookup() {
        let registry = Registry::in_memory();
        let reservation = registry.reserve_pool_name("default").unwrap();
        let slot = registry.insert_pool(reservation, pool_record("default"));

        let guard = slot.lock_ops().unwrap();
        registry
            .update_pool(&slot, &guard, |record| {
                record.volumes.push(Volume {
                    name: "v1".into(),
                    pool: "default".into(),
                    capacity_b: 10,
                    path: "/pools/default/v1".into(),
                });
                Ok(())
            })
            .unwrap();
        drop(guard);

        let (found, volume) = registry.find_volume("/pools/default/v1").unwrap();
        assert_eq!(found.name(), "default");
        assert_eq!(volume.name, "v1");
        assert!(registry.find_volume("/pools/default/v2").is_none());
        assert_eq!(registry.reserve_pool_name("default").err().unwrap().kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_images_are_unique_by_name() {
        let registry = Registry::in_memory();
        let image = registry
            .insert_image(Image::new("alpine", ImageKind::Iso, ImageStatus::Available, 1, None))
            .unwrap();
        let err = registry
            .insert_image(Image::new("alpine", ImageKind::Template, ImageStatus::Available, 1, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        registry.remove_image(&image.id).unwrap();
        assert!(registry.list_images().is_empty());
    }

    #[test]
    fn test_registry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmdeck.redb");

        let id = {
            let db = Arc::new(VmdeckDb::open(&path).unwrap());
            let registry = Registry::open(db).unwrap();
            let reservation = registry.reserve_vm_name("vm-1").unwrap();
            let slot = registry.insert_vm(reservation, VirtualMachine::from_spec(&VmSpec::builder("vm-1").build()));
            let claim = slot.begin(Operation::Start).unwrap();
            registry
                .transition_vm(&slot, &claim, VmState::ShutOff, VmState::Running)
                .unwrap();
            let reservation = registry.reserve_pool_name("default").unwrap();
            registry.insert_pool(reservation, pool_record("default"));
            slot.id()
        };

        let db = Arc::new(VmdeckDb::open(&path).unwrap());
        let registry = Registry::open(db).unwrap();
        let slot = registry.vm("vm-1").unwrap();
        assert_eq!(slot.id(), id);
        assert_eq!(slot.state(), VmState::Running);
        assert!(registry.pool("default").is_ok());
    }
}
