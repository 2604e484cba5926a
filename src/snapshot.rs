//! VM snapshots.
//!
//! A snapshot captures the VM's resources and device configuration at the
//! time it was taken. Snapshots are only taken of and reverted on shut-off
//! VMs; deleting one works in any state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::driver::{Driver, DriverOp};
use crate::error::{Error, Result};
use crate::registry::{Operation, PoolSlot, Registry};
use crate::util::validate_name;
use crate::vm::{DiskDevice, NetworkInterface, Resources, VirtualMachine, VmId, VmState};

/// A point-in-time capture of a VM's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Name, unique within the VM.
    pub name: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Owning VM.
    pub vm_id: VmId,
    /// Captured resources.
    pub resources: Resources,
    /// Captured disks.
    #[serde(default)]
    pub disks: Vec<DiskDevice>,
    /// Captured network interfaces.
    #[serde(default)]
    pub nics: Vec<NetworkInterface>,
}

impl Snapshot {
    /// Capture the current configuration of `vm`.
    pub fn capture(vm: &VirtualMachine, name: &str, description: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            description,
            created_at: Utc::now(),
            vm_id: vm.id,
            resources: vm.resources.clone(),
            disks: vm.disks.clone(),
            nics: vm.nics.clone(),
        }
    }
}

/// Creates, lists, reverts and deletes VM snapshots.
pub struct SnapshotManager {
    registry: Arc<Registry>,
    driver: Arc<dyn Driver>,
}

impl SnapshotManager {
    /// Create a snapshot manager.
    pub fn new(registry: Arc<Registry>, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    /// Snapshot a shut-off VM.
    pub fn create(&self, vm: &str, name: &str, description: Option<String>) -> Result<Snapshot> {
        validate_name("snapshot", name)?;
        let description = description.filter(|d| !d.trim().is_empty());

        let slot = self.registry.vm(vm)?;
        let claim = slot.begin(Operation::SnapshotCreate)?;

        let (current, exists) = slot.read(|r| (r.vm.clone(), r.snapshots.iter().any(|s| s.name == name)));
        require_shut_off(&current)?;
        if exists {
            return Err(Error::conflict(format!(
                "snapshot {} already exists for vm {}",
                name, current.name
            )));
        }

        self.driver
            .snapshot_create(&current.id, name, description.as_deref().unwrap_or(""))
            .map_err(|e| DriverOp::SnapshotCreate.fail(e))?;

        let snapshot = Snapshot::capture(&current, name, description);
        self.registry.update_vm(&slot, &claim, |record| {
            record.snapshots.push(snapshot.clone());
            Ok(())
        })?;
        tracing::info!(vm = %current.id, snapshot = %name, "snapshot created");
        Ok(snapshot)
    }

    /// Snapshots of a VM, oldest first.
    pub fn list(&self, vm: &str) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.registry.vm(vm)?.read(|r| r.snapshots.clone());
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    /// Delete a snapshot. The VM may be in any state.
    pub fn delete(&self, vm: &str, name: &str) -> Result<()> {
        let slot = self.registry.vm(vm)?;
        let claim = slot.begin(Operation::SnapshotDelete)?;
        let vm_id = slot.id();

        if !slot.read(|r| r.snapshots.iter().any(|s| s.name == name)) {
            return Err(Error::not_found("snapshot", name));
        }

        self.driver
            .snapshot_delete(&vm_id, name)
            .map_err(|e| DriverOp::SnapshotDelete.fail(e))?;
        self.registry.update_vm(&slot, &claim, |record| {
            record.snapshots.retain(|s| s.name != name);
            Ok(())
        })?;
        tracing::info!(vm = %vm_id, snapshot = %name, "snapshot deleted");
        Ok(())
    }

    /// Revert a shut-off VM to a snapshot, replacing its resources and
    /// devices with the captured ones. The VM stays shut off.
    pub fn revert(&self, vm: &str, name: &str) -> Result<VirtualMachine> {
        let slot = self.registry.vm(vm)?;
        let claim = slot.begin(Operation::SnapshotRevert)?;

        let (current, snapshot) =
            slot.read(|r| (r.vm.clone(), r.snapshots.iter().find(|s| s.name == name).cloned()));
        require_shut_off(&current)?;
        let snapshot = snapshot.ok_or_else(|| Error::not_found("snapshot", name))?;

        // Hold every pool that backs a captured disk so none of the volumes
        // can be deleted before the revert is recorded.
        let pools = self.pools_for(&snapshot)?;
        let guards = pools
            .iter()
            .map(|p| p.lock_ops())
            .collect::<Result<Vec<_>>>()?;
        for disk in &snapshot.disks {
            let present = pools.iter().any(|p| {
                p.read(|r| r.volumes.iter().any(|v| v.path == disk.volume_path))
            });
            if !present {
                return Err(missing_volume(&snapshot, disk));
            }
        }

        self.driver
            .snapshot_revert(&current.id, name)
            .map_err(|e| DriverOp::SnapshotRevert.fail(e))?;

        let vm = self.registry.update_vm(&slot, &claim, |record| {
            if record.vm.state != VmState::ShutOff {
                return Err(Error::conflict(format!(
                    "vm {} changed state concurrently",
                    record.vm.name
                )));
            }
            record.vm.resources = snapshot.resources.clone();
            record.vm.disks = snapshot.disks.clone();
            record.vm.nics = snapshot.nics.clone();
            Ok(record.vm.clone())
        })?;
        drop(guards);

        tracing::info!(vm = %vm.id, snapshot = %name, "vm reverted to snapshot");
        Ok(vm)
    }

    /// Pools owning the snapshot's disks, sorted by name for lock ordering.
    fn pools_for(&self, snapshot: &Snapshot) -> Result<Vec<Arc<PoolSlot>>> {
        let mut pools: Vec<Arc<PoolSlot>> = Vec::new();
        for disk in &snapshot.disks {
            let (pool, _) = self
                .registry
                .find_volume(&disk.volume_path)
                .ok_or_else(|| missing_volume(snapshot, disk))?;
            if !pools.iter().any(|p| p.name() == pool.name()) {
                pools.push(pool);
            }
        }
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(pools)
    }
}

fn require_shut_off(vm: &VirtualMachine) -> Result<()> {
    if vm.state.is_shut_off() {
        Ok(())
    } else {
        Err(Error::InvalidState {
            expected: VmState::ShutOff.to_string(),
            actual: vm.state.to_string(),
        })
    }
}

fn missing_volume(snapshot: &Snapshot, disk: &DiskDevice) -> Error {
    Error::precondition(format!(
        "snapshot {} references volume {} ({}) which no longer exists",
        snapshot.name, disk.volume_path, disk.target_dev
    ))
}
