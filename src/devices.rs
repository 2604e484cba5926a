//! Disk and network interface attachment.
//!
//! Devices can be changed while a VM is running (hot, applied to the live
//! domain and its config) or shut off (cold, config only). The VM's device
//! lists change only after the driver confirms.

use std::sync::Arc;

use crate::driver::{Driver, DriverOp};
use crate::error::{Error, Result};
use crate::registry::{Operation, Registry};
use crate::util::{unique_mac, validate_name, validate_target_dev};
use crate::vm::{DiskBus, DiskDevice, NetworkInterface, NicModel, VirtualMachine, VmState};

/// Attaches and detaches VM devices.
pub struct DeviceAttachmentService {
    registry: Arc<Registry>,
    driver: Arc<dyn Driver>,
}

impl DeviceAttachmentService {
    /// Create a device attachment service.
    pub fn new(registry: Arc<Registry>, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    /// Attach the volume at `volume_path` as `target_dev`.
    pub fn attach_disk(
        &self,
        vm: &str,
        volume_path: &str,
        target_dev: &str,
        bus: DiskBus,
    ) -> Result<VirtualMachine> {
        validate_target_dev(target_dev)?;
        if volume_path.trim().is_empty() {
            return Err(Error::validation("volume path cannot be empty"));
        }

        let slot = self.registry.vm(vm)?;
        let claim = slot.begin(Operation::AttachDisk)?;

        let current = slot.vm();
        require_device_state(&current)?;
        if current.disk(target_dev).is_some() {
            return Err(Error::conflict(format!(
                "target {} is already in use on vm {}",
                target_dev, current.name
            )));
        }

        // The pool lock keeps the volume from being deleted until the disk
        // is recorded.
        let (pool, _) = self
            .registry
            .find_volume(volume_path)
            .ok_or_else(|| Error::not_found("volume", volume_path))?;
        let _pool_guard = pool.lock_ops()?;
        if !pool.read(|r| r.volumes.iter().any(|v| v.path == volume_path)) {
            return Err(Error::not_found("volume", volume_path));
        }

        let disk = DiskDevice {
            target_dev: target_dev.to_string(),
            volume_path: volume_path.to_string(),
            bus,
        };
        let live = current.state.is_running();
        self.driver
            .attach_disk(&current.id, &disk, live)
            .map_err(|e| DriverOp::AttachDisk.fail(e))?;

        let vm = self.registry.update_vm(&slot, &claim, |record| {
            check_unchanged(&record.vm, current.state)?;
            record.vm.disks.push(disk.clone());
            Ok(record.vm.clone())
        })?;
        tracing::info!(vm = %vm.id, target = %target_dev, volume = %volume_path, live, "disk attached");
        Ok(vm)
    }

    /// Attach a NIC on `network`. A MAC in the `52:54:00` range is assigned.
    pub fn attach_network(
        &self,
        vm: &str,
        network: &str,
        model: NicModel,
    ) -> Result<VirtualMachine> {
        validate_name("network", network)?;

        let slot = self.registry.vm(vm)?;
        let claim = slot.begin(Operation::AttachNetwork)?;

        let current = slot.vm();
        require_device_state(&current)?;

        let nic = NetworkInterface {
            model,
            network: network.to_string(),
            mac: unique_mac(current.nics.iter().map(|n| n.mac.as_str())),
        };
        let live = current.state.is_running();
        self.driver
            .attach_network(&current.id, &nic, live)
            .map_err(|e| DriverOp::AttachNetwork.fail(e))?;

        let vm = self.registry.update_vm(&slot, &claim, |record| {
            check_unchanged(&record.vm, current.state)?;
            record.vm.nics.push(nic.clone());
            Ok(record.vm.clone())
        })?;
        tracing::info!(vm = %vm.id, network = %network, mac = %nic.mac, live, "network attached");
        Ok(vm)
    }

    /// Detach the disk at `target_dev`. The backing volume is kept.
    pub fn detach_disk(&self, vm: &str, target_dev: &str) -> Result<VirtualMachine> {
        let slot = self.registry.vm(vm)?;
        let claim = slot.begin(Operation::DetachDisk)?;

        let current = slot.vm();
        require_device_state(&current)?;
        let disk = current
            .disk(target_dev)
            .cloned()
            .ok_or_else(|| Error::not_found("disk", target_dev))?;

        let live = current.state.is_running();
        self.driver
            .detach_disk(&current.id, &disk, live)
            .map_err(|e| DriverOp::DetachDisk.fail(e))?;

        let vm = self.registry.update_vm(&slot, &claim, |record| {
            check_unchanged(&record.vm, current.state)?;
            record.vm.disks.retain(|d| d.target_dev != target_dev);
            Ok(record.vm.clone())
        })?;
        tracing::info!(vm = %vm.id, target = %target_dev, live, "disk detached");
        Ok(vm)
    }

    /// Detach the NIC with `mac`.
    pub fn detach_network(&self, vm: &str, mac: &str) -> Result<VirtualMachine> {
        let slot = self.registry.vm(vm)?;
        let claim = slot.begin(Operation::DetachNetwork)?;

        let current = slot.vm();
        require_device_state(&current)?;
        let nic = current
            .nic(mac)
            .cloned()
            .ok_or_else(|| Error::not_found("network interface", mac))?;

        let live = current.state.is_running();
        self.driver
            .detach_network(&current.id, &nic, live)
            .map_err(|e| DriverOp::DetachNetwork.fail(e))?;

        let vm = self.registry.update_vm(&slot, &claim, |record| {
            check_unchanged(&record.vm, current.state)?;
            record.vm.nics.retain(|n| !n.mac.eq_ignore_ascii_case(&nic.mac));
            Ok(record.vm.clone())
        })?;
        tracing::info!(vm = %vm.id, mac = %nic.mac, live, "network detached");
        Ok(vm)
    }
}

fn require_device_state(vm: &VirtualMachine) -> Result<()> {
    if vm.state.accepts_devices() {
        Ok(())
    } else {
        Err(Error::InvalidState {
            expected: format!("{} or {}", VmState::Running, VmState::ShutOff),
            actual: vm.state.to_string(),
        })
    }
}

fn check_unchanged(vm: &VirtualMachine, observed: VmState) -> Result<()> {
    if vm.state == observed {
        Ok(())
    } else {
        Err(Error::conflict(format!(
            "vm {} changed state concurrently: expected {}, found {}",
            vm.name, observed, vm.state
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimDriver;
    use crate::error::ErrorKind;
    use crate::lifecycle::LifecycleController;
    use crate::storage::StorageManager;
    use crate::vm::VmSpec;
    use std::path::PathBuf;

    struct Fixture {
        registry: Arc<Registry>,
        driver: Arc<SimDriver>,
        lifecycle: LifecycleController,
        devices: DeviceAttachmentService,
        storage: StorageManager,
        volume_path: String,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::in_memory());
        let driver = Arc::new(SimDriver::new());
        let lifecycle = LifecycleController::new(registry.clone(), driver.clone());
        let devices = DeviceAttachmentService::new(registry.clone(), driver.clone());
        let storage = StorageManager::new(registry.clone(), driver.clone(), PathBuf::from("/pools"));

        lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();
        storage.create_pool("default", 10, None).unwrap();
        let volume = storage.create_volume("default", "data", 1).unwrap();

        Fixture {
            registry,
            driver,
            lifecycle,
            devices,
            storage,
            volume_path: volume.path,
        }
    }

    #[test]
    fn test_cold_and_hot_attach() {
        let f = fixture();
        let vm = f.devices.attach_disk("vm-1", &f.volume_path, "vdb", DiskBus::Virtio).unwrap();
        assert_eq!(vm.disks.len(), 1);
        assert_eq!(vm.disks[0].volume_path, "/pools/default/data");

        f.lifecycle.start("vm-1").unwrap();
        let vm = f.devices.attach_network("vm-1", "default", NicModel::E1000).unwrap();
        assert_eq!(vm.nics.len(), 1);
        assert!(vm.nics[0].mac.starts_with("52:54:00:"));
    }

    #[test]
    fn test_duplicate_target_conflicts() {
        let f = fixture();
        f.devices.attach_disk("vm-1", &f.volume_path, "vdb", DiskBus::Virtio).unwrap();
        let err = f
            .devices
            .attach_disk("vm-1", &f.volume_path, "vdb", DiskBus::Sata)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(f.registry.vm("vm-1").unwrap().vm().disks.len(), 1);
        assert_eq!(f.driver.call_count(DriverOp::AttachDisk), 1);
    }

    #[test]
    fn test_attach_validates_input() {
        let f = fixture();
        assert_eq!(
            f.devices
                .attach_disk("vm-1", &f.volume_path, "VDB", DiskBus::Virtio)
                .unwrap_err()
                .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            f.devices
                .attach_disk("vm-1", "/pools/default/nope", "vdb", DiskBus::Virtio)
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            f.devices.attach_network("vm-1", "", NicModel::Virtio).unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            "ne2k_pci".parse::<NicModel>().unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_paused_vm_rejects_devices() {
        let f = fixture();
        f.lifecycle.start("vm-1").unwrap();
        f.lifecycle.pause("vm-1").unwrap();
        let err = f
            .devices
            .attach_disk("vm-1", &f.volume_path, "vdb", DiskBus::Virtio)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_hot_attach_failure_surfaces_driver_error() {
        let f = fixture();
        f.lifecycle.start("vm-1").unwrap();
        f.driver.set_hot_attach(false);

        let err = f
            .devices
            .attach_disk("vm-1", &f.volume_path, "vdb", DiskBus::Virtio)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Driver);
        assert!(err.to_string().contains("hot-plug"));
        assert!(f.registry.vm("vm-1").unwrap().vm().disks.is_empty());
    }

    #[test]
    fn test_attached_volume_cannot_be_deleted() {
        let f = fixture();
        f.devices.attach_disk("vm-1", &f.volume_path, "vdb", DiskBus::Virtio).unwrap();

        let err = f.storage.delete_volume("default", "data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("vm-1"));

        f.devices.detach_disk("vm-1", "vdb").unwrap();
        f.storage.delete_volume("default", "data").unwrap();
    }

    #[test]
    fn test_detach_unknown_device_is_not_found() {
        let f = fixture();
        assert_eq!(
            f.devices.detach_disk("vm-1", "vdz").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            f.devices.detach_network("vm-1", "52:54:00:00:00:01").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_detach_network_by_mac() {
        let f = fixture();
        let vm = f.devices.attach_network("vm-1", "default", NicModel::Virtio).unwrap();
        let mac = vm.nics[0].mac.to_uppercase();
        let vm = f.devices.detach_network("vm-1", &mac).unwrap();
        assert!(vm.nics.is_empty());
    }

    #[test]
    fn test_macs_are_unique_per_vm() {
        let f = fixture();
        for _ in 0..8 {
            f.devices.attach_network("vm-1", "default", NicModel::Virtio).unwrap();
        }
        let vm = f.registry.vm("vm-1").unwrap().vm();
        let mut macs: Vec<&str> = vm.nics.iter().map(|n| n.mac.as_str()).collect();
        macs.sort();
        macs.dedup();
        assert_eq!(macs.len(), 8);
    }
}
