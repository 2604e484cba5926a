//! Virtual machine model.
//!
//! This module provides the registry's view of a VM:
//! - [`VirtualMachine`]: identity, lifecycle state, resources and devices
//! - [`DiskDevice`] / [`NetworkInterface`]: attached devices
//! - [`VmState`] / [`LifecycleAction`]: the lifecycle state machine

pub mod config;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use config::{DiskBus, NicModel, Resources, VmId, VmSpec, VmSpecBuilder};
pub use state::{LifecycleAction, VmState};

/// A disk attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskDevice {
    /// Guest target device name (e.g. `vdb`), unique within the VM.
    pub target_dev: String,
    /// Path of the backing volume. The volume is owned by its pool.
    pub volume_path: String,
    /// Bus the disk is attached to.
    #[serde(default)]
    pub bus: DiskBus,
}

/// A network interface attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Device model.
    pub model: NicModel,
    /// Source network name.
    pub network: String,
    /// MAC address, assigned at attach time.
    pub mac: String,
}

/// Runtime metrics refreshed by the supervisor. Read-only for clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmMetrics {
    /// CPU usage in percent of allocated vCPUs.
    pub cpu_percent: f64,
    /// Seconds since the domain was last started.
    pub uptime_sec: u64,
    /// Guest IP addresses reported by the hypervisor.
    pub ip_addresses: Vec<String>,
}

/// A virtual machine as recorded in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// Stable identity.
    pub id: VmId,
    /// Unique human name.
    pub name: String,
    /// Last confirmed lifecycle state.
    pub state: VmState,
    /// Resource configuration.
    pub resources: Resources,
    /// Attached disks, in attach order.
    #[serde(default)]
    pub disks: Vec<DiskDevice>,
    /// Attached network interfaces, in attach order.
    #[serde(default)]
    pub nics: Vec<NetworkInterface>,
    /// Derived runtime metrics.
    #[serde(default)]
    pub metrics: VmMetrics,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl VirtualMachine {
    /// Build a freshly defined (shut off, device-less) VM from a spec.
    pub fn from_spec(spec: &VmSpec) -> Self {
        Self {
            id: VmId::generate(),
            name: spec.name.clone(),
            state: VmState::ShutOff,
            resources: spec.resources.clone(),
            disks: Vec::new(),
            nics: Vec::new(),
            metrics: VmMetrics::default(),
            created_at: Utc::now(),
        }
    }

    /// Find an attached disk by target device name.
    pub fn disk(&self, target_dev: &str) -> Option<&DiskDevice> {
        self.disks.iter().find(|d| d.target_dev == target_dev)
    }

    /// Find an attached NIC by MAC address (case-insensitive).
    pub fn nic(&self, mac: &str) -> Option<&NetworkInterface> {
        self.nics.iter().find(|n| n.mac.eq_ignore_ascii_case(mac))
    }

    /// Check whether any disk of this VM is backed by `volume_path`.
    pub fn references_volume(&self, volume_path: &str) -> bool {
        self.disks.iter().any(|d| d.volume_path == volume_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_with_devices() -> VirtualMachine {
        let mut vm = VirtualMachine::from_spec(&VmSpec::builder("vm-1").build());
        vm.disks.push(DiskDevice {
            target_dev: "vdb".into(),
            volume_path: "/pools/default/data.qcow2".into(),
            bus: DiskBus::Virtio,
        });
        vm.nics.push(NetworkInterface {
            model: NicModel::Virtio,
            network: "default".into(),
            mac: "52:54:00:aa:bb:cc".into(),
        });
        vm
    }

    #[test]
    fn test_new_vm_is_shut_off_without_devices() {
        let vm = VirtualMachine::from_spec(&VmSpec::builder("vm-1").build());
        assert_eq!(vm.state, VmState::ShutOff);
        assert!(vm.disks.is_empty());
        assert!(vm.nics.is_empty());
    }

    #[test]
    fn test_device_lookup() {
        let vm = vm_with_devices();
        assert!(vm.disk("vdb").is_some());
        assert!(vm.disk("vdc").is_none());
        assert!(vm.nic("52:54:00:AA:BB:CC").is_some());
        assert!(vm.references_volume("/pools/default/data.qcow2"));
        assert!(!vm.references_volume("/pools/default/other.qcow2"));
    }

    #[test]
    fn test_vm_json_uses_camel_case() {
        let vm = vm_with_devices();
        let json = serde_json::to_value(&vm).unwrap();
        assert_eq!(json["state"], "shutoff");
        assert_eq!(json["disks"][0]["targetDev"], "vdb");
        assert_eq!(json["resources"]["memoryKb"], vm.resources.memory_kb);
        let back: VirtualMachine = serde_json::from_value(json).unwrap();
        assert_eq!(back, vm);
    }
}
