//! Hypervisor driver implementations.
//!
//! The orchestration core never talks to a hypervisor directly; it goes
//! through the [`Driver`] trait. Two implementations are provided:
//!
//! - [`SimDriver`]: in-memory hypervisor used by tests and demos
//! - [`VirshDriver`]: shells out to libvirt's `virsh`

mod sim;
mod virsh;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DriverKind, VmdeckConfig};
use crate::error::Result;
use crate::vm::{DiskDevice, NetworkInterface, VirtualMachine, VmId, VmMetrics, VmState};

pub use sim::{Gate, SimDriver};
pub use virsh::VirshDriver;

/// Failure reported by the underlying hypervisor, message kept verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    /// Driver-specific error text.
    pub message: String,
}

impl DriverError {
    /// Create a driver error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result type for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Operations exposed by a driver. Used for error reporting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverOp {
    /// Define a new domain.
    Define,
    /// Start a domain.
    Start,
    /// Graceful shutdown.
    Stop,
    /// Reboot a running domain.
    Reboot,
    /// Suspend a running domain.
    Pause,
    /// Resume a suspended domain.
    Resume,
    /// Undefine a domain (keeps storage).
    Delete,
    /// Query state and metrics.
    DomainInfo,
    /// Create a snapshot.
    SnapshotCreate,
    /// Revert to a snapshot.
    SnapshotRevert,
    /// Delete a snapshot.
    SnapshotDelete,
    /// Attach a disk.
    AttachDisk,
    /// Detach a disk.
    DetachDisk,
    /// Attach a network interface.
    AttachNetwork,
    /// Detach a network interface.
    DetachNetwork,
    /// Create and start a storage pool.
    PoolCreate,
    /// Destroy and undefine a storage pool.
    PoolDelete,
    /// Create a volume.
    VolumeCreate,
    /// Delete a volume.
    VolumeDelete,
}

impl DriverOp {
    /// Get the operation name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            DriverOp::Define => "define",
            DriverOp::Start => "start",
            DriverOp::Stop => "stop",
            DriverOp::Reboot => "reboot",
            DriverOp::Pause => "pause",
            DriverOp::Resume => "resume",
            DriverOp::Delete => "delete",
            DriverOp::DomainInfo => "domain_info",
            DriverOp::SnapshotCreate => "snapshot_create",
            DriverOp::SnapshotRevert => "snapshot_revert",
            DriverOp::SnapshotDelete => "snapshot_delete",
            DriverOp::AttachDisk => "attach_disk",
            DriverOp::DetachDisk => "detach_disk",
            DriverOp::AttachNetwork => "attach_network",
            DriverOp::DetachNetwork => "detach_network",
            DriverOp::PoolCreate => "pool_create",
            DriverOp::PoolDelete => "pool_delete",
            DriverOp::VolumeCreate => "volume_create",
            DriverOp::VolumeDelete => "volume_delete",
        }
    }

    /// Wrap a driver error into the crate error for this operation.
    pub fn fail(self, err: DriverError) -> crate::error::Error {
        crate::error::Error::driver(self.name(), err.message)
    }
}

impl std::fmt::Display for DriverOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// State and metrics of a domain as seen by the hypervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainInfo {
    /// Current state.
    pub state: VmState,
    /// Runtime metrics.
    pub metrics: VmMetrics,
}

/// A hypervisor backend.
///
/// Calls are blocking and may take seconds; callers run them off the async
/// executor. Every method either succeeds or returns the hypervisor's own
/// error text. `live` on device operations means the VM is running and the
/// change should be applied to the live domain as well as its config.
pub trait Driver: Send + Sync {
    /// Backend name (e.g., "sim", "virsh").
    fn name(&self) -> &'static str;

    /// Define a new, shut-off domain.
    fn define(&self, vm: &VirtualMachine) -> DriverResult<()>;

    /// Start a domain.
    fn start(&self, id: &VmId) -> DriverResult<()>;

    /// Gracefully stop a domain.
    fn stop(&self, id: &VmId) -> DriverResult<()>;

    /// Reboot a domain.
    fn reboot(&self, id: &VmId) -> DriverResult<()>;

    /// Suspend a domain.
    fn pause(&self, id: &VmId) -> DriverResult<()>;

    /// Resume a suspended domain.
    fn resume(&self, id: &VmId) -> DriverResult<()>;

    /// Undefine a domain. Backing volumes are left untouched.
    fn delete(&self, id: &VmId) -> DriverResult<()>;

    /// Query current state and metrics.
    fn domain_info(&self, id: &VmId) -> DriverResult<DomainInfo>;

    /// Capture a snapshot of a stopped domain.
    fn snapshot_create(&self, id: &VmId, name: &str, description: &str) -> DriverResult<()>;

    /// Revert a stopped domain to a snapshot.
    fn snapshot_revert(&self, id: &VmId, name: &str) -> DriverResult<()>;

    /// Delete a snapshot.
    fn snapshot_delete(&self, id: &VmId, name: &str) -> DriverResult<()>;

    /// Attach a disk.
    fn attach_disk(&self, id: &VmId, disk: &DiskDevice, live: bool) -> DriverResult<()>;

    /// Detach a disk.
    fn detach_disk(&self, id: &VmId, disk: &DiskDevice, live: bool) -> DriverResult<()>;

    /// Attach a network interface.
    fn attach_network(&self, id: &VmId, nic: &NetworkInterface, live: bool) -> DriverResult<()>;

    /// Detach a network interface.
    fn detach_network(&self, id: &VmId, nic: &NetworkInterface, live: bool) -> DriverResult<()>;

    /// Create and activate a directory-backed storage pool.
    fn pool_create(&self, name: &str, path: &str) -> DriverResult<()>;

    /// Deactivate and undefine a storage pool.
    fn pool_delete(&self, name: &str) -> DriverResult<()>;

    /// Create a volume, returning its path.
    fn volume_create(&self, pool: &str, name: &str, capacity_b: u64) -> DriverResult<String>;

    /// Delete a volume.
    fn volume_delete(&self, pool: &str, name: &str) -> DriverResult<()>;
}

/// Create the driver selected in the configuration.
pub fn create_driver(config: &VmdeckConfig) -> Result<Box<dyn Driver>> {
    match config.driver {
        DriverKind::Sim => Ok(Box::new(SimDriver::new())),
        DriverKind::Virsh => {
            let driver = VirshDriver::new(config.virsh_uri.clone());
            driver.check_available()?;
            Ok(Box::new(driver))
        }
    }
}
