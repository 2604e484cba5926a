//! JSON request and response types for the API.
//!
//! Field names are camelCase on the wire. Enum-valued request fields are
//! plain strings parsed by the handlers, so unknown values produce a
//! descriptive validation error instead of a generic body rejection.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::image::Image;
use crate::snapshot::Snapshot;
use crate::storage::{StoragePool, Volume};
use crate::vm::{VirtualMachine, VmSpec};

// ============================================================================
// VM Types
// ============================================================================

/// Request to create a new VM.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmRequest {
    /// Unique name for the VM.
    pub name: String,
    /// Number of vCPUs (default 1).
    #[serde(default)]
    pub vcpus: Option<u32>,
    /// Memory in KiB (default 1 GiB).
    #[serde(default)]
    pub memory_kb: Option<u64>,
    /// Maximum memory in KiB (defaults to memory).
    #[serde(default)]
    pub max_memory_kb: Option<u64>,
}

impl CreateVmRequest {
    /// Convert into a VM spec, filling in defaults.
    pub fn into_spec(self) -> VmSpec {
        let mut builder = VmSpec::builder(self.name);
        if let Some(vcpus) = self.vcpus {
            builder = builder.vcpus(vcpus);
        }
        if let Some(memory_kb) = self.memory_kb {
            builder = builder.memory_kb(memory_kb);
        }
        if let Some(max_memory_kb) = self.max_memory_kb {
            builder = builder.max_memory_kb(max_memory_kb);
        }
        builder.build()
    }
}

/// Request to run a lifecycle action.
#[derive(Debug, Deserialize, ToSchema)]
pub struct VmActionRequest {
    /// One of start, stop, reboot, pause, resume.
    pub action: String,
}

/// List of VMs.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListVmsResponse {
    /// VMs, oldest first.
    pub vms: Vec<VirtualMachine>,
}

// ============================================================================
// Snapshot Types
// ============================================================================

/// Request to create a snapshot.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSnapshotRequest {
    /// Snapshot name, unique within the VM.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
}

/// List of snapshots.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListSnapshotsResponse {
    /// Snapshots, oldest first.
    pub snapshots: Vec<Snapshot>,
}

// ============================================================================
// Device Types
// ============================================================================

/// Request to attach a disk.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachDiskRequest {
    /// Path of an existing volume.
    pub volume_path: String,
    /// Guest target device (e.g. `vdb`).
    pub target_dev: String,
    /// Bus: virtio (default), sata, scsi or ide.
    #[serde(default)]
    pub bus: Option<String>,
}

/// Request to attach a network interface.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachNetworkRequest {
    /// Source network name.
    pub network_name: String,
    /// Model: virtio, e1000 or rtl8139.
    pub model: String,
}

// ============================================================================
// Storage Types
// ============================================================================

/// Request to create a storage pool.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolRequest {
    /// Unique pool name.
    pub name: String,
    /// Capacity in GiB.
    pub capacity_gb: u64,
    /// Target directory (defaults to the data directory).
    #[serde(default)]
    pub path: Option<String>,
}

/// List of storage pools.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListPoolsResponse {
    /// Pools, ordered by name.
    pub pools: Vec<StoragePool>,
}

/// Request to create a volume.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    /// Volume name, unique within the pool.
    pub name: String,
    /// Size in GiB.
    pub size_gb: u64,
}

/// List of volumes.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListVolumesResponse {
    /// Volumes, in creation order.
    pub volumes: Vec<Volume>,
}

// ============================================================================
// Image Types
// ============================================================================

/// Request to register an image.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterImageRequest {
    /// Unique image name.
    pub name: String,
    /// iso or template.
    pub kind: String,
    /// Size in bytes.
    #[serde(default)]
    pub size_b: u64,
    /// Operating system description.
    #[serde(default)]
    pub os_info: Option<String>,
    /// Initial status (default available).
    #[serde(default)]
    pub status: Option<String>,
}

/// Request to change an image's status.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ImageStatusRequest {
    /// available, uploading, downloading or error.
    pub status: String,
}

/// List of images.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListImagesResponse {
    /// Images, oldest first.
    pub images: Vec<Image>,
}

// ============================================================================
// Common Types
// ============================================================================

/// Response for delete operations.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    /// Identifier of the deleted resource.
    pub deleted: String,
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status.
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
    /// Active hypervisor driver.
    pub driver: &'static str,
}
