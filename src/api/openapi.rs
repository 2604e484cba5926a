//! OpenAPI document for the HTTP API.

use utoipa::OpenApi;

use crate::api::error::ErrorResponse;
use crate::api::handlers;
use crate::api::types::{
    AttachDiskRequest, AttachNetworkRequest, CreatePoolRequest, CreateSnapshotRequest,
    CreateVmRequest, CreateVolumeRequest, DeleteResponse, HealthResponse, ImageStatusRequest,
    ListImagesResponse, ListPoolsResponse, ListSnapshotsResponse, ListVmsResponse,
    ListVolumesResponse, RegisterImageRequest, VmActionRequest,
};
use crate::image::{Image, ImageKind, ImageStatus};
use crate::snapshot::Snapshot;
use crate::storage::{PoolState, StoragePool, Volume};
use crate::vm::{
    DiskBus, DiskDevice, LifecycleAction, NetworkInterface, NicModel, Resources, VirtualMachine,
    VmId, VmMetrics, VmState,
};

/// OpenAPI documentation for the vmdeck API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "vmdeck API",
        description = "VM, snapshot, device and storage orchestration",
        license(name = "Apache-2.0")
    ),
    paths(
        handlers::health::health,
        handlers::events::stream_events,
        handlers::vms::list_vms,
        handlers::vms::create_vm,
        handlers::vms::get_vm,
        handlers::vms::vm_action,
        handlers::vms::delete_vm,
        handlers::snapshots::list_snapshots,
        handlers::snapshots::create_snapshot,
        handlers::snapshots::delete_snapshot,
        handlers::snapshots::revert_snapshot,
        handlers::devices::attach_disk,
        handlers::devices::attach_network,
        handlers::devices::detach_disk,
        handlers::devices::detach_network,
        handlers::storage::list_pools,
        handlers::storage::create_pool,
        handlers::storage::get_pool,
        handlers::storage::delete_pool,
        handlers::storage::list_volumes,
        handlers::storage::create_volume,
        handlers::storage::delete_volume,
        handlers::images::list_images,
        handlers::images::register_image,
        handlers::images::get_image,
        handlers::images::set_image_status,
        handlers::images::delete_image,
    ),
    components(schemas(
        // VMs
        VirtualMachine,
        VmId,
        VmState,
        VmMetrics,
        Resources,
        DiskDevice,
        DiskBus,
        NetworkInterface,
        NicModel,
        LifecycleAction,
        CreateVmRequest,
        VmActionRequest,
        ListVmsResponse,
        // Snapshots
        Snapshot,
        CreateSnapshotRequest,
        ListSnapshotsResponse,
        // Devices
        AttachDiskRequest,
        AttachNetworkRequest,
        // Storage
        StoragePool,
        PoolState,
        Volume,
        CreatePoolRequest,
        CreateVolumeRequest,
        ListPoolsResponse,
        ListVolumesResponse,
        // Images
        Image,
        ImageKind,
        ImageStatus,
        RegisterImageRequest,
        ImageStatusRequest,
        ListImagesResponse,
        // Common
        DeleteResponse,
        HealthResponse,
        ErrorResponse,
    )),
    tags(
        (name = "Health", description = "Server health"),
        (name = "Events", description = "Registry change stream"),
        (name = "VMs", description = "VM lifecycle"),
        (name = "Snapshots", description = "VM snapshots"),
        (name = "Devices", description = "Disk and network attachment"),
        (name = "Storage", description = "Storage pools and volumes"),
        (name = "Images", description = "Image catalog")
    )
)]
pub struct ApiDoc;
