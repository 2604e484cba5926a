//! Device attachment handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use super::blocking;
use crate::api::error::{ApiError, ApiJson, ErrorResponse};
use crate::api::state::ApiState;
use crate::api::types::{AttachDiskRequest, AttachNetworkRequest};
use crate::vm::{DiskBus, NicModel, VirtualMachine};

/// Attach a volume as a disk.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/attach-disk",
    tag = "Devices",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = AttachDiskRequest,
    responses(
        (status = 200, description = "Updated VM", body = VirtualMachine),
        (status = 400, description = "Invalid target or bus", body = ErrorResponse),
        (status = 404, description = "VM or volume not found", body = ErrorResponse),
        (status = 409, description = "Target in use or VM in wrong state", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn attach_disk(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<AttachDiskRequest>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let bus: DiskBus = match req.bus.as_deref() {
        Some(bus) => bus.parse()?,
        None => DiskBus::default(),
    };
    let vm = blocking(move || {
        state
            .devices
            .attach_disk(&id, &req.volume_path, &req.target_dev, bus)
    })
    .await?;
    Ok(Json(vm))
}

/// Attach a network interface.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/attach-network",
    tag = "Devices",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = AttachNetworkRequest,
    responses(
        (status = 200, description = "Updated VM", body = VirtualMachine),
        (status = 400, description = "Invalid network or model", body = ErrorResponse),
        (status = 404, description = "VM not found", body = ErrorResponse),
        (status = 409, description = "VM in wrong state", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn attach_network(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<AttachNetworkRequest>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let model: NicModel = req.model.parse()?;
    let vm =
        blocking(move || state.devices.attach_network(&id, &req.network_name, model)).await?;
    Ok(Json(vm))
}

/// Detach a disk by target device.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}/disks/{target}",
    tag = "Devices",
    params(
        ("id" = String, Path, description = "VM id or name"),
        ("target" = String, Path, description = "Target device")
    ),
    responses(
        (status = 200, description = "Updated VM", body = VirtualMachine),
        (status = 404, description = "VM or disk not found", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn detach_disk(
    State(state): State<Arc<ApiState>>,
    Path((id, target)): Path<(String, String)>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let vm = blocking(move || state.devices.detach_disk(&id, &target)).await?;
    Ok(Json(vm))
}

/// Detach a network interface by MAC address.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}/nics/{mac}",
    tag = "Devices",
    params(
        ("id" = String, Path, description = "VM id or name"),
        ("mac" = String, Path, description = "MAC address")
    ),
    responses(
        (status = 200, description = "Updated VM", body = VirtualMachine),
        (status = 404, description = "VM or interface not found", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn detach_network(
    State(state): State<Arc<ApiState>>,
    Path((id, mac)): Path<(String, String)>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let vm = blocking(move || state.devices.detach_network(&id, &mac)).await?;
    Ok(Json(vm))
}
