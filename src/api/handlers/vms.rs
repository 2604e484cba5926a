//! VM handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::blocking;
use crate::api::error::{ApiError, ApiJson, ErrorResponse};
use crate::api::state::ApiState;
use crate::api::types::{CreateVmRequest, DeleteResponse, ListVmsResponse, VmActionRequest};
use crate::vm::{LifecycleAction, VirtualMachine};

/// List all VMs.
#[utoipa::path(
    get,
    path = "/api/v1/vms",
    tag = "VMs",
    responses((status = 200, description = "List of VMs", body = ListVmsResponse))
)]
pub async fn list_vms(State(state): State<Arc<ApiState>>) -> Json<ListVmsResponse> {
    Json(ListVmsResponse {
        vms: state.registry.list_vms(),
    })
}

/// Create a VM. It starts out shut off.
#[utoipa::path(
    post,
    path = "/api/v1/vms",
    tag = "VMs",
    request_body = CreateVmRequest,
    responses(
        (status = 201, description = "VM created", body = VirtualMachine),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "VM already exists", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn create_vm(
    State(state): State<Arc<ApiState>>,
    ApiJson(req): ApiJson<CreateVmRequest>,
) -> Result<(StatusCode, Json<VirtualMachine>), ApiError> {
    let spec = req.into_spec();
    let vm = blocking(move || state.lifecycle.create(&spec)).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

/// Get a VM by id or name.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}",
    tag = "VMs",
    params(("id" = String, Path, description = "VM id or name")),
    responses(
        (status = 200, description = "VM details", body = VirtualMachine),
        (status = 404, description = "VM not found", body = ErrorResponse)
    )
)]
pub async fn get_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<VirtualMachine>, ApiError> {
    Ok(Json(state.registry.vm(&id)?.vm()))
}

/// Run a lifecycle action (start, stop, reboot, pause, resume).
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/action",
    tag = "VMs",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = VmActionRequest,
    responses(
        (status = 200, description = "Updated VM", body = VirtualMachine),
        (status = 400, description = "Unknown action", body = ErrorResponse),
        (status = 404, description = "VM not found", body = ErrorResponse),
        (status = 409, description = "Operation in flight or illegal transition", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn vm_action(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<VmActionRequest>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let action: LifecycleAction = req.action.parse()?;
    let vm = blocking(move || state.lifecycle.apply(&id, action)).await?;
    Ok(Json(vm))
}

/// Delete a VM and its snapshots. Backing volumes are kept.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}",
    tag = "VMs",
    params(("id" = String, Path, description = "VM id or name")),
    responses(
        (status = 200, description = "VM deleted", body = DeleteResponse),
        (status = 404, description = "VM not found", body = ErrorResponse),
        (status = 409, description = "Operation in flight", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn delete_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let vm = blocking(move || state.lifecycle.delete(&id)).await?;
    Ok(Json(DeleteResponse {
        deleted: vm.id.to_string(),
    }))
}
