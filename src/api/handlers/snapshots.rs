//! Snapshot handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::blocking;
use crate::api::error::{ApiError, ApiJson, ErrorResponse};
use crate::api::state::ApiState;
use crate::api::types::{CreateSnapshotRequest, DeleteResponse, ListSnapshotsResponse};
use crate::snapshot::Snapshot;
use crate::vm::VirtualMachine;

/// List snapshots of a VM, oldest first.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/snapshots",
    tag = "Snapshots",
    params(("id" = String, Path, description = "VM id or name")),
    responses(
        (status = 200, description = "List of snapshots", body = ListSnapshotsResponse),
        (status = 404, description = "VM not found", body = ErrorResponse)
    )
)]
pub async fn list_snapshots(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ListSnapshotsResponse>, ApiError> {
    Ok(Json(ListSnapshotsResponse {
        snapshots: state.snapshots.list(&id)?,
    }))
}

/// Snapshot a shut-off VM.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/snapshots",
    tag = "Snapshots",
    params(("id" = String, Path, description = "VM id or name")),
    request_body = CreateSnapshotRequest,
    responses(
        (status = 201, description = "Snapshot created", body = Snapshot),
        (status = 400, description = "Invalid name", body = ErrorResponse),
        (status = 404, description = "VM not found", body = ErrorResponse),
        (status = 409, description = "VM not shut off or name taken", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn create_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<CreateSnapshotRequest>,
) -> Result<(StatusCode, Json<Snapshot>), ApiError> {
    let snapshot =
        blocking(move || state.snapshots.create(&id, &req.name, req.description)).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// Delete a snapshot.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}/snapshots/{name}",
    tag = "Snapshots",
    params(
        ("id" = String, Path, description = "VM id or name"),
        ("name" = String, Path, description = "Snapshot name")
    ),
    responses(
        (status = 200, description = "Snapshot deleted", body = DeleteResponse),
        (status = 404, description = "VM or snapshot not found", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn delete_snapshot(
    State(state): State<Arc<ApiState>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = name.clone();
    blocking(move || state.snapshots.delete(&id, &name)).await?;
    Ok(Json(DeleteResponse { deleted }))
}

/// Revert a shut-off VM to a snapshot.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/snapshots/{name}/revert",
    tag = "Snapshots",
    params(
        ("id" = String, Path, description = "VM id or name"),
        ("name" = String, Path, description = "Snapshot name")
    ),
    responses(
        (status = 200, description = "Reverted VM", body = VirtualMachine),
        (status = 404, description = "VM or snapshot not found", body = ErrorResponse),
        (status = 409, description = "VM not shut off or captured volume missing", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn revert_snapshot(
    State(state): State<Arc<ApiState>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<VirtualMachine>, ApiError> {
    let vm = blocking(move || state.snapshots.revert(&id, &name)).await?;
    Ok(Json(vm))
}
