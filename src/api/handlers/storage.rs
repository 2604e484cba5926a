//! Storage pool and volume handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::blocking;
use crate::api::error::{ApiError, ApiJson, ErrorResponse};
use crate::api::state::ApiState;
use crate::api::types::{
    CreatePoolRequest, CreateVolumeRequest, DeleteResponse, ListPoolsResponse, ListVolumesResponse,
};
use crate::storage::{StoragePool, Volume};

/// List storage pools.
#[utoipa::path(
    get,
    path = "/api/v1/storage-pools",
    tag = "Storage",
    responses((status = 200, description = "List of pools", body = ListPoolsResponse))
)]
pub async fn list_pools(State(state): State<Arc<ApiState>>) -> Json<ListPoolsResponse> {
    Json(ListPoolsResponse {
        pools: state.storage.list_pools(),
    })
}

/// Create and activate a storage pool.
#[utoipa::path(
    post,
    path = "/api/v1/storage-pools",
    tag = "Storage",
    request_body = CreatePoolRequest,
    responses(
        (status = 201, description = "Pool created", body = StoragePool),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Pool already exists", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn create_pool(
    State(state): State<Arc<ApiState>>,
    ApiJson(req): ApiJson<CreatePoolRequest>,
) -> Result<(StatusCode, Json<StoragePool>), ApiError> {
    let pool = blocking(move || {
        state
            .storage
            .create_pool(&req.name, req.capacity_gb, req.path.as_deref())
    })
    .await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

/// Get a storage pool.
#[utoipa::path(
    get,
    path = "/api/v1/storage-pools/{name}",
    tag = "Storage",
    params(("name" = String, Path, description = "Pool name")),
    responses(
        (status = 200, description = "Pool details", body = StoragePool),
        (status = 404, description = "Pool not found", body = ErrorResponse)
    )
)]
pub async fn get_pool(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<StoragePool>, ApiError> {
    Ok(Json(state.storage.get_pool(&name)?))
}

/// Delete an empty storage pool.
#[utoipa::path(
    delete,
    path = "/api/v1/storage-pools/{name}",
    tag = "Storage",
    params(("name" = String, Path, description = "Pool name")),
    responses(
        (status = 200, description = "Pool deleted", body = DeleteResponse),
        (status = 404, description = "Pool not found", body = ErrorResponse),
        (status = 409, description = "Pool still owns volumes", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn delete_pool(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = name.clone();
    blocking(move || state.storage.delete_pool(&name)).await?;
    Ok(Json(DeleteResponse { deleted }))
}

/// List volumes in a pool.
#[utoipa::path(
    get,
    path = "/api/v1/storage-pools/{name}/volumes",
    tag = "Storage",
    params(("name" = String, Path, description = "Pool name")),
    responses(
        (status = 200, description = "List of volumes", body = ListVolumesResponse),
        (status = 404, description = "Pool not found", body = ErrorResponse)
    )
)]
pub async fn list_volumes(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<ListVolumesResponse>, ApiError> {
    Ok(Json(ListVolumesResponse {
        volumes: state.storage.list_volumes(&name)?,
    }))
}

/// Create a volume in a pool.
#[utoipa::path(
    post,
    path = "/api/v1/storage-pools/{name}/volumes",
    tag = "Storage",
    params(("name" = String, Path, description = "Pool name")),
    request_body = CreateVolumeRequest,
    responses(
        (status = 201, description = "Volume created", body = Volume),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Pool not found", body = ErrorResponse),
        (status = 409, description = "Volume exists or pool inactive", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse),
        (status = 507, description = "Pool capacity exceeded", body = ErrorResponse)
    )
)]
pub async fn create_volume(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    ApiJson(req): ApiJson<CreateVolumeRequest>,
) -> Result<(StatusCode, Json<Volume>), ApiError> {
    let volume =
        blocking(move || state.storage.create_volume(&name, &req.name, req.size_gb)).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

/// Delete a volume no VM disk references.
#[utoipa::path(
    delete,
    path = "/api/v1/storage-pools/{name}/volumes/{volume}",
    tag = "Storage",
    params(
        ("name" = String, Path, description = "Pool name"),
        ("volume" = String, Path, description = "Volume name")
    ),
    responses(
        (status = 200, description = "Volume deleted", body = DeleteResponse),
        (status = 404, description = "Pool or volume not found", body = ErrorResponse),
        (status = 409, description = "Volume in use", body = ErrorResponse),
        (status = 502, description = "Hypervisor error", body = ErrorResponse)
    )
)]
pub async fn delete_volume(
    State(state): State<Arc<ApiState>>,
    Path((name, volume)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = volume.clone();
    blocking(move || state.storage.delete_volume(&name, &volume)).await?;
    Ok(Json(DeleteResponse { deleted }))
}
