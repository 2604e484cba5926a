//! Image catalog handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiJson, ErrorResponse};
use crate::api::state::ApiState;
use crate::api::types::{DeleteResponse, ImageStatusRequest, ListImagesResponse, RegisterImageRequest};
use crate::image::{Image, ImageKind, ImageStatus};

/// List images.
#[utoipa::path(
    get,
    path = "/api/v1/images",
    tag = "Images",
    responses((status = 200, description = "List of images", body = ListImagesResponse))
)]
pub async fn list_images(State(state): State<Arc<ApiState>>) -> Json<ListImagesResponse> {
    Json(ListImagesResponse {
        images: state.images.list(),
    })
}

/// Register an image.
#[utoipa::path(
    post,
    path = "/api/v1/images",
    tag = "Images",
    request_body = RegisterImageRequest,
    responses(
        (status = 201, description = "Image registered", body = Image),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Image name taken", body = ErrorResponse)
    )
)]
pub async fn register_image(
    State(state): State<Arc<ApiState>>,
    ApiJson(req): ApiJson<RegisterImageRequest>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    let kind: ImageKind = req.kind.parse()?;
    let status = req
        .status
        .as_deref()
        .map(str::parse::<ImageStatus>)
        .transpose()?;

    let image = state
        .images
        .register(&req.name, kind, req.size_b, req.os_info, status)?;
    Ok((StatusCode::CREATED, Json(image)))
}

/// Get an image by id or name.
#[utoipa::path(
    get,
    path = "/api/v1/images/{id}",
    tag = "Images",
    params(("id" = String, Path, description = "Image id or name")),
    responses(
        (status = 200, description = "Image details", body = Image),
        (status = 404, description = "Image not found", body = ErrorResponse)
    )
)]
pub async fn get_image(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    Ok(Json(state.images.get(&id)?))
}

/// Update an image's status.
#[utoipa::path(
    post,
    path = "/api/v1/images/{id}/status",
    tag = "Images",
    params(("id" = String, Path, description = "Image id or name")),
    request_body = ImageStatusRequest,
    responses(
        (status = 200, description = "Updated image", body = Image),
        (status = 400, description = "Unknown status", body = ErrorResponse),
        (status = 404, description = "Image not found", body = ErrorResponse)
    )
)]
pub async fn set_image_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ImageStatusRequest>,
) -> Result<Json<Image>, ApiError> {
    let status: ImageStatus = req.status.parse()?;
    Ok(Json(state.images.set_status(&id, status)?))
}

/// Remove an image from the catalog.
#[utoipa::path(
    delete,
    path = "/api/v1/images/{id}",
    tag = "Images",
    params(("id" = String, Path, description = "Image id or name")),
    responses(
        (status = 200, description = "Image deleted", body = DeleteResponse),
        (status = 404, description = "Image not found", body = ErrorResponse)
    )
)]
pub async fn delete_image(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let image = state.images.delete(&id)?;
    Ok(Json(DeleteResponse {
        deleted: image.id.to_string(),
    }))
}
