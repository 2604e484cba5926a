//! HTTP API server for vmdeck.
//!
//! This module exposes the registry and its services (lifecycle, snapshots,
//! devices, storage, images) over JSON/HTTP, plus a server-sent event
//! stream of registry changes.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! vmdeck serve --listen 127.0.0.1:8080
//!
//! # Create a VM
//! curl -X POST http://localhost:8080/api/v1/vms \
//!   -H "Content-Type: application/json" \
//!   -d '{"name": "vm-1", "vcpus": 2, "memoryKb": 2097152}'
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod state;
pub mod supervisor;
pub mod types;

use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use openapi::ApiDoc;
use state::ApiState;

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    // Health check route
    let health_route = Router::new().route("/health", get(handlers::health::health));

    // SSE events route (no timeout - streams indefinitely)
    let events_route = Router::new().route("/events", get(handlers::events::stream_events));

    let vm_routes = Router::new()
        .route("/", get(handlers::vms::list_vms))
        .route("/", post(handlers::vms::create_vm))
        .route("/:id", get(handlers::vms::get_vm))
        .route("/:id", delete(handlers::vms::delete_vm))
        .route("/:id/action", post(handlers::vms::vm_action))
        // Snapshot routes
        .route("/:id/snapshots", get(handlers::snapshots::list_snapshots))
        .route("/:id/snapshots", post(handlers::snapshots::create_snapshot))
        .route(
            "/:id/snapshots/:name",
            delete(handlers::snapshots::delete_snapshot),
        )
        .route(
            "/:id/snapshots/:name/revert",
            post(handlers::snapshots::revert_snapshot),
        )
        // Device routes
        .route("/:id/attach-disk", post(handlers::devices::attach_disk))
        .route(
            "/:id/attach-network",
            post(handlers::devices::attach_network),
        )
        .route("/:id/disks/:target", delete(handlers::devices::detach_disk))
        .route("/:id/nics/:mac", delete(handlers::devices::detach_network));

    let pool_routes = Router::new()
        .route("/", get(handlers::storage::list_pools))
        .route("/", post(handlers::storage::create_pool))
        .route("/:name", get(handlers::storage::get_pool))
        .route("/:name", delete(handlers::storage::delete_pool))
        .route("/:name/volumes", get(handlers::storage::list_volumes))
        .route("/:name/volumes", post(handlers::storage::create_volume))
        .route(
            "/:name/volumes/:volume",
            delete(handlers::storage::delete_volume),
        );

    let image_routes = Router::new()
        .route("/", get(handlers::images::list_images))
        .route("/", post(handlers::images::register_image))
        .route("/:id", get(handlers::images::get_image))
        .route("/:id", delete(handlers::images::delete_image))
        .route("/:id/status", post(handlers::images::set_image_status));

    // Apply timeout only to request/response routes
    let routes_with_timeout = Router::new()
        .nest("/vms", vm_routes)
        .nest("/storage-pools", pool_routes)
        .nest("/images", image_routes)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_timeout,
        ));

    // API v1 routes
    let api_v1 = Router::new()
        .merge(events_route)
        .merge(routes_with_timeout);

    // CORS: only the configured origins. Unparseable entries are skipped.
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    // Combine all routes
    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
