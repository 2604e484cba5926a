//! Request middleware.

use axum::{
    extract::{OriginalUri, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;

/// Bound a request by `config.request_timeout`.
///
/// Blocking service calls are not cancelled when the deadline passes, so the
/// error tells the client to re-query instead of assuming nothing changed.
pub async fn request_timeout(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let limit = state.config.request_timeout;
    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(%method, %path, timeout = ?limit, "request timed out");
            ApiError::Timeout(format!(
                "{} {} did not finish within {}; the operation may still complete, re-query the resource",
                method,
                path,
                humantime::format_duration(limit)
            ))
            .into_response()
        }
    }
}
