//! Server-sent event stream of registry changes.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::api::state::ApiState;

/// Stream registry change events.
///
/// Each event's name is the change type (`vmUpdated`, `poolRemoved`, ...)
/// and its data the JSON-encoded change. A subscriber that falls behind
/// receives a `lagged` event with the number of skipped changes and should
/// re-query.
#[utoipa::path(
    get,
    path = "/api/v1/events",
    tag = "Events",
    responses((status = 200, description = "Event stream", content_type = "text/event-stream"))
)]
pub async fn stream_events(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let mut events = state.registry.subscribe();

    let stream = async_stream::stream! {
        loop {
            match events.recv().await {
                Ok(change) => match Event::default().event(change.name()).json_data(&change) {
                    Ok(event) => yield Ok(event),
                    Err(e) => tracing::warn!(error = %e, "failed to encode registry event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged");
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
