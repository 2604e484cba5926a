//! HTTP request handlers.
//!
//! Service calls may block on the hypervisor for seconds, so every
//! mutating handler runs its call on the blocking pool.

pub mod devices;
pub mod events;
pub mod health;
pub mod images;
pub mod snapshots;
pub mod storage;
pub mod vms;

use crate::api::error::ApiError;

/// Run a blocking service call off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}
