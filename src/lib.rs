//! vmdeck - VM, snapshot and storage orchestration backend.
//!
//! vmdeck keeps an authoritative registry of VMs, storage pools, volumes and
//! images in front of a hypervisor driver, and serves it over an HTTP API.
//!
//! # Architecture
//!
//! - [`registry`]: in-memory resource records, per-VM operation markers and
//!   the change event stream, persisted to [`db`]
//! - [`lifecycle`], [`snapshot`], [`devices`], [`storage`], [`image`]: the
//!   services that validate requests and drive the hypervisor
//! - [`driver`]: the hypervisor seam, with a simulated and a `virsh` backend
//! - [`api`]: axum router, handlers, OpenAPI document and the reconciling
//!   supervisor

pub mod api;
pub mod config;
pub mod db;
pub mod devices;
pub mod driver;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod registry;
pub mod snapshot;
pub mod storage;
pub mod util;
pub mod vm;

pub use api::openapi::ApiDoc;
pub use error::{Error, Result};

/// vmdeck version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
