//! Image catalog.
//!
//! Installation ISOs and VM templates known to the dashboard. Images have
//! their own lifecycle, independent of VMs and storage pools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::util::validate_name;

/// Kind of image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// Installation media.
    Iso,
    /// Pre-installed disk template.
    Template,
}

impl ImageKind {
    /// Get the kind name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ImageKind::Iso => "iso",
            ImageKind::Template => "template",
        }
    }
}

impl FromStr for ImageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iso" => Ok(ImageKind::Iso),
            "template" => Ok(ImageKind::Template),
            other => Err(Error::validation(format!(
                "unknown image kind '{}': expected iso or template",
                other
            ))),
        }
    }
}

/// Availability of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Available,
    Uploading,
    Downloading,
    Error,
}

impl ImageStatus {
    /// Get the status name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ImageStatus::Available => "available",
            ImageStatus::Uploading => "uploading",
            ImageStatus::Downloading => "downloading",
            ImageStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(ImageStatus::Available),
            "uploading" => Ok(ImageStatus::Uploading),
            "downloading" => Ok(ImageStatus::Downloading),
            "error" => Ok(ImageStatus::Error),
            other => Err(Error::validation(format!(
                "unknown image status '{}': expected available, uploading, downloading or error",
                other
            ))),
        }
    }
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Stable identity.
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    /// Unique name.
    pub name: String,
    /// Image kind.
    pub kind: ImageKind,
    /// Availability.
    pub status: ImageStatus,
    /// Size in bytes.
    pub size_b: u64,
    /// Operating system description, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_info: Option<String>,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// Create a new image entry with a fresh id.
    pub fn new(
        name: impl Into<String>,
        kind: ImageKind,
        status: ImageStatus,
        size_b: u64,
        os_info: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            status,
            size_b,
            os_info,
            created_at: Utc::now(),
        }
    }
}

/// Registers, lists and removes images.
pub struct ImageCatalog {
    registry: Arc<Registry>,
}

impl ImageCatalog {
    /// Create an image catalog.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Register an image. Status defaults to available.
    pub fn register(
        &self,
        name: &str,
        kind: ImageKind,
        size_b: u64,
        os_info: Option<String>,
        status: Option<ImageStatus>,
    ) -> Result<Image> {
        validate_name("image", name)?;
        let os_info = os_info.filter(|s| !s.trim().is_empty());
        let image = Image::new(
            name,
            kind,
            status.unwrap_or(ImageStatus::Available),
            size_b,
            os_info,
        );
        let image = self.registry.insert_image(image)?;
        tracing::info!(image = %image.id, name = %image.name, kind = image.kind.name(), "image registered");
        Ok(image)
    }

    /// All images, oldest first.
    pub fn list(&self) -> Vec<Image> {
        self.registry.list_images()
    }

    /// Look up an image by id, falling back to its name.
    pub fn get(&self, id_or_name: &str) -> Result<Image> {
        self.resolve(id_or_name)
    }

    /// Update an image's status.
    pub fn set_status(&self, id_or_name: &str, status: ImageStatus) -> Result<Image> {
        let id = self.resolve(id_or_name)?.id;
        let image = self.registry.update_image(&id, |image| image.status = status)?;
        tracing::info!(image = %id, status = %status, "image status updated");
        Ok(image)
    }

    /// Remove an image from the catalog.
    pub fn delete(&self, id_or_name: &str) -> Result<Image> {
        let id = self.resolve(id_or_name)?.id;
        let image = self.registry.remove_image(&id)?;
        tracing::info!(image = %id, name = %image.name, "image deleted");
        Ok(image)
    }

    fn resolve(&self, id_or_name: &str) -> Result<Image> {
        if let Ok(id) = Uuid::parse_str(id_or_name) {
            if let Ok(image) = self.registry.image(&id) {
                return Ok(image);
            }
        }
        self.registry
            .list_images()
            .into_iter()
            .find(|i| i.name == id_or_name)
            .ok_or_else(|| Error::not_found("image", id_or_name))
    }
}
