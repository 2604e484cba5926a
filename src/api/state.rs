//! API server state management.

use std::sync::Arc;

use crate::config::VmdeckConfig;
use crate::db::VmdeckDb;
use crate::devices::DeviceAttachmentService;
use crate::driver::{create_driver, Driver};
use crate::error::Result;
use crate::image::ImageCatalog;
use crate::lifecycle::LifecycleController;
use crate::registry::Registry;
use crate::snapshot::SnapshotManager;
use crate::storage::StorageManager;

/// Shared API server state: the registry and the services built on it.
pub struct ApiState {
    /// Server configuration.
    pub config: VmdeckConfig,
    /// Authoritative resource registry.
    pub registry: Arc<Registry>,
    /// Hypervisor driver.
    pub driver: Arc<dyn Driver>,
    /// VM lifecycle.
    pub lifecycle: LifecycleController,
    /// VM snapshots.
    pub snapshots: SnapshotManager,
    /// Disk and NIC attachment.
    pub devices: DeviceAttachmentService,
    /// Pools and volumes.
    pub storage: StorageManager,
    /// Image catalog.
    pub images: ImageCatalog,
}

impl ApiState {
    /// Build the state over an existing registry and driver.
    pub fn new(config: VmdeckConfig, registry: Arc<Registry>, driver: Arc<dyn Driver>) -> Result<Self> {
        let pool_root = config.data_dir()?.join("pools");
        Ok(Self {
            lifecycle: LifecycleController::new(registry.clone(), driver.clone()),
            snapshots: SnapshotManager::new(registry.clone(), driver.clone()),
            devices: DeviceAttachmentService::new(registry.clone(), driver.clone()),
            storage: StorageManager::new(registry.clone(), driver.clone(), pool_root),
            images: ImageCatalog::new(registry.clone()),
            config,
            registry,
            driver,
        })
    }

    /// Open the database, rebuild the registry and create the configured
    /// driver.
    pub fn open(config: VmdeckConfig) -> Result<Self> {
        let db_path = config.db_path()?;
        let db = Arc::new(VmdeckDb::open(&db_path)?);
        let registry = Arc::new(Registry::open(db)?);
        let driver: Arc<dyn Driver> = Arc::from(create_driver(&config)?);
        tracing::info!(db = %db_path.display(), driver = driver.name(), "api state initialized");
        Self::new(config, registry, driver)
    }

    /// Ensure every pool listed in the configuration exists.
    /// Returns the names of pools that could not be created.
    pub fn seed_pools(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for seed in &self.config.pools {
            let path = seed.path.as_ref().map(|p| p.to_string_lossy().into_owned());
            if let Err(e) = self
                .storage
                .ensure_pool(&seed.name, seed.capacity_gb, path.as_deref())
            {
                tracing::warn!(pool = %seed.name, error = %e, "failed to create configured pool");
                failed.push(seed.name.clone());
            }
        }
        failed
    }
}
