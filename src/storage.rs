//! Storage pool and volume management.
//!
//! Pools own volumes; VMs only reference volumes by path through their
//! disks. Capacity accounting is derived from the volume set, so a pool's
//! allocation can never drift from what it actually holds.
//!
//! Every capacity-affecting operation runs under the pool's operation lock,
//! which also keeps a volume from disappearing while a disk is being
//! attached to it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::driver::{Driver, DriverOp};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::util::{gib_to_bytes, validate_name};

/// Storage pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Pool is started and usable.
    Active,
    /// Pool is defined but not started.
    Inactive,
    /// Pool is being built.
    Building,
    /// Pool is running with reduced redundancy or performance.
    Degraded,
    /// Pool storage cannot be reached.
    Inaccessible,
    /// State could not be determined.
    Unknown,
}

impl PoolState {
    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            PoolState::Active => "active",
            PoolState::Inactive => "inactive",
            PoolState::Building => "building",
            PoolState::Degraded => "degraded",
            PoolState::Inaccessible => "inaccessible",
            PoolState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A storage volume, owned by its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Name, unique within the pool.
    pub name: String,
    /// Owning pool.
    pub pool: String,
    /// Capacity in bytes.
    pub capacity_b: u64,
    /// Path disks use to reference this volume.
    pub path: String,
}

/// A storage pool as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    /// Unique pool name.
    pub name: String,
    /// Pool state.
    pub state: PoolState,
    /// Target directory.
    pub path: String,
    /// Capacity in bytes.
    pub capacity_b: u64,
    /// Bytes allocated to volumes. Never exceeds `capacity_b`.
    pub allocation_b: u64,
}

/// Persisted form of a pool: the pool plus the volumes it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    /// Unique pool name.
    pub name: String,
    /// Last known pool state.
    pub state: PoolState,
    /// Target directory.
    pub path: String,
    /// Capacity in bytes.
    pub capacity_b: u64,
    /// Owned volumes, in creation order.
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl PoolRecord {
    /// Bytes allocated to volumes.
    pub fn allocation_b(&self) -> u64 {
        self.volumes
            .iter()
            .fold(0u64, |acc, v| acc.saturating_add(v.capacity_b))
    }

    /// Bytes still free.
    pub fn available_b(&self) -> u64 {
        self.capacity_b.saturating_sub(self.allocation_b())
    }

    /// Find a volume by name.
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// API view of this pool.
    pub fn to_pool(&self) -> StoragePool {
        StoragePool {
            name: self.name.clone(),
            state: self.state,
            path: self.path.clone(),
            capacity_b: self.capacity_b,
            allocation_b: self.allocation_b(),
        }
    }
}

/// Pool and volume CRUD with capacity accounting.
pub struct StorageManager {
    registry: Arc<Registry>,
    driver: Arc<dyn Driver>,
    pool_root: PathBuf,
}

impl StorageManager {
    /// Create a storage manager. Pools without an explicit path are placed
    /// under `pool_root`.
    pub fn new(registry: Arc<Registry>, driver: Arc<dyn Driver>, pool_root: PathBuf) -> Self {
        Self {
            registry,
            driver,
            pool_root,
        }
    }

    /// Create and activate a pool.
    pub fn create_pool(
        &self,
        name: &str,
        capacity_gb: u64,
        path: Option<&str>,
    ) -> Result<StoragePool> {
        validate_name("pool", name)?;
        let capacity_b = gib_to_bytes(capacity_gb)?;
        let path = match path {
            Some(p) if p.trim().is_empty() => {
                return Err(Error::validation("pool path cannot be empty"))
            }
            Some(p) => p.to_string(),
            None => self.pool_root.join(name).to_string_lossy().into_owned(),
        };

        let reservation = self.registry.reserve_pool_name(name)?;
        self.driver
            .pool_create(name, &path)
            .map_err(|e| DriverOp::PoolCreate.fail(e))?;

        let record = PoolRecord {
            name: name.to_string(),
            state: PoolState::Active,
            path,
            capacity_b,
            volumes: Vec::new(),
        };
        self.registry.insert_pool(reservation, record.clone());
        tracing::info!(pool = %name, capacity_gb, "storage pool created");
        Ok(record.to_pool())
    }

    /// Create a pool unless one with this name already exists.
    pub fn ensure_pool(
        &self,
        name: &str,
        capacity_gb: u64,
        path: Option<&str>,
    ) -> Result<StoragePool> {
        if let Ok(existing) = self.get_pool(name) {
            return Ok(existing);
        }
        self.create_pool(name, capacity_gb, path)
    }

    /// All pools, ordered by name.
    pub fn list_pools(&self) -> Vec<StoragePool> {
        self.registry
            .list_pools()
            .iter()
            .map(PoolRecord::to_pool)
            .collect()
    }

    /// Get a pool by name.
    pub fn get_pool(&self, name: &str) -> Result<StoragePool> {
        Ok(self.registry.pool(name)?.read(PoolRecord::to_pool))
    }

    /// Delete an empty pool.
    pub fn delete_pool(&self, name: &str) -> Result<()> {
        let slot = self.registry.pool(name)?;
        let guard = slot.lock_ops()?;

        let volumes = slot.read(|r| r.volumes.len());
        if volumes > 0 {
            return Err(Error::conflict(format!(
                "pool {} still owns {} volume(s)",
                name, volumes
            )));
        }

        self.driver
            .pool_delete(name)
            .map_err(|e| DriverOp::PoolDelete.fail(e))?;
        self.registry.remove_pool(&slot, &guard);
        tracing::info!(pool = %name, "storage pool deleted");
        Ok(())
    }

    /// Create a volume of `size_gb` GiB in a pool.
    pub fn create_volume(&self, pool: &str, name: &str, size_gb: u64) -> Result<Volume> {
        validate_name("volume", name)?;
        let capacity_b = gib_to_bytes(size_gb)?;

        let slot = self.registry.pool(pool)?;
        let guard = slot.lock_ops()?;

        let record = slot.record();
        if record.state != PoolState::Active {
            return Err(Error::precondition(format!(
                "pool {} is {}, not active",
                pool, record.state
            )));
        }
        if record.volume(name).is_some() {
            return Err(Error::conflict(format!(
                "volume {} already exists in pool {}",
                name, pool
            )));
        }
        let available_b = record.available_b();
        if capacity_b > available_b {
            return Err(Error::Capacity {
                pool: pool.to_string(),
                requested_b: capacity_b,
                available_b,
            });
        }

        let path = self
            .driver
            .volume_create(pool, name, capacity_b)
            .map_err(|e| DriverOp::VolumeCreate.fail(e))?;

        let volume = Volume {
            name: name.to_string(),
            pool: pool.to_string(),
            capacity_b,
            path,
        };
        self.registry.update_pool(&slot, &guard, |record| {
            record.volumes.push(volume.clone());
            Ok(())
        })?;
        tracing::info!(pool = %pool, volume = %name, size_gb, "volume created");
        Ok(volume)
    }

    /// Volumes of a pool, in creation order.
    pub fn list_volumes(&self, pool: &str) -> Result<Vec<Volume>> {
        Ok(self.registry.pool(pool)?.read(|r| r.volumes.clone()))
    }

    /// Delete a volume no disk references.
    pub fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        let slot = self.registry.pool(pool)?;
        let guard = slot.lock_ops()?;

        let volume = slot
            .read(|r| r.volume(name).cloned())
            .ok_or_else(|| Error::not_found("volume", format!("{}/{}", pool, name)))?;

        let users = self.registry.volume_users(&volume.path);
        if !users.is_empty() {
            return Err(Error::conflict(format!(
                "volume {} is in use by vm(s): {}",
                name,
                users.join(", ")
            )));
        }

        self.driver
            .volume_delete(pool, name)
            .map_err(|e| DriverOp::VolumeDelete.fail(e))?;
        self.registry.update_pool(&slot, &guard, |record| {
            record.volumes.retain(|v| v.name != name);
            Ok(())
        })?;
        tracing::info!(pool = %pool, volume = %name, "volume deleted");
        Ok(())
    }

    /// Resolve a volume path to its volume.
    pub fn resolve_volume(&self, path: &str) -> Result<Volume> {
        self.registry
            .find_volume(path)
            .map(|(_, volume)| volume)
            .ok_or_else(|| Error::not_found("volume", path))
    }
}
