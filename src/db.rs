//! Durable storage for the resource registry.
//!
//! Each entity (a VM with its snapshots, a pool with its volumes, an image)
//! is stored as one JSON value in a redb table, so every write is a single
//! crash-consistent transaction per entity.

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::error::{Error, Result};
use crate::image::Image;
use crate::registry::VmRecord;
use crate::storage::PoolRecord;

const VMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");
const POOLS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");
const IMAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("images");

/// redb-backed registry store.
pub struct VmdeckDb {
    db: Database,
}

impl VmdeckDb {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(Error::database)?;

        // Create tables up front so read transactions never miss them.
        let tx = db.begin_write().map_err(Error::database)?;
        tx.open_table(VMS_TABLE).map_err(Error::database)?;
        tx.open_table(POOLS_TABLE).map_err(Error::database)?;
        tx.open_table(IMAGES_TABLE).map_err(Error::database)?;
        tx.commit().map_err(Error::database)?;

        tracing::debug!(path = %path.display(), "opened registry database");
        Ok(Self { db })
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(Error::database)?;
        let tx = self.db.begin_write().map_err(Error::database)?;
        {
            let mut table = tx.open_table(table).map_err(Error::database)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(Error::database)?;
        }
        tx.commit().map_err(Error::database)
    }

    fn delete(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<()> {
        let tx = self.db.begin_write().map_err(Error::database)?;
        {
            let mut table = tx.open_table(table).map_err(Error::database)?;
            table.remove(key).map_err(Error::database)?;
        }
        tx.commit().map_err(Error::database)
    }

    fn load_all<T: DeserializeOwned>(&self, table: TableDefinition<&str, &[u8]>) -> Result<Vec<T>> {
        let tx = self.db.begin_read().map_err(Error::database)?;
        let table = tx.open_table(table).map_err(Error::database)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(Error::database)? {
            let (key, value) = entry.map_err(Error::database)?;
            match serde_json::from_slice(value.value()) {
                Ok(v) => out.push(v),
                Err(e) => {
                    tracing::warn!(key = %key.value(), error = %e, "skipping unreadable record");
                }
            }
        }
        Ok(out)
    }

    /// Store a VM record (VM + snapshots).
    pub fn put_vm(&self, record: &VmRecord) -> Result<()> {
        self.put(VMS_TABLE, &record.vm.id.to_string(), record)
    }

    /// Remove a VM record.
    pub fn delete_vm(&self, id: &str) -> Result<()> {
        self.delete(VMS_TABLE, id)
    }

    /// Load every VM record.
    pub fn load_vms(&self) -> Result<Vec<VmRecord>> {
        self.load_all(VMS_TABLE)
    }

    /// Store a pool record (pool + volumes).
    pub fn put_pool(&self, record: &PoolRecord) -> Result<()> {
        self.put(POOLS_TABLE, &record.name, record)
    }

    /// Remove a pool record.
    pub fn delete_pool(&self, name: &str) -> Result<()> {
        self.delete(POOLS_TABLE, name)
    }

    /// Load every pool record.
    pub fn load_pools(&self) -> Result<Vec<PoolRecord>> {
        self.load_all(POOLS_TABLE)
    }

    /// Store an image.
    pub fn put_image(&self, image: &Image) -> Result<()> {
        self.put(IMAGES_TABLE, &image.id.to_string(), image)
    }

    /// Remove an image.
    pub fn delete_image(&self, id: &str) -> Result<()> {
        self.delete(IMAGES_TABLE, id)
    }

    /// Load every image.
    pub fn load_images(&self) -> Result<Vec<Image>> {
        self.load_all(IMAGES_TABLE)
    }
}
