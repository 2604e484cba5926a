//! Server configuration.
//!
//! Configuration is read from a TOML file (by default
//! `$XDG_CONFIG_HOME/vmdeck/config.toml`). A missing file yields the
//! defaults; command-line flags override individual values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "vmdeck";

/// Config file name inside the config directory.
const CONFIG_FILENAME: &str = "config.toml";

/// Database file name inside the data directory.
pub const DB_FILENAME: &str = "vmdeck.redb";

/// Which hypervisor driver to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-memory simulated hypervisor.
    #[default]
    Sim,
    /// libvirt via the `virsh` CLI.
    Virsh,
}

/// A storage pool to ensure exists at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSeed {
    /// Pool name.
    pub name: String,
    /// Capacity in GiB.
    pub capacity_gb: u64,
    /// Target directory (defaults to `<data_dir>/pools/<name>`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// vmdeck server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmdeckConfig {
    /// Address and port the HTTP API listens on.
    pub listen: String,

    /// Directory holding the database and default pool directories.
    pub data_dir: Option<PathBuf>,

    /// Hypervisor driver.
    pub driver: DriverKind,

    /// libvirt connection URI for the virsh driver.
    pub virsh_uri: Option<String>,

    /// How often the supervisor reconciles VM state with the driver.
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Timeout applied to mutating API requests.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Origins allowed by CORS.
    pub cors_origins: Vec<String>,

    /// Pools created at startup if missing.
    pub pools: Vec<PoolSeed>,
}

impl Default for VmdeckConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            data_dir: None,
            driver: DriverKind::Sim,
            virsh_uri: None,
            reconcile_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
                "http://localhost:8080".to_string(),
                "http://127.0.0.1:8080".to_string(),
            ],
            pools: Vec::new(),
        }
    }
}

impl VmdeckConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not determine config directory".into()))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from a file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text).map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Parse configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::ConfigLoad(e.to_string()))
    }

    /// Directory for the database and default pool storage.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| Error::Config("could not determine data directory".into()))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Path of the registry database.
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DB_FILENAME))
    }

    /// Default target directory for a pool.
    pub fn pool_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("pools").join(name))
    }
}

/// Serialize durations as humantime strings ("10s", "5m").
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VmdeckConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.driver, DriverKind::Sim);
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            listen = "0.0.0.0:9000"
            data_dir = "/var/lib/vmdeck"
            driver = "virsh"
            virsh_uri = "qemu:///system"
            reconcile_interval = "30s"
            request_timeout = "2m"
            cors_origins = ["https://dash.example.com"]

            [[pools]]
            name = "default"
            capacity_gb = 100
        "#;

        let config = VmdeckConfig::parse(text).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.driver, DriverKind::Virsh);
        assert_eq!(config.virsh_uri.as_deref(), Some("qemu:///system"));
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].capacity_gb, 100);
        assert_eq!(
            config.pool_path("default").unwrap(),
            PathBuf::from("/var/lib/vmdeck/pools/default")
        );
        assert_eq!(
            config.db_path().unwrap(),
            PathBuf::from("/var/lib/vmdeck").join(DB_FILENAME)
        );
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = VmdeckConfig::parse(r#"listen = "127.0.0.1:9999""#).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9999");
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert!(!config.cors_origins.is_empty());
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let err = VmdeckConfig::parse(r#"reconcile_interval = "soon""#).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let config = VmdeckConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back = VmdeckConfig::parse(&text).unwrap();
        assert_eq!(back.listen, config.listen);
        assert_eq!(back.reconcile_interval, config.reconcile_interval);
    }
}
