//! VM configuration types.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::validate_name;

/// Maximum vCPUs accepted for a single VM.
pub const MAX_VCPUS: u32 = 256;

/// Default number of vCPUs for new VMs.
pub const DEFAULT_VCPUS: u32 = 1;

/// Default memory for new VMs (1 GiB).
pub const DEFAULT_MEMORY_KB: u64 = 1024 * 1024;

/// Unique identifier for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = String, format = Uuid)]
pub struct VmId(pub Uuid);

impl VmId {
    /// Generate a fresh random VmId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a VmId from its hyphenated UUID form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// VM resource configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Number of vCPUs.
    pub vcpus: u32,

    /// Current memory in KiB.
    pub memory_kb: u64,

    /// Maximum (balloon ceiling) memory in KiB.
    pub max_memory_kb: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            vcpus: DEFAULT_VCPUS,
            memory_kb: DEFAULT_MEMORY_KB,
            max_memory_kb: DEFAULT_MEMORY_KB,
        }
    }
}

impl Resources {
    /// Create resources with the given vCPUs and memory; max memory equals memory.
    pub fn new(vcpus: u32, memory_kb: u64) -> Self {
        Self {
            vcpus,
            memory_kb,
            max_memory_kb: memory_kb,
        }
    }

    /// Check the resource limits.
    pub fn validate(&self) -> Result<()> {
        if self.vcpus == 0 || self.vcpus > MAX_VCPUS {
            return Err(Error::validation(format!(
                "vcpus must be between 1 and {}, got {}",
                MAX_VCPUS, self.vcpus
            )));
        }
        if self.memory_kb == 0 {
            return Err(Error::validation("memory_kb must be greater than zero"));
        }
        if self.max_memory_kb < self.memory_kb {
            return Err(Error::validation(format!(
                "max_memory_kb ({}) must be at least memory_kb ({})",
                self.max_memory_kb, self.memory_kb
            )));
        }
        Ok(())
    }
}

/// Disk bus type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    /// Paravirtualized block device.
    #[default]
    Virtio,
    /// SATA controller.
    Sata,
    /// SCSI controller.
    Scsi,
    /// Legacy IDE controller.
    Ide,
}

impl DiskBus {
    /// Get the bus name as used in domain XML.
    pub fn name(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Sata => "sata",
            DiskBus::Scsi => "scsi",
            DiskBus::Ide => "ide",
        }
    }
}

impl std::fmt::Display for DiskBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DiskBus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "virtio" => Ok(DiskBus::Virtio),
            "sata" => Ok(DiskBus::Sata),
            "scsi" => Ok(DiskBus::Scsi),
            "ide" => Ok(DiskBus::Ide),
            other => Err(Error::validation(format!(
                "unknown disk bus '{}': expected virtio, sata, scsi or ide",
                other
            ))),
        }
    }
}

/// Network interface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    /// virtio-net.
    Virtio,
    /// Intel e1000 emulation.
    E1000,
    /// Realtek rtl8139 emulation.
    Rtl8139,
}

impl NicModel {
    /// Get the model name as used in domain XML.
    pub fn name(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::Rtl8139 => "rtl8139",
        }
    }
}

impl std::fmt::Display for NicModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NicModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "virtio" => Ok(NicModel::Virtio),
            "e1000" => Ok(NicModel::E1000),
            "rtl8139" => Ok(NicModel::Rtl8139),
            other => Err(Error::validation(format!(
                "unknown network model '{}': expected virtio, e1000 or rtl8139",
                other
            ))),
        }
    }
}

/// Everything needed to define a new VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// Unique VM name.
    pub name: String,
    /// Resource configuration.
    pub resources: Resources,
}

impl VmSpec {
    /// Create a new builder for VmSpec.
    pub fn builder(name: impl Into<String>) -> VmSpecBuilder {
        VmSpecBuilder::new(name)
    }

    /// Validate name and resources.
    pub fn validate(&self) -> Result<()> {
        validate_name("vm", &self.name)?;
        self.resources.validate()
    }
}

/// Builder for VmSpec.
pub struct VmSpecBuilder {
    name: String,
    vcpus: u32,
    memory_kb: u64,
    max_memory_kb: Option<u64>,
}

impl VmSpecBuilder {
    /// Create a new builder with default resources.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vcpus: DEFAULT_VCPUS,
            memory_kb: DEFAULT_MEMORY_KB,
            max_memory_kb: None,
        }
    }

    /// Set number of vCPUs.
    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Set memory in KiB.
    pub fn memory_kb(mut self, kb: u64) -> Self {
        self.memory_kb = kb;
        self
    }

    /// Set maximum memory in KiB (defaults to memory).
    pub fn max_memory_kb(mut self, kb: u64) -> Self {
        self.max_memory_kb = Some(kb);
        self
    }

    /// Build the VmSpec.
    pub fn build(self) -> VmSpec {
        VmSpec {
            name: self.name,
            resources: Resources {
                vcpus: self.vcpus,
                memory_kb: self.memory_kb,
                max_memory_kb: self.max_memory_kb.unwrap_or(self.memory_kb),
            },
        }
    }
}
