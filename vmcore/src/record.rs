//! VmRecord and related data-model types (SPEC_FULL.md §3).

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved prefix for warmup template VM names. Per Design Notes §9, only
/// the name prefix is authoritative for filtering warmup VMs out of public
/// listings — an id-prefix check is not trustworthy upstream and is not
/// replicated here.
pub const WARMUP_NAME_PREFIX: &str = "warmup-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Creating,
    Booting,
    Running,
    Paused,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Tap,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub vcpus: u8,
    pub memory_mib: u32,
    pub disk_gib: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub guest_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// One per VM, the unit of persistence (SPEC_FULL.md §3).
///
/// Deliberately permissive on deserialize: unknown fields are dropped rather
/// than rejected (`serde`'s default behavior for structs) so a state file
/// written by a newer orchestrator version still loads, per the "forward
/// compatible" requirement in §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub status: VmStatus,
    pub base_image: String,
    pub resources: Resources,
    pub network: NetworkConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_forward_port: Option<u16>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_socket_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Unrecognized fields from a newer orchestrator version, preserved
    /// verbatim so a round-trip through this version doesn't drop them.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl VmRecord {
    pub fn is_warmup(&self) -> bool {
        self.name.starts_with(WARMUP_NAME_PREFIX)
    }

    /// Invariant (I2): `pid` is set iff `status` is one of these three.
    pub fn should_have_pid(&self) -> bool {
        matches!(
            self.status,
            VmStatus::Booting | VmStatus::Running | VmStatus::Paused
        )
    }
}

/// Directory of immutable artifacts per base-image name (SPEC_FULL.md §3).
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub name: String,
    pub dir: PathBuf,
}

impl BaseImage {
    pub fn new(base_images_dir: &std::path::Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: base_images_dir.join(name),
        }
    }

    pub fn qcow2_path(&self) -> PathBuf {
        self.dir.join("image.qcow2")
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.dir.join("kernel")
    }

    pub fn initrd_path(&self) -> PathBuf {
        self.dir.join("initrd")
    }

    pub fn warmup_snapshot_dir(&self) -> PathBuf {
        self.dir.join("warmup-snapshot")
    }

    pub fn has_firmware_only_boot(&self) -> bool {
        !self.kernel_path().exists()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotDescriptorPaths {
    pub config_json: PathBuf,
    pub state_json: PathBuf,
    pub memory_range_files: Vec<PathBuf>,
    pub disk_qcow2: Option<PathBuf>,
}

/// A warmup snapshot is complete iff all four artifact kinds exist
/// (SPEC_FULL.md §4.G, testable property 5).
pub fn warmup_snapshot_is_complete(dir: &std::path::Path) -> bool {
    let config = dir.join("config.json");
    let state = dir.join("state.json");
    let disk = dir.join("disk.qcow2");
    if !(config.is_file() && state.is_file() && disk.is_file()) {
        return false;
    }
    memory_range_files(dir).next().is_some()
}

pub fn memory_range_files(dir: &std::path::Path) -> impl Iterator<Item = PathBuf> + '_ {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("memory-ranges-"))
                .unwrap_or(false)
        })
}
