//! Fast-Boot Restorer (SPEC_FULL.md §4.H).
//!
//! Restores a VM from a base image's warmup snapshot: creates the new VM's
//! own overlay backed by the snapshot's disk (an O(1) metadata operation,
//! same as a cold-boot overlay), copies `state.json` and `memory-ranges-*`
//! alongside a rewritten `config.json` carrying the new VM's TAP device,
//! MAC address, and socket paths, starts the monitor with `--restore`
//! pointed at that directory, resumes the restored (paused) VM, and asks
//! the guest agent over vsock to re-lease its network identity. Rewriting
//! `config.json` rather than the snapshot's is what makes two VMs able to
//! restore from the same snapshot concurrently without fighting over
//! identity.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::capabilities::Qcow2Tool;
use crate::config::OrchestratorConfig;
use crate::control_client::ControlClient;
use crate::disk::DiskManager;
use crate::error::{CoreError, Result};
use crate::record::{BaseImage, VmRecord, warmup_snapshot_is_complete};
use crate::supervisor::{SpawnRequest, Supervisor};
use crate::vsock::VsockClient;

pub struct RestoreOutcome {
    pub pid: u32,
    /// The guest's IPv4 address after `RECONFIGURE_NETWORK`, when the VM
    /// has a TAP identity to reconfigure.
    pub guest_ip: Option<String>,
}

pub struct RestoreEngine<'a> {
    config: &'a OrchestratorConfig,
    qcow2_tool: &'a dyn Qcow2Tool,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(config: &'a OrchestratorConfig, qcow2_tool: &'a dyn Qcow2Tool) -> Self {
        Self { config, qcow2_tool }
    }

    /// Restore `record` from `base_image`'s warmup snapshot into
    /// `record`'s own VM directory, and start its monitor process.
    /// Re-running this for the same `record.id` is safe: every artifact is
    /// regenerated from the snapshot and the record's current identity, so
    /// the result does not depend on what (if anything) was there before.
    pub async fn restore(&self, record: &VmRecord, base_image: &BaseImage) -> Result<RestoreOutcome> {
        let snapshot_dir = base_image.warmup_snapshot_dir();
        if !warmup_snapshot_is_complete(&snapshot_dir) {
            return Err(CoreError::Precondition {
                id: record.id.clone(),
                expected: "base image has a complete warmup snapshot",
                actual: "snapshot missing or incomplete".to_string(),
            });
        }

        let vm_dir = self.config.vm_dir(&record.id);
        std::fs::create_dir_all(&vm_dir)?;

        let restore_dir = vm_dir.join("restore");
        if restore_dir.exists() {
            std::fs::remove_dir_all(&restore_dir)?;
        }
        std::fs::create_dir_all(&restore_dir)?;

        std::fs::copy(snapshot_dir.join("state.json"), restore_dir.join("state.json"))?;
        for memory_range in crate::record::memory_range_files(&snapshot_dir) {
            let file_name = memory_range
                .file_name()
                .expect("memory range path always has a file name");
            std::fs::copy(&memory_range, restore_dir.join(file_name))?;
        }

        // The disk lives at the canonical per-VM path, not inside the
        // restore staging directory, same as a cold-boot overlay: an
        // overlay backed by the snapshot's disk, not a copy of it, so
        // restoring stays O(1) regardless of the snapshot's size.
        let overlay_path = crate::disk::overlay_path_for(&vm_dir);
        let disk_manager = DiskManager::new(self.qcow2_tool);
        disk_manager
            .create_overlay(&snapshot_dir.join("disk.qcow2"), &overlay_path)
            .await?;

        let api_socket_path = vm_dir.join("api.sock");
        let vsock_uds_path = vm_dir.join("vsock.sock");
        let raw_config = std::fs::read_to_string(snapshot_dir.join("config.json"))?;
        let mut config_json: Value = serde_json::from_str(&raw_config)?;
        patch_config_for_new_identity(&mut config_json, record, &overlay_path, &vsock_uds_path);
        std::fs::write(
            restore_dir.join("config.json"),
            serde_json::to_vec_pretty(&config_json)?,
        )?;

        let pid = Supervisor::spawn(SpawnRequest {
            binary: &self.config.hypervisor_binary,
            args: vec![
                "--api-socket".to_string(),
                api_socket_path.display().to_string(),
                "--restore".to_string(),
                format!("source_url=file://{}", restore_dir.display()),
            ],
            working_dir: &vm_dir,
            log_path: &vm_dir.join("monitor.log"),
            kvm_group: None,
        })
        .await?;

        let control_client = ControlClient::new(api_socket_path);
        control_client
            .wait_for_socket(self.config.timeouts.api_socket_snapshot)
            .await?;

        // A restored VM comes up paused (it is, after all, a resumed
        // snapshot); bring it to running before handing it back.
        control_client.resume().await?;

        // The snapshot carries the template VM's network identity; the
        // restored VM has its own TAP/MAC, so the guest agent needs to
        // re-lease (or re-apply) its address before the VM is usable.
        let vsock_client = VsockClient::new(&vsock_uds_path);
        let guest_ip = if record.network.tap_device.is_some() {
            Some(
                vsock_client
                    .reconfigure_network(&self.config.timeouts)
                    .await?,
            )
        } else {
            None
        };

        info!(vm_id = %record.id, base_image = %base_image.name, pid, "restored vm from warmup snapshot");
        Ok(RestoreOutcome { pid, guest_ip })
    }
}

fn patch_config_for_new_identity(
    config_json: &mut Value,
    record: &VmRecord,
    disk_path: &Path,
    vsock_uds_path: &Path,
) {
    if let Some(disks) = config_json.get_mut("disks").and_then(Value::as_array_mut) {
        if let Some(first) = disks.first_mut() {
            first["path"] = Value::String(disk_path.display().to_string());
        }
    }
    if let Some(net) = config_json.get_mut("net").and_then(Value::as_array_mut) {
        if let Some(first) = net.first_mut() {
            first["mac"] = Value::String(record.network.mac.clone());
            if let Some(tap) = &record.network.tap_device {
                first["tap"] = Value::String(tap.clone());
            }
        }
    }
    if let Some(vsock) = config_json.get_mut("vsock") {
        vsock["socket"] = Value::String(vsock_uds_path.display().to_string());
    }
}

pub fn restore_dir_for(vm_dir: &Path) -> PathBuf {
    vm_dir.join("restore")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_rewrites_disk_net_and_vsock() {
        let mut config_json = serde_json::json!({
            "disks": [{"path": "/old/disk.qcow2"}],
            "net": [{"mac": "52:54:00:00:00:aa", "tap": "vmtap-old"}],
            "vsock": {"socket": "/old/vsock.sock"},
        });
        let record = crate::record::VmRecord {
            id: "vm-1".to_string(),
            name: "restored".to_string(),
            status: crate::record::VmStatus::Creating,
            base_image: "focal".to_string(),
            resources: crate::record::Resources {
                vcpus: 1,
                memory_mib: 512,
                disk_gib: 4,
            },
            network: crate::record::NetworkConfig {
                mode: crate::record::NetworkMode::Tap,
                tap_device: Some("vmtap5".to_string()),
                bridge: Some("vmbr0".to_string()),
                mac: "52:54:00:00:00:05".to_string(),
                guest_ip: Some("192.168.100.15".to_string()),
                gateway: Some("192.168.100.1".to_string()),
            },
            ssh_forward_port: None,
            port_mappings: vec![],
            volumes: vec![],
            pid: None,
            api_socket_path: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            extra: std::collections::HashMap::new(),
        };
        patch_config_for_new_identity(
            &mut config_json,
            &record,
            Path::new("/new/disk.qcow2"),
            Path::new("/new/vsock.sock"),
        );
        assert_eq!(config_json["disks"][0]["path"], "/new/disk.qcow2");
        assert_eq!(config_json["net"][0]["mac"], "52:54:00:00:00:05");
        assert_eq!(config_json["net"][0]["tap"], "vmtap5");
        assert_eq!(config_json["vsock"]["socket"], "/new/vsock.sock");
    }

    #[tokio::test]
    async fn restore_rejects_incomplete_snapshot() {
        use async_trait::async_trait;

        struct UnusedQcow2Tool;
        #[async_trait]
        impl Qcow2Tool for UnusedQcow2Tool {
            async fn create(&self, _: &Path, _: Option<&Path>, _: u32) -> Result<()> {
                unreachable!("snapshot is incomplete, create() should not be reached")
            }
            async fn virtual_size_gib(&self, _: &Path) -> Result<u32> {
                unreachable!()
            }
            async fn resize(&self, _: &Path, _: u32) -> Result<()> {
                unreachable!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            data_dir: dir.path().join("vms"),
            base_images_dir: dir.path().join("base-images"),
            ssh_keys_dir: dir.path().join("ssh-keys"),
            hypervisor_binary: PathBuf::from("/bin/true"),
            qcow2_tool: PathBuf::from("/bin/true"),
            iso_tool: PathBuf::from("/bin/true"),
            ssh_port_range: (20000, 20010),
            timeouts: Default::default(),
            boot_markers: OrchestratorConfig::default_boot_markers(),
        };
        let base_image = BaseImage::new(&config.base_images_dir, "focal");
        std::fs::create_dir_all(base_image.warmup_snapshot_dir()).unwrap();

        let tool = UnusedQcow2Tool;
        let engine = RestoreEngine::new(&config, &tool);
        let record = crate::record::VmRecord {
            id: "vm-1".to_string(),
            name: "vm-1".to_string(),
            status: crate::record::VmStatus::Creating,
            base_image: "focal".to_string(),
            resources: crate::record::Resources {
                vcpus: 1,
                memory_mib: 512,
                disk_gib: 4,
            },
            network: crate::record::NetworkConfig {
                mode: crate::record::NetworkMode::None,
                tap_device: None,
                bridge: None,
                mac: "52:54:00:00:00:01".to_string(),
                guest_ip: None,
                gateway: None,
            },
            ssh_forward_port: None,
            port_mappings: vec![],
            volumes: vec![],
            pid: None,
            api_socket_path: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            extra: std::collections::HashMap::new(),
        };

        let err = engine.restore(&record, &base_image).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);
    }
}
