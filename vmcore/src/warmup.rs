//! Warmup Engine (SPEC_FULL.md §4.G).
//!
//! Boots a throwaway VM from a base image, waits for it to reach a boot
//! marker, pauses it, and snapshots it to `base_image.warmup_snapshot_dir()`
//! so later cold starts of that base image can instead restore from the
//! snapshot (see [`crate::restore`]). Grounded on the snapshot workflow in
//! the pack's `crates-sandbox-fc` example, which runs the same
//! boot-then-pause-then-snapshot sequence with the same vsock-before-start
//! ordering caveat.
//!
//! The throwaway VM's own record is persisted to the store like any other
//! VM's, so a crash mid-warmup leaves something `reconcile_on_startup` (and
//! its base-image-directory orphan sweep) can find and clean up rather than
//! an invisible monitor process and an orphaned disk.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::capabilities::{IsoBuilder, Qcow2Tool};
use crate::cloudinit::CloudInitBuilder;
use crate::config::{OrchestratorConfig, Timeouts};
use crate::control_client::ControlClient;
use crate::disk::DiskManager;
use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};
use crate::record::{
    BaseImage, NetworkConfig, NetworkMode, PortMapping, Resources, VmRecord, VmStatus,
    WARMUP_NAME_PREFIX,
};
use crate::store::Store;
use crate::supervisor::{SpawnRequest, Supervisor};
use crate::argv::build_cold_boot_argv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupPhase {
    Idle,
    Starting,
    Booting,
    WaitingForBoot,
    Pausing,
    Snapshotting,
    Complete,
    Error,
}

impl WarmupPhase {
    fn label(&self) -> &'static str {
        match self {
            WarmupPhase::Idle => "idle",
            WarmupPhase::Starting => "starting",
            WarmupPhase::Booting => "booting",
            WarmupPhase::WaitingForBoot => "waiting_for_boot",
            WarmupPhase::Pausing => "pausing",
            WarmupPhase::Snapshotting => "snapshotting",
            WarmupPhase::Complete => "complete",
            WarmupPhase::Error => "error",
        }
    }
}

pub struct WarmupEngine<'a> {
    config: &'a OrchestratorConfig,
    qcow2_tool: &'a dyn Qcow2Tool,
    iso_builder: &'a dyn IsoBuilder,
    events: &'a EventBus,
    store: &'a Store,
}

impl<'a> WarmupEngine<'a> {
    pub fn new(
        config: &'a OrchestratorConfig,
        qcow2_tool: &'a dyn Qcow2Tool,
        iso_builder: &'a dyn IsoBuilder,
        events: &'a EventBus,
        store: &'a Store,
    ) -> Self {
        Self {
            config,
            qcow2_tool,
            iso_builder,
            events,
            store,
        }
    }

    fn emit(&self, base_image: &str, phase: WarmupPhase) {
        self.events.publish(Event::Warmup {
            base_image: base_image.to_string(),
            phase: phase.label().to_string(),
        });
    }

    /// Terminate and remove whatever a previous, possibly-interrupted
    /// warmup run for `base_image_name` left behind. There is only ever one
    /// warmup record per base image at a time: the work directory is shared
    /// (`base_image.dir/warmup-work`), so a new attempt must claim it clean.
    async fn cleanup_prior_attempt(&self, base_image_name: &str) -> Result<()> {
        let expected_name = format!("{WARMUP_NAME_PREFIX}{base_image_name}");
        let Some(prior) = self.store.get_by_name(&expected_name) else {
            return Ok(());
        };
        warn!(vm_id = %prior.id, base_image = base_image_name, "cleaning up prior warmup attempt before starting a new one");
        if let Some(pid) = prior.pid {
            if Supervisor::is_alive(pid) {
                let _ = Supervisor::terminate(pid, &self.config.timeouts).await;
            }
        }
        self.store.remove(&prior.id)?;
        Ok(())
    }

    /// Run the full warmup workflow for `base_image_name`. On success the
    /// base image's `warmup-snapshot/` directory holds a complete snapshot
    /// (see [`crate::record::warmup_snapshot_is_complete`]).
    pub async fn run(&self, base_image_name: &str, ssh_public_key: &str) -> Result<()> {
        let base_image = BaseImage::new(&self.config.base_images_dir, base_image_name);
        if !base_image.qcow2_path().is_file() {
            return Err(CoreError::BaseImageNotFound(base_image_name.to_string()));
        }

        self.cleanup_prior_attempt(base_image_name).await?;

        self.emit(base_image_name, WarmupPhase::Starting);
        let record = warmup_record(base_image_name);
        let vm_dir = base_image.dir.join("warmup-work");
        std::fs::create_dir_all(&vm_dir)?;
        self.store.put(record.clone())?;

        let outcome = self
            .run_attempt(base_image_name, &base_image, &record, &vm_dir, ssh_public_key)
            .await;

        let _ = self.store.remove(&record.id);
        if vm_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&vm_dir) {
                warn!(error = %e, path = ?vm_dir, "failed to remove warmup work directory");
            }
        }

        match &outcome {
            Ok(()) => {
                self.emit(base_image_name, WarmupPhase::Complete);
                info!(base_image = base_image_name, "warmup snapshot complete");
            }
            Err(e) => {
                warn!(base_image = base_image_name, error = %e, "warmup failed");
                self.emit(base_image_name, WarmupPhase::Error);
            }
        }
        outcome
    }

    async fn run_attempt(
        &self,
        base_image_name: &str,
        base_image: &BaseImage,
        record: &VmRecord,
        vm_dir: &Path,
        ssh_public_key: &str,
    ) -> Result<()> {
        let disk_manager = DiskManager::new(self.qcow2_tool);
        let overlay_path = vm_dir.join("disk.qcow2");
        disk_manager
            .create_overlay(&base_image.qcow2_path(), &overlay_path)
            .await?;

        let cloudinit_builder = CloudInitBuilder::new(self.iso_builder);
        let cloudinit_iso = cloudinit_builder.build(vm_dir, record, ssh_public_key).await?;

        let api_socket_path = vm_dir.join("api.sock");
        let vsock_uds_path = vm_dir.join("vsock.sock");
        let args = build_cold_boot_argv(
            record,
            base_image,
            &overlay_path,
            &cloudinit_iso,
            &api_socket_path,
            &vsock_uds_path,
        );

        self.emit(base_image_name, WarmupPhase::Booting);
        // The vsock UDS must exist before the monitor starts, or the
        // monitor fails to bind it — create the parent dir now; the
        // monitor creates the socket file itself on spawn.
        let pid = Supervisor::spawn(SpawnRequest {
            binary: &self.config.hypervisor_binary,
            args,
            working_dir: vm_dir,
            log_path: &vm_dir.join("monitor.log"),
            kvm_group: None,
        })
        .await?;

        let control_client = ControlClient::new(api_socket_path.clone());
        control_client
            .wait_for_socket(self.config.timeouts.api_socket_normal)
            .await?;

        self.emit(base_image_name, WarmupPhase::WaitingForBoot);
        wait_for_boot_marker(
            &record.id,
            &vm_dir.join("console.log"),
            &self.config.boot_markers,
            self.config.timeouts.boot_marker,
        )
        .await?;

        self.emit(base_image_name, WarmupPhase::Pausing);
        control_client.pause().await?;

        self.emit(base_image_name, WarmupPhase::Snapshotting);
        let snapshot_dir = base_image.warmup_snapshot_dir();
        if snapshot_dir.exists() {
            std::fs::remove_dir_all(&snapshot_dir)?;
        }
        std::fs::create_dir_all(&snapshot_dir)?;
        control_client.snapshot(&snapshot_dir).await?;

        // The overlay that was live under the VM is now the disk captured
        // by the snapshot; move it in so restores don't need the monitor
        // to also serialize disk contents separately.
        let snapshot_disk = snapshot_dir.join("disk.qcow2");
        if !snapshot_disk.exists() {
            std::fs::copy(&overlay_path, &snapshot_disk)?;
        }

        let _ = control_client.shutdown_vmm().await;
        let _ = Supervisor::terminate(pid, &self.config.timeouts).await;

        if crate::record::warmup_snapshot_is_complete(&snapshot_dir) {
            Ok(())
        } else {
            Err(CoreError::DiskExhausted(
                "warmup snapshot missing required artifacts".to_string(),
            ))
        }
    }
}

fn warmup_record(base_image_name: &str) -> VmRecord {
    let id = format!("{WARMUP_NAME_PREFIX}{base_image_name}-{}", uuid::Uuid::new_v4());
    VmRecord {
        id: id.clone(),
        name: format!("{WARMUP_NAME_PREFIX}{base_image_name}"),
        status: VmStatus::Creating,
        base_image: base_image_name.to_string(),
        resources: Resources {
            vcpus: 1,
            memory_mib: 512,
            disk_gib: 4,
        },
        network: NetworkConfig {
            mode: NetworkMode::None,
            tap_device: None,
            bridge: None,
            mac: "52:54:00:00:ff:ff".to_string(),
            guest_ip: None,
            gateway: None,
        },
        ssh_forward_port: None,
        port_mappings: Vec::<PortMapping>::new(),
        volumes: vec![],
        pid: None,
        api_socket_path: None,
        created_at: chrono::Utc::now(),
        started_at: None,
        stopped_at: None,
        error: None,
        extra: std::collections::HashMap::new(),
    }
}

/// Tail `console_log` until a line case-insensitively contains one of
/// `markers`, or `timeout` elapses.
async fn wait_for_boot_marker(
    vm_id: &str,
    console_log: &Path,
    markers: &[String],
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let lowered_markers: Vec<String> = markers.iter().map(|m| m.to_lowercase()).collect();

    loop {
        if let Ok(file) = tokio::fs::File::open(console_log).await {
            let mut lines = BufReader::new(file).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let lowered = line.to_lowercase();
                if lowered_markers.iter().any(|m| lowered.contains(m.as_str())) {
                    return Ok(());
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(path = ?console_log, "boot marker not observed before timeout");
            return Err(CoreError::BootTimeout(vm_id.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

pub fn timeouts_default() -> Timeouts {
    Timeouts::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn test_config(dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig {
            data_dir: dir.join("vms"),
            base_images_dir: dir.join("base-images"),
            ssh_keys_dir: dir.join("ssh-keys"),
            hypervisor_binary: std::path::PathBuf::from("/bin/true"),
            qcow2_tool: std::path::PathBuf::from("/bin/true"),
            iso_tool: std::path::PathBuf::from("/bin/true"),
            ssh_port_range: (20000, 20010),
            timeouts: Timeouts::default(),
            boot_markers: OrchestratorConfig::default_boot_markers(),
        }
    }

    #[tokio::test]
    async fn missing_base_image_is_rejected_before_touching_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.base_images_dir).unwrap();

        let qcow2_tool = crate::capabilities::ExternalQcow2Tool {
            binary: config.qcow2_tool.clone(),
        };
        let iso_builder = crate::capabilities::ExternalIsoBuilder {
            binary: config.iso_tool.clone(),
        };
        let events = EventBus::new();
        let store = Store::new(config.data_dir.clone());

        let engine = WarmupEngine::new(&config, &qcow2_tool, &iso_builder, &events, &store);
        let err = engine.run("missing-image", "ssh-ed25519 AAAA").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn cleanup_prior_attempt_removes_stale_record_with_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Store::new(config.data_dir.clone());

        let mut stale = warmup_record("focal");
        stale.name = format!("{WARMUP_NAME_PREFIX}focal");
        stale.pid = Some(i32::MAX as u32); // never a live pid
        store.put(stale.clone()).unwrap();

        let qcow2_tool = crate::capabilities::ExternalQcow2Tool {
            binary: config.qcow2_tool.clone(),
        };
        let iso_builder = crate::capabilities::ExternalIsoBuilder {
            binary: config.iso_tool.clone(),
        };
        let events = EventBus::new();
        let engine = WarmupEngine::new(&config, &qcow2_tool, &iso_builder, &events, &store);

        engine.cleanup_prior_attempt("focal").await.unwrap();
        assert!(store.get(&stale.id).is_none());
    }
}
