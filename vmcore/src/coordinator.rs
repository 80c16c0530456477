//! Lifecycle Coordinator (SPEC_FULL.md §4.J).
//!
//! The entry point every client-facing operation goes through. Operations
//! on different VMs run concurrently; operations on the same VM are
//! serialized by a per-VM lock, so e.g. a `stop_vm` and a `delete_vm` for
//! the same id can never interleave. Resource pools (TAP, MAC, SSH port)
//! each have their own coarse lock and are never held across an `.await`
//! that touches another pool.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capabilities::{IsoBuilder, ProcessEnumerator, Qcow2Tool, ReachabilityProbe};
use crate::cloudinit::CloudInitBuilder;
use crate::config::OrchestratorConfig;
use crate::control_client::ControlClient;
use crate::disk::DiskManager;
use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};
use crate::pools::{MacPool, SshPortPool, TapPool};
use crate::record::{
    BaseImage, NetworkConfig, NetworkMode, PortMapping, Resources, VmRecord, VmStatus,
};
use crate::restore::RestoreEngine;
use crate::store::Store;
use crate::supervisor::{SpawnRequest, Supervisor};
use crate::argv::build_cold_boot_argv;

/// Client-supplied parameters for creating a VM (SPEC_FULL.md §3).
pub struct CreateVmRequest {
    pub name: String,
    pub base_image: String,
    pub resources: Resources,
    pub network_mode: NetworkMode,
    pub port_mappings: Vec<PortMapping>,
    /// Start the VM as part of creation (SPEC_FULL.md §4.J, scenarios
    /// 1-3). Requires `ssh_public_key` to be meaningful the same way a
    /// separate `start_vm` call would.
    pub auto_start: bool,
    pub ssh_public_key: String,
}

pub struct Coordinator {
    config: OrchestratorConfig,
    store: Store,
    ssh_port_pool: SshPortPool,
    tap_pool: TapPool,
    events: EventBus,
    qcow2_tool: Arc<dyn Qcow2Tool>,
    iso_builder: Arc<dyn IsoBuilder>,
    process_enumerator: Arc<dyn ProcessEnumerator>,
    reachability: Option<Arc<dyn ReachabilityProbe>>,
    vm_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Coordinator {
    pub fn new(
        config: OrchestratorConfig,
        tap_pool: TapPool,
        qcow2_tool: Arc<dyn Qcow2Tool>,
        iso_builder: Arc<dyn IsoBuilder>,
        process_enumerator: Arc<dyn ProcessEnumerator>,
        reachability: Option<Arc<dyn ReachabilityProbe>>,
    ) -> Self {
        let store = Store::new(config.data_dir.clone());
        let ssh_port_pool = SshPortPool::new(config.ssh_port_range);
        Self {
            config,
            store,
            ssh_port_pool,
            tap_pool,
            events: EventBus::new(),
            qcow2_tool,
            iso_builder,
            process_enumerator,
            reachability,
            vm_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn lock_for(&self, vm_id: &str) -> Arc<AsyncMutex<()>> {
        self.vm_locks
            .lock()
            .expect("vm lock map poisoned")
            .entry(vm_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Load every VM's `state.json` and reconcile against the live process
    /// table: any monitor process the supervisor left behind for a VM id
    /// that's no longer on record is terminated, matching the restart-safe
    /// invariant in SPEC_FULL.md §4.C. Runs the sweep twice, once against
    /// ordinary per-VM directories and once against the base-images
    /// directory, since a warmup VM's working directory lives there instead
    /// (SPEC_FULL.md §4.C step 2).
    pub async fn reconcile_on_startup(&self) -> Result<()> {
        let count = self.store.reload()?;
        info!(count, "loaded vm records on startup");

        let known_ids: Vec<String> = self.store.list().into_iter().map(|r| r.id).collect();
        let orphans = Supervisor::find_orphans(
            self.process_enumerator.as_ref(),
            &self.config.data_dir,
            &known_ids,
        )?;
        for (pid, vm_id) in orphans {
            warn!(pid, vm_id, "terminating orphaned monitor process");
            let _ = Supervisor::terminate(pid, &self.config.timeouts).await;
        }

        let known_base_images: Vec<String> = self
            .store
            .list()
            .into_iter()
            .filter(VmRecord::is_warmup)
            .map(|r| r.base_image)
            .collect();
        let warmup_orphans = Supervisor::find_orphans(
            self.process_enumerator.as_ref(),
            &self.config.base_images_dir,
            &known_base_images,
        )?;
        for (pid, base_image) in warmup_orphans {
            warn!(pid, base_image, "terminating orphaned warmup monitor process");
            let _ = Supervisor::terminate(pid, &self.config.timeouts).await;
        }

        for record in self.store.list() {
            if record.should_have_pid() {
                match record.pid {
                    Some(pid) if Supervisor::is_alive(pid) => {}
                    _ => {
                        warn!(vm_id = %record.id, "record expected a live monitor but none was found, marking stopped");
                        let mut updated = record;
                        updated.status = VmStatus::Stopped;
                        updated.pid = None;
                        self.store.put(updated)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn create_vm(&self, req: CreateVmRequest) -> Result<VmRecord> {
        if self.store.name_taken(&req.name) {
            return Err(CoreError::NameConflict(req.name));
        }
        let base_image = BaseImage::new(&self.config.base_images_dir, &req.base_image);
        if !base_image.qcow2_path().is_file() {
            return Err(CoreError::BaseImageNotFound(req.base_image));
        }

        let id = Uuid::new_v4().to_string();
        let guard = self.lock_for(&id).lock_owned().await;

        let mac = MacPool::allocate(&self.store.all_macs())?;
        let network = match req.network_mode {
            NetworkMode::None => NetworkConfig {
                mode: NetworkMode::None,
                tap_device: None,
                bridge: None,
                mac,
                guest_ip: None,
                gateway: None,
            },
            NetworkMode::Tap => {
                let tap_device = match self.tap_pool.allocate(&id) {
                    Ok(tap) => tap,
                    Err(e) => return Err(e),
                };
                NetworkConfig {
                    mode: NetworkMode::Tap,
                    tap_device: Some(tap_device),
                    bridge: self.tap_pool.bridge().map(|s| s.to_string()),
                    mac,
                    guest_ip: None,
                    gateway: self.tap_pool.gateway().map(|s| s.to_string()),
                }
            }
        };

        let ssh_forward_port = match self.ssh_port_pool.allocate() {
            Ok(port) => Some(port),
            Err(_) => {
                self.tap_pool.release(&id);
                return Err(CoreError::SshPortExhausted);
            }
        };

        let record = VmRecord {
            id: id.clone(),
            name: req.name,
            status: VmStatus::Creating,
            base_image: req.base_image,
            resources: req.resources,
            network,
            ssh_forward_port,
            port_mappings: req.port_mappings,
            volumes: vec![],
            pid: None,
            api_socket_path: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            extra: HashMap::new(),
        };
        self.store.put(record.clone())?;
        self.events.publish(Event::Created { vm_id: id.clone() });

        if !req.auto_start {
            return Ok(record);
        }
        self.start_vm_locked(&id, &req.ssh_public_key, guard).await
    }

    pub async fn start_vm(&self, vm_id: &str, ssh_public_key: &str) -> Result<VmRecord> {
        let lock = self.lock_for(vm_id);
        let guard = lock.lock_owned().await;
        self.start_vm_locked(vm_id, ssh_public_key, guard).await
    }

    async fn start_vm_locked(
        &self,
        vm_id: &str,
        ssh_public_key: &str,
        _guard: OwnedMutexGuard<()>,
    ) -> Result<VmRecord> {
        let mut record = self.store.require(vm_id)?;
        if matches!(record.status, VmStatus::Running | VmStatus::Booting) {
            return Ok(record);
        }

        let base_image = BaseImage::new(&self.config.base_images_dir, &record.base_image);
        let vm_dir = self.config.vm_dir(vm_id);
        std::fs::create_dir_all(&vm_dir)?;

        // A VM only fast-boots from the base image's warmup snapshot the
        // first time it starts. A second start (e.g. after `stop_vm`) must
        // cold-boot its own already-provisioned disk instead of restoring
        // from the snapshot again, which would discard whatever the guest
        // wrote since its first boot (SPEC_FULL.md §4.J scenario 4).
        let snapshot_dir = base_image.warmup_snapshot_dir();
        let never_started = record.started_at.is_none();
        let pid = if never_started && crate::record::warmup_snapshot_is_complete(&snapshot_dir) {
            let restore_engine = RestoreEngine::new(&self.config, self.qcow2_tool.as_ref());
            let outcome = restore_engine.restore(&record, &base_image).await?;
            if let Some(guest_ip) = outcome.guest_ip {
                record.network.guest_ip = Some(guest_ip);
            }
            outcome.pid
        } else {
            self.cold_boot(&record, &base_image, &vm_dir, ssh_public_key).await?
        };

        record.pid = Some(pid);
        record.status = VmStatus::Booting;
        record.started_at = Some(chrono::Utc::now());
        record.api_socket_path = Some(vm_dir.join("api.sock"));
        self.store.put(record.clone())?;
        self.events.publish(Event::Booting {
            vm_id: vm_id.to_string(),
        });

        if let Some(probe) = &self.reachability {
            let addr = self.reachability_addr(&record);
            if let Some(addr) = addr {
                let reachable = self.poll_reachability(probe.as_ref(), addr).await;
                if !reachable {
                    record.status = VmStatus::Error;
                    record.error = Some("vm did not become reachable within timeout".to_string());
                    self.store.put(record.clone())?;
                    self.events.publish(Event::Error {
                        vm_id: vm_id.to_string(),
                        message: record.error.clone().unwrap_or_default(),
                    });
                    return Err(CoreError::ReachabilityTimeout(vm_id.to_string()));
                }
            }
        }

        record.status = VmStatus::Running;
        self.store.put(record.clone())?;
        self.events.publish(Event::Started {
            vm_id: vm_id.to_string(),
        });
        Ok(record)
    }

    /// The address to probe to decide a VM has come up. A TAP-networked VM
    /// with a known guest IP is probed directly on its guest address — the
    /// SSH-forward port is a host-side NAT artifact and answering on it
    /// doesn't prove the guest is reachable over its actual network path.
    /// Everything else falls back to the host-local SSH-forward port.
    fn reachability_addr(&self, record: &VmRecord) -> Option<SocketAddr> {
        if record.network.mode == NetworkMode::Tap {
            if let Some(guest_ip) = &record.network.guest_ip {
                if let Ok(ip) = guest_ip.parse::<Ipv4Addr>() {
                    return Some(SocketAddr::new(IpAddr::V4(ip), 22));
                }
            }
        }
        record
            .ssh_forward_port
            .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    async fn cold_boot(
        &self,
        record: &VmRecord,
        base_image: &BaseImage,
        vm_dir: &std::path::Path,
        ssh_public_key: &str,
    ) -> Result<u32> {
        let disk_manager = DiskManager::new(self.qcow2_tool.as_ref());
        let overlay_path = crate::disk::overlay_path_for(vm_dir);
        // A second cold boot of the same VM (e.g. after `stop_vm`) reuses
        // the disk it already provisioned rather than re-deriving a fresh
        // overlay from the base image, which would discard anything the
        // guest wrote on its first boot.
        if !overlay_path.is_file() {
            disk_manager
                .create_overlay(&base_image.qcow2_path(), &overlay_path)
                .await?;
        }
        disk_manager
            .ensure_minimum_size(&overlay_path, record.resources.disk_gib)
            .await?;

        let cloudinit_builder = CloudInitBuilder::new(self.iso_builder.as_ref());
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

        let pid = Supervisor::spawn(SpawnRequest {
            binary: &self.config.hypervisor_binary,
            args,
            working_dir: vm_dir,
            log_path: &vm_dir.join("monitor.log"),
            kvm_group: None,
        })
        .await?;

        let control_client = ControlClient::new(api_socket_path);
        control_client
            .wait_for_socket(self.config.timeouts.api_socket_normal)
            .await?;
        Ok(pid)
    }

    async fn poll_reachability(&self, probe: &dyn ReachabilityProbe, addr: SocketAddr) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.timeouts.reachability;
        loop {
            if probe
                .probe(addr, self.config.timeouts.reachability_poll)
                .await
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.timeouts.reachability_poll).await;
        }
    }

    pub async fn pause_vm(&self, vm_id: &str) -> Result<VmRecord> {
        let lock = self.lock_for(vm_id);
        let _guard = lock.lock().await;
        let mut record = self.store.require(vm_id)?;
        if record.status != VmStatus::Running {
            return Err(CoreError::Precondition {
                id: vm_id.to_string(),
                expected: "running",
                actual: format!("{:?}", record.status),
            });
        }
        let api_socket_path = record
            .api_socket_path
            .clone()
            .ok_or_else(|| CoreError::Precondition {
                id: vm_id.to_string(),
                expected: "has an api socket",
                actual: "none recorded".to_string(),
            })?;
        ControlClient::new(api_socket_path).pause().await?;
        record.status = VmStatus::Paused;
        self.store.put(record.clone())?;
        self.events.publish(Event::Paused {
            vm_id: vm_id.to_string(),
        });
        Ok(record)
    }

    pub async fn resume_vm(&self, vm_id: &str) -> Result<VmRecord> {
        let lock = self.lock_for(vm_id);
        let _guard = lock.lock().await;
        let mut record = self.store.require(vm_id)?;
        if record.status != VmStatus::Paused {
            return Err(CoreError::Precondition {
                id: vm_id.to_string(),
                expected: "paused",
                actual: format!("{:?}", record.status),
            });
        }
        let api_socket_path = record
            .api_socket_path
            .clone()
            .ok_or_else(|| CoreError::Precondition {
                id: vm_id.to_string(),
                expected: "has an api socket",
                actual: "none recorded".to_string(),
            })?;
        ControlClient::new(api_socket_path).resume().await?;
        record.status = VmStatus::Running;
        self.store.put(record.clone())?;
        self.events.publish(Event::Resumed {
            vm_id: vm_id.to_string(),
        });
        Ok(record)
    }

    pub async fn stop_vm(&self, vm_id: &str) -> Result<VmRecord> {
        let lock = self.lock_for(vm_id);
        let _guard = lock.lock().await;
        self.stop_vm_locked(vm_id).await
    }

    /// Body of `stop_vm`, split out so [`Coordinator::delete_vm`] can call it
    /// while already holding the per-VM lock instead of releasing and
    /// re-acquiring it — releasing mid-operation would open a window for a
    /// concurrent `create_vm`/`start_vm` on the same id to interleave with
    /// the rest of delete (SPEC_FULL.md §5).
    async fn stop_vm_locked(&self, vm_id: &str) -> Result<VmRecord> {
        let mut record = self.store.require(vm_id)?;
        if record.status == VmStatus::Stopped {
            return Ok(record);
        }

        if let Some(api_socket_path) = record.api_socket_path.clone() {
            let control_client = ControlClient::new(api_socket_path);
            let _ = control_client.shutdown_vm().await;
            let _ = control_client.shutdown_vmm().await;
        }
        if let Some(pid) = record.pid {
            Supervisor::terminate(pid, &self.config.timeouts).await?;
        }

        record.status = VmStatus::Stopped;
        record.pid = None;
        record.stopped_at = Some(chrono::Utc::now());
        self.store.put(record.clone())?;
        self.events.publish(Event::Stopped {
            vm_id: vm_id.to_string(),
        });
        Ok(record)
    }

    pub async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let lock = self.lock_for(vm_id);
        let _guard = lock.lock().await;
        let record = self.store.require(vm_id)?;
        if matches!(
            record.status,
            VmStatus::Running | VmStatus::Booting | VmStatus::Paused
        ) {
            self.stop_vm_locked(vm_id).await?;
        }

        if let Some(port) = record.ssh_forward_port {
            self.ssh_port_pool.release(port);
        }
        self.tap_pool.release(vm_id);
        self.store.remove(vm_id)?;
        self.events.publish(Event::Deleted {
            vm_id: vm_id.to_string(),
        });
        drop(_guard);
        self.vm_locks.lock().expect("vm lock map poisoned").remove(vm_id);
        Ok(())
    }

    pub fn list_vms(&self) -> Vec<VmRecord> {
        self.store.list_public()
    }

    pub fn get_vm(&self, vm_id: &str) -> Result<VmRecord> {
        self.store.require(vm_id)
    }

    pub fn ssh_keys_dir(&self) -> PathBuf {
        self.config.ssh_keys_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ExternalIsoBuilder, ExternalQcow2Tool, ProcessInfo};
    use crate::config::Timeouts;
    use crate::pools::TapPool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoProcesses;
    impl ProcessEnumerator for NoProcesses {
        fn list(&self) -> Result<Vec<ProcessInfo>> {
            Ok(vec![])
        }
    }

    struct AlwaysReachable;
    #[async_trait]
    impl ReachabilityProbe for AlwaysReachable {
        async fn probe(&self, _addr: SocketAddr, _timeout: Duration) -> bool {
            true
        }
    }

    struct CountingProbe(Arc<AtomicUsize>);
    #[async_trait]
    impl ReachabilityProbe for CountingProbe {
        async fn probe(&self, addr: SocketAddr, _timeout: Duration) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            addr.port() == 22
        }
    }

    fn test_coordinator(dir: &std::path::Path) -> Coordinator {
        let config = OrchestratorConfig {
            data_dir: dir.join("vms"),
            base_images_dir: dir.join("base-images"),
            ssh_keys_dir: dir.join("ssh-keys"),
            hypervisor_binary: PathBuf::from("/bin/true"),
            qcow2_tool: PathBuf::from("/bin/true"),
            iso_tool: PathBuf::from("/bin/true"),
            ssh_port_range: (20000, 20010),
            timeouts: Timeouts::default(),
            boot_markers: OrchestratorConfig::default_boot_markers(),
        };
        std::fs::create_dir_all(&config.base_images_dir).unwrap();
        let qcow2_tool = Arc::new(ExternalQcow2Tool {
            binary: config.qcow2_tool.clone(),
        });
        let iso_builder = Arc::new(ExternalIsoBuilder {
            binary: config.iso_tool.clone(),
        });
        Coordinator::new(config, TapPool::new(None), qcow2_tool, iso_builder, Arc::new(NoProcesses), None)
    }

    #[tokio::test]
    async fn create_vm_rejects_unknown_base_image() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());
        let err = coordinator
            .create_vm(CreateVmRequest {
                name: "web-1".to_string(),
                base_image: "does-not-exist".to_string(),
                resources: Resources {
                    vcpus: 1,
                    memory_mib: 512,
                    disk_gib: 4,
                },
                network_mode: NetworkMode::None,
                port_mappings: vec![],
                auto_start: false,
                ssh_public_key: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn create_vm_without_auto_start_does_not_allocate_a_pid() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());
        std::fs::create_dir_all(coordinator.config().base_images_dir.join("focal")).unwrap();
        std::fs::write(
            coordinator
                .config()
                .base_images_dir
                .join("focal")
                .join("image.qcow2"),
            b"",
        )
        .unwrap();

        let record = coordinator
            .create_vm(CreateVmRequest {
                name: "web-1".to_string(),
                base_image: "focal".to_string(),
                resources: Resources {
                    vcpus: 1,
                    memory_mib: 512,
                    disk_gib: 4,
                },
                network_mode: NetworkMode::None,
                port_mappings: vec![],
                auto_start: false,
                ssh_public_key: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(record.status, VmStatus::Creating);
        assert!(record.pid.is_none());
    }

    #[test]
    fn reachability_addr_prefers_guest_ip_for_tap_vms() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());
        let record = VmRecord {
            id: "vm-1".to_string(),
            name: "web-1".to_string(),
            status: VmStatus::Booting,
            base_image: "focal".to_string(),
            resources: Resources {
                vcpus: 1,
                memory_mib: 512,
                disk_gib: 4,
            },
            network: NetworkConfig {
                mode: NetworkMode::Tap,
                tap_device: Some("vmtap0".to_string()),
                bridge: Some("vmbr0".to_string()),
                mac: "52:54:00:00:00:01".to_string(),
                guest_ip: Some("192.168.100.10".to_string()),
                gateway: Some("192.168.100.1".to_string()),
            },
            ssh_forward_port: Some(20005),
            port_mappings: vec![],
            volumes: vec![],
            pid: None,
            api_socket_path: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            extra: HashMap::new(),
        };
        let addr = coordinator.reachability_addr(&record).unwrap();
        assert_eq!(addr, "192.168.100.10:22".parse().unwrap());
    }

    #[test]
    fn reachability_addr_falls_back_to_ssh_forward_port() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());
        let record = VmRecord {
            id: "vm-1".to_string(),
            name: "web-1".to_string(),
            status: VmStatus::Booting,
            base_image: "focal".to_string(),
            resources: Resources {
                vcpus: 1,
                memory_mib: 512,
                disk_gib: 4,
            },
            network: NetworkConfig {
                mode: NetworkMode::None,
                tap_device: None,
                bridge: None,
                mac: "52:54:00:00:00:02".to_string(),
                guest_ip: None,
                gateway: None,
            },
            ssh_forward_port: Some(20006),
            port_mappings: vec![],
            volumes: vec![],
            pid: None,
            api_socket_path: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            extra: HashMap::new(),
        };
        let addr = coordinator.reachability_addr(&record).unwrap();
        assert_eq!(addr, "127.0.0.1:20006".parse().unwrap());
    }

    #[tokio::test]
    async fn poll_reachability_uses_resolved_address() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());
        let probe = AlwaysReachable;
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(coordinator.poll_reachability(&probe, addr).await);

        let counted = Arc::new(AtomicUsize::new(0));
        let probe = CountingProbe(counted.clone());
        let tap_addr: SocketAddr = "192.168.100.10:22".parse().unwrap();
        assert!(coordinator.poll_reachability(&probe, tap_addr).await);
        assert_eq!(counted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_vm_on_a_stopped_vm_does_not_touch_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(dir.path());
        std::fs::create_dir_all(coordinator.config().base_images_dir.join("focal")).unwrap();
        std::fs::write(
            coordinator
                .config()
                .base_images_dir
                .join("focal")
                .join("image.qcow2"),
            b"",
        )
        .unwrap();

        let record = coordinator
            .create_vm(CreateVmRequest {
                name: "web-1".to_string(),
                base_image: "focal".to_string(),
                resources: Resources {
                    vcpus: 1,
                    memory_mib: 512,
                    disk_gib: 4,
                },
                network_mode: NetworkMode::None,
                port_mappings: vec![],
                auto_start: false,
                ssh_public_key: String::new(),
            })
            .await
            .unwrap();

        coordinator.delete_vm(&record.id).await.unwrap();
        assert!(coordinator.get_vm(&record.id).is_err());
    }
}
