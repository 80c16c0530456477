//! Process Supervisor (SPEC_FULL.md §4.C).
//!
//! Spawns the hypervisor monitor as a detached child (its own session, so it
//! survives the orchestrator restarting), checks liveness with a signal-0
//! probe, and terminates with a grace period before escalating to SIGKILL.
//! Grounded on `qarax-node`'s process-spawning code in `manager.rs`, which
//! takes the same detach-and-poll approach for the cloud-hypervisor binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::{self, Signal};
use nix::unistd::{Gid, Pid};
use tokio::process::Command;
use tracing::{info, warn};

use crate::capabilities::{ProcessEnumerator, ProcessInfo};
use crate::config::Timeouts;
use crate::error::{CoreError, Result};

pub struct SpawnRequest<'a> {
    pub binary: &'a Path,
    pub args: Vec<String>,
    pub working_dir: &'a Path,
    pub log_path: &'a Path,
    /// Supplementary group (typically `kvm`) the child needs on top of the
    /// orchestrator's own credentials to open `/dev/kvm`.
    pub kvm_group: Option<Gid>,
}

pub struct Supervisor;

impl Supervisor {
    /// Spawn `binary` detached from the orchestrator's process group and
    /// return its pid. Stdout/stderr are redirected to `log_path` so the
    /// child's console output survives after the orchestrator exits.
    pub async fn spawn(req: SpawnRequest<'_>) -> Result<u32> {
        let log_file = std::fs::File::create(req.log_path)?;
        let log_file_err = log_file.try_clone()?;

        let mut cmd = Command::new(req.binary);
        cmd.args(&req.args)
            .current_dir(req.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        let kvm_group = req.kvm_group;
        unsafe {
            cmd.pre_exec(move || {
                // New session so the child isn't killed when the
                // orchestrator's controlling terminal goes away.
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                if let Some(gid) = kvm_group {
                    let groups = [gid];
                    nix::unistd::setgroups(&groups).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(CoreError::SpawnFailed)?;
        let pid = child.id().ok_or_else(|| {
            CoreError::SpawnFailed(std::io::Error::other("spawned child has no pid"))
        })?;
        // Detach: we track liveness by pid/signal-0, not by awaiting this
        // handle, so drop it without reaping.
        std::mem::forget(child);
        info!(pid, binary = %req.binary.display(), "spawned monitor process");
        Ok(pid)
    }

    /// `kill -0` equivalent: true iff a process with this pid exists and is
    /// visible to us, regardless of its state.
    pub fn is_alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// SIGTERM, wait up to `timeouts.terminate_grace`, then SIGKILL and wait
    /// up to `timeouts.kill_grace`. Returns once the process is confirmed
    /// gone or both grace periods have elapsed.
    pub async fn terminate(pid: u32, timeouts: &Timeouts) -> Result<()> {
        let nix_pid = Pid::from_raw(pid as i32);
        if signal::kill(nix_pid, Signal::SIGTERM).is_err() {
            return Ok(()); // already gone
        }
        if Self::wait_for_exit(pid, timeouts.terminate_grace).await {
            return Ok(());
        }
        warn!(pid, "process did not exit after SIGTERM, escalating to SIGKILL");
        if signal::kill(nix_pid, Signal::SIGKILL).is_err() {
            return Ok(());
        }
        if Self::wait_for_exit(pid, timeouts.kill_grace).await {
            Ok(())
        } else {
            Err(CoreError::SpawnFailed(std::io::Error::other(format!(
                "pid {pid} still alive after SIGKILL grace period"
            ))))
        }
    }

    async fn wait_for_exit(pid: u32, grace: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if !Self::is_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Find monitor processes whose argv references a path under
    /// `data_dir` but whose vm id (the path component following `data_dir`)
    /// is not in `known_vm_ids`. These are orphans from a prior orchestrator
    /// instance that never got torn down (SPEC_FULL.md §4.C reconciliation).
    pub fn find_orphans(
        enumerator: &dyn ProcessEnumerator,
        data_dir: &Path,
        known_vm_ids: &[String],
    ) -> Result<Vec<(u32, String)>> {
        let data_dir_str = data_dir.to_string_lossy().into_owned();
        let mut orphans = Vec::new();
        for ProcessInfo { pid, argv } in enumerator.list()? {
            let Some(vm_id) = extract_vm_id(&argv, &data_dir_str) else {
                continue;
            };
            if !known_vm_ids.iter().any(|id| id == &vm_id) {
                orphans.push((pid, vm_id));
            }
        }
        Ok(orphans)
    }
}

fn extract_vm_id(argv: &[String], data_dir: &str) -> Option<String> {
    for arg in argv {
        if let Some(rest) = arg.strip_prefix(data_dir) {
            let rest = rest.trim_start_matches('/');
            let vm_id = rest.split('/').next()?;
            if !vm_id.is_empty() {
                return Some(vm_id.to_string());
            }
        }
    }
    None
}

pub fn log_path_for(vm_dir: &Path) -> PathBuf {
    vm_dir.join("monitor.log")
}
