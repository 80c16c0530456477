//! Process-level configuration for the orchestrator core.
//!
//! The CLI binary parses its own `clap` arguments and builds one of these;
//! the TAP pool seed is a separate `serde` document (see [`crate::pools::tap::TapPoolSeed`])
//! since it is operator-provisioned data rather than a flag.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub data_dir: PathBuf,
    pub base_images_dir: PathBuf,
    pub ssh_keys_dir: PathBuf,
    pub hypervisor_binary: PathBuf,
    pub qcow2_tool: PathBuf,
    pub iso_tool: PathBuf,
    pub ssh_port_range: (u16, u16),
    pub timeouts: Timeouts,
    /// Boot-readiness markers, case-insensitive substrings of the console
    /// log. Configurable per Design Notes §9 ("keep the marker set
    /// configurable per base image"); this is the default set applied when a
    /// base image doesn't override it.
    pub boot_markers: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub api_socket_normal: Duration,
    pub api_socket_snapshot: Duration,
    pub boot_marker: Duration,
    pub reachability: Duration,
    pub reachability_poll: Duration,
    pub vsock_request: Duration,
    pub vsock_retries: u32,
    pub vsock_retry_delay: Duration,
    pub terminate_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            api_socket_normal: Duration::from_secs(60),
            api_socket_snapshot: Duration::from_secs(30),
            boot_marker: Duration::from_secs(120),
            reachability: Duration::from_secs(120),
            reachability_poll: Duration::from_secs(2),
            vsock_request: Duration::from_secs(30),
            vsock_retries: 10,
            vsock_retry_delay: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(3),
        }
    }
}

impl OrchestratorConfig {
    pub fn default_boot_markers() -> Vec<String> {
        vec![
            "login:".to_string(),
            "reached target cloud-init.target".to_string(),
            "cloud-init target".to_string(),
        ]
    }

    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.data_dir.join(vm_id)
    }
}
