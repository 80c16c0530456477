//! Cloud-Init Seed Builder (SPEC_FULL.md §4.E).
//!
//! Renders `meta-data`, `user-data`, and `network-config` into a staging
//! directory, then hands that directory to an [`IsoBuilder`] to produce the
//! `cidata`-labeled ISO cloud-init expects to find attached as a CD-ROM.
//! `user-data` also installs and enables the guest agent's systemd unit and
//! a small network-reconfigure helper script, since both must be present
//! before the boot-marker wait returns (SPEC_FULL.md §4.E, §4.I).

use std::path::{Path, PathBuf};

use tracing::info;

use crate::capabilities::IsoBuilder;
use crate::error::Result;
use crate::record::{NetworkConfig, NetworkMode, VmRecord};

pub const VOLUME_ID: &str = "cidata";

/// Login/SSH user provisioned on every VM; also the identity the guest
/// agent's systemd unit runs network-reconfigure commands under.
pub const GUEST_USER: &str = "agent";

pub struct CloudInitBuilder<'a> {
    iso_builder: &'a dyn IsoBuilder,
}

impl<'a> CloudInitBuilder<'a> {
    pub fn new(iso_builder: &'a dyn IsoBuilder) -> Self {
        Self { iso_builder }
    }

    /// Render the seed documents into `vm_dir/cloudinit-seed/` and build
    /// `vm_dir/cloudinit.iso` from them.
    pub async fn build(&self, vm_dir: &Path, record: &VmRecord, ssh_public_key: &str) -> Result<PathBuf> {
        let staging = vm_dir.join("cloudinit-seed");
        std::fs::create_dir_all(&staging)?;

        std::fs::write(staging.join("meta-data"), render_meta_data(record))?;
        std::fs::write(staging.join("user-data"), render_user_data(record, ssh_public_key))?;
        std::fs::write(staging.join("network-config"), render_network_config(&record.network))?;

        let iso_path = vm_dir.join("cloudinit.iso");
        self.iso_builder.build(&staging, VOLUME_ID, &iso_path).await?;
        info!(vm_id = %record.id, iso = %iso_path.display(), "built cloud-init seed");
        Ok(iso_path)
    }
}

fn render_meta_data(record: &VmRecord) -> String {
    format!(
        "instance-id: {id}\nlocal-hostname: {name}\n",
        id = record.id,
        name = record.name,
    )
}

fn render_user_data(record: &VmRecord, ssh_public_key: &str) -> String {
    format!(
        "#cloud-config\n\
         hostname: {name}\n\
         ssh_pwauth: false\n\
         users:\n\
         \x20 - name: {user}\n\
         \x20   sudo: ALL=(ALL) NOPASSWD:ALL\n\
         \x20   shell: /bin/bash\n\
         \x20   ssh_authorized_keys:\n\
         \x20     - {key}\n\
         write_files:\n\
         \x20 - path: /etc/systemd/system/vm-guest-agent.service\n\
         \x20   permissions: '0644'\n\
         \x20   content: |\n\
         \x20     [Unit]\n\
         \x20     Description=vmcore guest agent\n\
         \x20     After=network.target\n\
         \n\
         \x20     [Service]\n\
         \x20     ExecStart=/usr/local/bin/vm-guest-agent\n\
         \x20     Restart=always\n\
         \n\
         \x20     [Install]\n\
         \x20     WantedBy=multi-user.target\n\
         \x20 - path: /usr/local/bin/vm-guest-agent-reconfigure-network\n\
         \x20   permissions: '0755'\n\
         \x20   content: |\n\
         \x20     #!/bin/sh\n\
         \x20     set -e\n\
         \x20     ip link set \"$1\" down\n\
         \x20     ip link set \"$1\" up\n\
         \x20     dhclient -1 \"$1\" || true\n\
         runcmd:\n\
         \x20 - [systemctl, daemon-reload]\n\
         \x20 - [systemctl, enable, --now, vm-guest-agent.service]\n",
        name = record.name,
        user = GUEST_USER,
        key = ssh_public_key.trim(),
    )
}

fn render_network_config(network: &NetworkConfig) -> String {
    match network.mode {
        NetworkMode::None => "version: 2\nethernets: {}\n".to_string(),
        NetworkMode::Tap => {
            let (ip, gateway) = match (&network.guest_ip, &network.gateway) {
                (Some(ip), Some(gw)) => (ip.clone(), gw.clone()),
                _ => {
                    // DHCP is only reached at cold-boot time, before the VM
                    // has ever been assigned a `guest_ip`. Pinning the
                    // client identifier to the MAC (rather than letting it
                    // default to the interface's IAID/DUID) keeps the lease
                    // stable if the guest later re-attaches after a restore
                    // swaps its TAP identity back in.
                    return "version: 2\nethernets:\n  eth0:\n    dhcp4: true\n    dhcp-identifier: mac\n".to_string();
                }
            };
            format!(
                "version: 2\nethernets:\n  eth0:\n    match:\n      macaddress: \"{mac}\"\n    addresses:\n      - {ip}/24\n    gateway4: {gateway}\n",
                mac = network.mac,
                ip = ip,
                gateway = gateway,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Resources, VmStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubIsoBuilder {
        invoked_with: Mutex<Option<(PathBuf, String, PathBuf)>>,
    }

    #[async_trait]
    impl IsoBuilder for StubIsoBuilder {
        async fn build(&self, source_dir: &Path, volume_id: &str, out_path: &Path) -> Result<()> {
            *self.invoked_with.lock().unwrap() =
                Some((source_dir.to_path_buf(), volume_id.to_string(), out_path.to_path_buf()));
            std::fs::write(out_path, b"fake-iso")?;
            Ok(())
        }
    }

    fn sample_record() -> VmRecord {
        VmRecord {
            id: "vm-1".to_string(),
            name: "web-1".to_string(),
            status: VmStatus::Creating,
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
            ssh_forward_port: None,
            port_mappings: vec![],
            volumes: vec![],
            pid: None,
            api_socket_path: None,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            extra: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn build_writes_seed_files_and_invokes_iso_builder() {
        let iso_builder = StubIsoBuilder {
            invoked_with: Mutex::new(None),
        };
        let dir = tempfile::tempdir().unwrap();
        let builder = CloudInitBuilder::new(&iso_builder);
        let record = sample_record();
        let iso_path = builder.build(dir.path(), &record, "ssh-ed25519 AAAA").await.unwrap();

        assert!(iso_path.exists());
        let invoked = iso_builder.invoked_with.lock().unwrap().clone().unwrap();
        assert_eq!(invoked.1, VOLUME_ID);

        let network_config =
            std::fs::read_to_string(dir.path().join("cloudinit-seed/network-config")).unwrap();
        assert!(network_config.contains("192.168.100.10/24"));

        let user_data =
            std::fs::read_to_string(dir.path().join("cloudinit-seed/user-data")).unwrap();
        assert!(user_data.contains("name: agent"));
        assert!(user_data.contains("vm-guest-agent.service"));
        assert!(user_data.contains("enable, --now, vm-guest-agent.service"));
    }

    #[test]
    fn dhcp_network_config_when_no_static_ip() {
        let mut network = NetworkConfig {
            mode: NetworkMode::Tap,
            tap_device: None,
            bridge: None,
            mac: "52:54:00:00:00:02".to_string(),
            guest_ip: None,
            gateway: None,
        };
        let rendered = render_network_config(&network);
        assert!(rendered.contains("dhcp4: true"));
        assert!(rendered.contains("dhcp-identifier: mac"));
        network.guest_ip = Some("10.0.0.5".to_string());
        let rendered = render_network_config(&network);
        assert!(rendered.contains("dhcp4: true"));
    }
}
