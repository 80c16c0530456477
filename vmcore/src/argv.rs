//! Generated VM argv builder (SPEC_FULL.md §6, cold-boot mode).
//!
//! Builds the hypervisor monitor's command line for a cold boot: kernel,
//! initrd or firmware, cpu/memory topology, the per-VM disk overlay and
//! cloud-init ISO, the TAP network device, the vsock UDS, and the API
//! socket path the control client will poll for.

use std::path::Path;

use crate::record::{BaseImage, NetworkMode, VmRecord};

pub fn build_cold_boot_argv(
    record: &VmRecord,
    base_image: &BaseImage,
    overlay_path: &Path,
    cloudinit_iso: &Path,
    api_socket_path: &Path,
    vsock_uds_path: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--api-socket".to_string(),
        api_socket_path.display().to_string(),
        "--cpus".to_string(),
        format!("boot={}", record.resources.vcpus),
        "--memory".to_string(),
        format!("size={}M", record.resources.memory_mib),
        "--disk".to_string(),
        format!(
            "path={},path={}",
            overlay_path.display(),
            cloudinit_iso.display()
        ),
        "--vsock".to_string(),
        format!("cid=3,socket={}", vsock_uds_path.display()),
    ];

    if base_image.has_firmware_only_boot() {
        // No kernel/initrd pair shipped with the base image: let the
        // hypervisor load firmware and boot the disk directly.
    } else {
        args.push("--kernel".to_string());
        args.push(base_image.kernel_path().display().to_string());
        args.push("--initramfs".to_string());
        args.push(base_image.initrd_path().display().to_string());
        args.push("--cmdline".to_string());
        args.push("console=ttyS0 reboot=k panic=1".to_string());
    }

    match record.network.mode {
        NetworkMode::Tap => {
            if let Some(tap) = &record.network.tap_device {
                args.push("--net".to_string());
                args.push(format!("tap={},mac={}", tap, record.network.mac));
            }
        }
        NetworkMode::None => {}
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{NetworkConfig, Resources, VmStatus};
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample_record() -> VmRecord {
        VmRecord {
            id: "vm-1".to_string(),
            name: "web-1".to_string(),
            status: VmStatus::Creating,
            base_image: "focal".to_string(),
            resources: Resources {
                vcpus: 2,
                memory_mib: 1024,
                disk_gib: 8,
            },
            network: NetworkConfig {
                mode: NetworkMode::Tap,
                tap_device: Some("vmtap3".to_string()),
                bridge: Some("vmbr0".to_string()),
                mac: "52:54:00:00:00:03".to_string(),
                guest_ip: Some("192.168.100.10".to_string()),
                gateway: Some("192.168.100.1".to_string()),
            },
            ssh_forward_port: Some(2222),
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

    #[test]
    fn includes_disk_and_net_args() {
        let dir = tempfile::tempdir().unwrap();
        let base_image = BaseImage::new(dir.path(), "focal");
        std::fs::create_dir_all(base_image.dir.clone()).unwrap();
        std::fs::write(base_image.kernel_path(), b"fake-kernel").unwrap();
        std::fs::write(base_image.initrd_path(), b"fake-initrd").unwrap();

        let record = sample_record();
        let args = build_cold_boot_argv(
            &record,
            &base_image,
            Path::new("/vm/disk.qcow2"),
            Path::new("/vm/cloudinit.iso"),
            Path::new("/vm/api.sock"),
            Path::new("/vm/vsock.sock"),
        );

        assert!(args.iter().any(|a| a.contains("mac=52:54:00:00:00:03")));
        assert!(args.iter().any(|a| a.contains("disk.qcow2")));
        assert!(args.contains(&"--kernel".to_string()));
    }

    #[test]
    fn firmware_only_base_image_skips_kernel_args() {
        let dir = tempfile::tempdir().unwrap();
        let base_image = BaseImage::new(dir.path(), "firmware-only");
        std::fs::create_dir_all(base_image.dir.clone()).unwrap();

        let record = sample_record();
        let args = build_cold_boot_argv(
            &record,
            &base_image,
            Path::new("/vm/disk.qcow2"),
            Path::new("/vm/cloudinit.iso"),
            Path::new("/vm/api.sock"),
            Path::new("/vm/vsock.sock"),
        );

        assert!(!args.contains(&"--kernel".to_string()));
    }
}
