use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tabled::Tabled;
use tracing::info;

use vmcore::capabilities::{ExternalIsoBuilder, ExternalQcow2Tool, ProcProcessEnumerator};
use vmcore::config::OrchestratorConfig;
use vmcore::coordinator::{Coordinator, CreateVmRequest};
use vmcore::pools::{TapPool, TapPoolSeed};
use vmcore::record::{NetworkMode, Resources, VmRecord};

#[derive(Parser, Debug)]
#[clap(
    name = "vmcorectl",
    about = "VM lifecycle and fast-boot orchestrator",
    rename_all = "kebab-case",
    rename_all_env = "screaming-snake"
)]
struct Args {
    /// Directory holding per-VM state and runtime artifacts
    #[clap(long, default_value = "/var/lib/vmcore/vms")]
    data_dir: PathBuf,

    /// Directory holding base-image qcow2/kernel/initrd triples
    #[clap(long, default_value = "/var/lib/vmcore/base-images")]
    base_images_dir: PathBuf,

    /// Directory holding the SSH key pair used for reachability probing
    /// and cloud-init seeding
    #[clap(long, default_value = "/var/lib/vmcore/ssh-keys")]
    ssh_keys_dir: PathBuf,

    /// Path to the cloud-hypervisor binary
    #[clap(long, default_value = "/usr/local/bin/cloud-hypervisor")]
    hypervisor_binary: PathBuf,

    /// Path to the qemu-img (or compatible) qcow2 tool
    #[clap(long, default_value = "/usr/bin/qemu-img")]
    qcow2_tool: PathBuf,

    /// Path to the ISO-creation tool (genisoimage/xorriso-compatible CLI)
    #[clap(long, default_value = "/usr/bin/genisoimage")]
    iso_tool: PathBuf,

    /// Optional path to a TAP pool seed document (see
    /// [`vmcore::pools::tap::TapPoolSeed`]); network_mode=tap VMs fail to
    /// create without one
    #[clap(long)]
    tap_pool_seed: Option<PathBuf>,

    /// Low end of the host SSH-forward port range
    #[clap(long, default_value = "20000")]
    ssh_port_lo: u16,

    /// High end of the host SSH-forward port range
    #[clap(long, default_value = "21000")]
    ssh_port_hi: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a VM record without starting it
    Create {
        name: String,
        base_image: String,
        #[clap(long, default_value = "1")]
        vcpus: u8,
        #[clap(long, default_value = "512")]
        memory_mib: u32,
        #[clap(long, default_value = "4")]
        disk_gib: u32,
        #[clap(long, value_enum, default_value = "tap")]
        network_mode: NetworkModeArg,
        /// Start the VM immediately after creating its record
        #[clap(long)]
        auto_start: bool,
    },
    /// Start a previously created VM (fast-boot restore if a warmup
    /// snapshot exists for its base image, cold boot otherwise)
    Start { vm_id: String },
    /// Pause a running VM
    Pause { vm_id: String },
    /// Resume a paused VM
    Resume { vm_id: String },
    /// Stop a VM's monitor process
    Stop { vm_id: String },
    /// Stop (if running) and remove a VM's record and on-disk state
    Delete { vm_id: String },
    /// List non-warmup VMs
    List,
    /// Show one VM's record
    Get { vm_id: String },
    /// Boot a throwaway VM from a base image, pause it, and snapshot it so
    /// future starts of that base image can fast-boot from the snapshot
    Warmup { base_image: String },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum NetworkModeArg {
    Tap,
    None,
}

impl From<NetworkModeArg> for NetworkMode {
    fn from(value: NetworkModeArg) -> Self {
        match value {
            NetworkModeArg::Tap => NetworkMode::Tap,
            NetworkModeArg::None => NetworkMode::None,
        }
    }
}

#[derive(Tabled)]
struct VmRow {
    id: String,
    name: String,
    status: String,
    base_image: String,
    ssh_port: String,
}

impl From<&VmRecord> for VmRow {
    fn from(record: &VmRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            status: format!("{:?}", record.status),
            base_image: record.base_image.clone(),
            ssh_port: record
                .ssh_forward_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_tracing("vmcorectl");
    let args = Args::parse();

    std::fs::create_dir_all(&args.data_dir)?;
    std::fs::create_dir_all(&args.base_images_dir)?;

    let config = OrchestratorConfig {
        data_dir: args.data_dir.clone(),
        base_images_dir: args.base_images_dir.clone(),
        ssh_keys_dir: args.ssh_keys_dir.clone(),
        hypervisor_binary: args.hypervisor_binary.clone(),
        qcow2_tool: args.qcow2_tool.clone(),
        iso_tool: args.iso_tool.clone(),
        ssh_port_range: (args.ssh_port_lo, args.ssh_port_hi),
        timeouts: Default::default(),
        boot_markers: OrchestratorConfig::default_boot_markers(),
    };

    let tap_seed = match &args.tap_pool_seed {
        Some(path) => Some(TapPoolSeed::load(path)?),
        None => None,
    };
    let tap_pool = TapPool::new(tap_seed);

    let qcow2_tool = Arc::new(ExternalQcow2Tool {
        binary: config.qcow2_tool.clone(),
    });
    let iso_builder = Arc::new(ExternalIsoBuilder {
        binary: config.iso_tool.clone(),
    });
    let process_enumerator = Arc::new(ProcProcessEnumerator);

    let coordinator = Coordinator::new(
        config,
        tap_pool,
        qcow2_tool,
        iso_builder,
        process_enumerator,
        None,
    );
    coordinator.reconcile_on_startup().await?;

    run_command(&coordinator, args.command, &args.ssh_keys_dir).await
}

async fn run_command(
    coordinator: &Coordinator,
    command: Command,
    ssh_keys_dir: &std::path::Path,
) -> anyhow::Result<()> {
    match command {
        Command::Create {
            name,
            base_image,
            vcpus,
            memory_mib,
            disk_gib,
            network_mode,
            auto_start,
        } => {
            let public_key_path = ssh_keys_dir.join("id_ed25519.pub");
            let ssh_public_key = std::fs::read_to_string(&public_key_path).unwrap_or_default();
            let record = coordinator
                .create_vm(CreateVmRequest {
                    name,
                    base_image,
                    resources: Resources {
                        vcpus,
                        memory_mib,
                        disk_gib,
                    },
                    network_mode: network_mode.into(),
                    port_mappings: vec![],
                    auto_start,
                    ssh_public_key,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Start { vm_id } => {
            let public_key_path = ssh_keys_dir.join("id_ed25519.pub");
            let public_key = std::fs::read_to_string(&public_key_path).unwrap_or_default();
            let record = coordinator.start_vm(&vm_id, &public_key).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Pause { vm_id } => {
            let record = coordinator.pause_vm(&vm_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Resume { vm_id } => {
            let record = coordinator.resume_vm(&vm_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Stop { vm_id } => {
            let record = coordinator.stop_vm(&vm_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Delete { vm_id } => {
            coordinator.delete_vm(&vm_id).await?;
            info!(vm_id, "deleted vm");
        }
        Command::List => {
            let records = coordinator.list_vms();
            let rows: Vec<VmRow> = records.iter().map(VmRow::from).collect();
            println!("{}", tabled::Table::new(rows));
        }
        Command::Get { vm_id } => {
            let record = coordinator.get_vm(&vm_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Warmup { base_image } => {
            let qcow2_tool = ExternalQcow2Tool {
                binary: PathBuf::from("/usr/bin/qemu-img"),
            };
            let iso_builder = ExternalIsoBuilder {
                binary: PathBuf::from("/usr/bin/genisoimage"),
            };
            let public_key_path = ssh_keys_dir.join("id_ed25519.pub");
            let public_key = std::fs::read_to_string(&public_key_path).unwrap_or_default();
            let engine = vmcore::warmup::WarmupEngine::new(
                coordinator.config(),
                &qcow2_tool,
                &iso_builder,
                coordinator.events(),
                coordinator.store(),
            );
            engine.run(&base_image, &public_key).await?;
        }
    }
    Ok(())
}
