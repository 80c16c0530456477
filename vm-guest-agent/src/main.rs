//! Guest-side vsock agent (SPEC_FULL.md §4.K).
//!
//! Runs inside the VM, listens on a vsock port, and answers two requests
//! from the host: `PING` (liveness) and `RECONFIGURE_NETWORK` (re-bring-up
//! the primary interface after a fast-boot restore swaps in a new TAP/MAC
//! identity). Shape borrowed from the pack's minimal sandbox agent
//! (`crates/sandchest-agent`), with a dev-mode TCP listener for running the
//! agent outside a VM during development, same as that example does.

use std::net::Ipv4Addr;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

const DEFAULT_AGENT_PORT: u32 = 52;

#[derive(Parser, Debug)]
#[clap(name = "vm-guest-agent", rename_all = "kebab-case", rename_all_env = "screaming-snake")]
struct Args {
    /// vsock port to listen on
    #[clap(long, default_value_t = DEFAULT_AGENT_PORT)]
    port: u32,

    /// Listen on 127.0.0.1:<port> over TCP instead of vsock, for running
    /// the agent outside a VM during development
    #[clap(long)]
    dev_tcp: bool,

    /// Interface to bring down/up on RECONFIGURE_NETWORK
    #[clap(long, default_value = "eth0")]
    interface: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_tracing("vm-guest-agent");
    let args = Args::parse();

    if args.dev_tcp {
        run_tcp(&args).await
    } else {
        run_vsock(&args).await
    }
}

async fn run_vsock(args: &Args) -> anyhow::Result<()> {
    use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};

    let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, args.port))?;
    info!(port = args.port, "guest agent listening on vsock");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(?peer, "accepted vsock connection");
        let interface = args.interface.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &interface).await {
                warn!(error = %e, "connection handler failed");
            }
        });
    }
}

async fn run_tcp(args: &Args) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port as u16)).await?;
    info!(port = args.port, "guest agent listening on tcp (dev mode)");
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(?peer, "accepted tcp connection");
        let interface = args.interface.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &interface).await {
                warn!(error = %e, "connection handler failed");
            }
        });
    }
}

async fn handle_connection<S>(stream: S, interface: &str) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let request = line.trim();

    let response = match request {
        "PING" => "PONG".to_string(),
        "RECONFIGURE_NETWORK" => match reconfigure_network(interface).await {
            Ok(ip) => format!("OK:{ip}"),
            Err(e) => format!("ERROR:{e}"),
        },
        other => format!("ERROR:unknown request {other}"),
    };

    write_half.write_all(response.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.shutdown().await?;
    Ok(())
}

/// Bring `interface` down then up, try `dhclient -1` to acquire a lease,
/// and report whatever IPv4 address ends up bound. `dhclient` failing is
/// not itself fatal — some images configure the interface statically via
/// cloud-init's `network-config` instead, in which case the address is
/// already there once the link is back up.
async fn reconfigure_network(interface: &str) -> anyhow::Result<Ipv4Addr> {
    run_command("ip", &["link", "set", interface, "down"]).await?;
    run_command("ip", &["link", "set", interface, "up"]).await?;

    if let Err(e) = run_command("dhclient", &["-1", interface]).await {
        warn!(error = %e, interface, "dhclient failed, falling back to statically configured address");
    }

    bound_ipv4(interface)
}

async fn run_command(binary: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(binary).args(args).status().await?;
    if !status.success() {
        anyhow::bail!("{binary} {args:?} exited with {status}");
    }
    Ok(())
}

fn bound_ipv4(interface: &str) -> anyhow::Result<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs()?;
    for addr in addrs {
        if addr.interface_name != interface {
            continue;
        }
        if let Some(address) = addr.address {
            if let Some(sockaddr_in) = address.as_sockaddr_in() {
                return Ok(Ipv4Addr::from(sockaddr_in.ip()));
            }
        }
    }
    anyhow::bail!("no ipv4 address bound on {interface}")
}
