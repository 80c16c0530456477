//! Guest Control over vsock (SPEC_FULL.md §4.I).
//!
//! The monitor exposes vsock as a host-side Unix domain socket that speaks
//! the Firecracker-style handshake: write `CONNECT <port>\n`, read back
//! `OK <assigned-port>\n`, then the stream carries the guest agent's
//! protocol directly. Requests are retried up to
//! `timeouts.vsock_retries` times at `timeouts.vsock_retry_delay` apart,
//! since the guest agent may not have bound its listener yet right after
//! boot.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::config::Timeouts;
use crate::error::{CoreError, Result};

const AGENT_PORT: u32 = 52; // arbitrary guest-agent vsock port, shared with vm-guest-agent

pub struct VsockClient<'a> {
    uds_path: &'a Path,
}

impl<'a> VsockClient<'a> {
    pub fn new(uds_path: &'a Path) -> Self {
        Self { uds_path }
    }

    async fn connect_and_handshake(&self) -> Result<UnixStream> {
        let mut stream = UnixStream::connect(self.uds_path)
            .await
            .map_err(|e| CoreError::VsockTransient(e.to_string()))?;
        stream
            .write_all(format!("CONNECT {AGENT_PORT}\n").as_bytes())
            .await
            .map_err(|e| CoreError::VsockTransient(e.to_string()))?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| CoreError::VsockTransient(e.to_string()))?;
        if !line.trim_start().starts_with("OK") {
            return Err(CoreError::VsockTransient(format!(
                "unexpected CONNECT response: {}",
                line.trim()
            )));
        }
        Ok(stream)
    }

    async fn send_one(&self, request: &str) -> Result<String> {
        let mut stream = self.connect_and_handshake().await?;
        stream
            .write_all(format!("{request}\n").as_bytes())
            .await
            .map_err(|e| CoreError::VsockTransient(e.to_string()))?;

        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CoreError::VsockTransient(e.to_string()))?;
        Ok(String::from_utf8_lossy(&buf).trim().to_string())
    }

    /// Send `request`, retrying on transient failure up to
    /// `timeouts.vsock_retries` times, each attempt bounded by
    /// `timeouts.vsock_request`.
    pub async fn send_with_retry(&self, request: &str, timeouts: &Timeouts) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..=timeouts.vsock_retries {
            let outcome =
                tokio::time::timeout(timeouts.vsock_request, self.send_one(request)).await;
            match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => last_err = Some(CoreError::VsockTransient("request timed out".to_string())),
            }
            if attempt < timeouts.vsock_retries {
                tokio::time::sleep(timeouts.vsock_retry_delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::VsockTransient("no attempts made".to_string())))
    }

    pub async fn ping(&self, timeouts: &Timeouts) -> Result<bool> {
        let response = self.send_with_retry("PING", timeouts).await?;
        Ok(response == "PONG")
    }

    /// Ask the guest agent to reconfigure networking after a fast-boot
    /// restore swaps in a new TAP/MAC identity. Returns the guest's newly
    /// bound IPv4 address on success.
    pub async fn reconfigure_network(&self, timeouts: &Timeouts) -> Result<String> {
        let response = self.send_with_retry("RECONFIGURE_NETWORK", timeouts).await?;
        if let Some(ip) = response.strip_prefix("OK:") {
            Ok(ip.to_string())
        } else if let Some(message) = response.strip_prefix("ERROR:") {
            Err(CoreError::VsockTransient(message.to_string()))
        } else {
            Err(CoreError::VsockTransient(format!(
                "unexpected RECONFIGURE_NETWORK response: {response}"
            )))
        }
    }
}

pub fn uds_path_for(vm_dir: &Path) -> std::path::PathBuf {
    vm_dir.join("vsock.sock")
}

pub const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
