//! SSH reachability probe (SPEC_FULL.md §4.J, "has the guest come up").
//!
//! Grounded on `qarax`'s `host_deployer::connect_and_authenticate`, trimmed
//! to just the handshake: a successful authenticated session is all the
//! coordinator needs to decide a VM has finished booting far enough to
//! start serving traffic. Host-key checking is intentionally permissive —
//! these are ephemeral guests the orchestrator itself just created, not
//! hosts with a pre-established identity to pin against.
//!
//! Implements the [`crate::capabilities::ReachabilityProbe`] trait so the
//! coordinator can be exercised against a stub probe in tests instead of a
//! real sshd.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh_keys::key;

use crate::capabilities::ReachabilityProbe;

struct AcceptAllHostKeys;

#[async_trait]
impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshReachabilityProbe {
    pub username: String,
    pub private_key: Arc<russh_keys::key::KeyPair>,
}

impl SshReachabilityProbe {
    async fn try_connect(&self, addr: SocketAddr) -> bool {
        let config = Arc::new(client::Config::default());
        let handler = AcceptAllHostKeys;
        let mut session: Handle<AcceptAllHostKeys> =
            match client::connect(config, addr, handler).await {
                Ok(session) => session,
                Err(_) => return false,
            };
        matches!(
            session
                .authenticate_publickey(&self.username, self.private_key.clone())
                .await,
            Ok(true)
        )
    }
}

#[async_trait]
impl ReachabilityProbe for SshReachabilityProbe {
    /// Open a TCP connection to `addr`, complete the SSH handshake, and
    /// authenticate with the configured key. Returns `true` only on full
    /// authenticated success within `timeout` — any failure (connection
    /// refused, handshake timeout, auth rejected) is treated as "not
    /// reachable yet" rather than propagated, since the caller polls this
    /// repeatedly until its own timeout budget is exhausted.
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.try_connect(addr))
            .await
            .unwrap_or(false)
    }
}
