//! SSH forwarding port pool (SPEC_FULL.md §4.A).
//!
//! A contiguous `[lo, hi]` range on the host. Allocation scans linearly,
//! skipping ports already held in-process and ports a non-blocking bind
//! probe shows are in use by something else on the host.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;

use socket2::{Domain, Socket, Type};

use crate::error::{CoreError, Result};

pub struct SshPortPool {
    range: (u16, u16),
    held: Mutex<HashSet<u16>>,
}

impl SshPortPool {
    pub fn new(range: (u16, u16)) -> Self {
        Self {
            range,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut held = self.held.lock().expect("ssh port pool lock poisoned");
        for port in self.range.0..=self.range.1 {
            if held.contains(&port) {
                continue;
            }
            if port_is_free(port) {
                held.insert(port);
                return Ok(port);
            }
        }
        Err(CoreError::SshPortExhausted)
    }

    pub fn release(&self, port: u16) {
        self.held.lock().expect("ssh port pool lock poisoned").remove(&port);
    }
}

/// Probes host port availability with a bind-and-drop, not a connect — a
/// connect failure only proves nothing is listening yet, whereas bind
/// failing proves the port is unavailable to us right now (already bound,
/// permission denied, etc).
fn port_is_free(port: u16) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port).into();
    socket.bind(&addr.into()).is_ok()
}
