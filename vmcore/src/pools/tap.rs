//! TAP device pool (SPEC_FULL.md §4.A).
//!
//! Unlike the MAC and SSH-port pools, TAP devices are not generated: they
//! must already exist on the host, attached to a bridge, before the core can
//! hand one to a VM. The pool is seeded from an operator-provisioned list
//! (on disk as [`TapPoolSeed`]) and tracks which device is currently bound to
//! which VM id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Operator-provisioned, on-disk description of the TAP devices this host
/// makes available to the pool. Deserialized with `serde_json`, following
/// the config-layer pattern noted in SPEC_FULL.md §1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapPoolSeed {
    pub bridge: String,
    pub gateway: String,
    pub guest_ip_range: (String, String),
    pub devices: Vec<String>,
}

impl TapPoolSeed {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone)]
pub struct TapHealth {
    pub configured: bool,
    pub healthy: bool,
    pub available: usize,
}

struct TapPoolState {
    /// device -> vm_id, for devices currently on loan.
    bound: HashMap<String, String>,
    /// vm_id -> device, the inverse index, so repeat allocation for the same
    /// vm id is idempotent rather than handing out a second device.
    by_vm: HashMap<String, String>,
}

pub struct TapPool {
    seed: Option<TapPoolSeed>,
    state: Mutex<TapPoolState>,
}

impl TapPool {
    pub fn new(seed: Option<TapPoolSeed>) -> Self {
        Self {
            seed,
            state: Mutex::new(TapPoolState {
                bound: HashMap::new(),
                by_vm: HashMap::new(),
            }),
        }
    }

    pub fn bridge(&self) -> Option<&str> {
        self.seed.as_ref().map(|s| s.bridge.as_str())
    }

    pub fn gateway(&self) -> Option<&str> {
        self.seed.as_ref().map(|s| s.gateway.as_str())
    }

    /// Allocate a TAP device for `vm_id`. Calling this again for the same
    /// `vm_id` before it is released returns the same device rather than
    /// erroring, matching the idempotent-allocation requirement.
    pub fn allocate(&self, vm_id: &str) -> Result<String> {
        let Some(seed) = &self.seed else {
            return Err(CoreError::TapPoolExhausted);
        };
        let mut state = self.state.lock().expect("tap pool lock poisoned");
        if let Some(existing) = state.by_vm.get(vm_id) {
            return Ok(existing.clone());
        }
        for device in &seed.devices {
            if !state.bound.contains_key(device) {
                state.bound.insert(device.clone(), vm_id.to_string());
                state.by_vm.insert(vm_id.to_string(), device.clone());
                return Ok(device.clone());
            }
        }
        Err(CoreError::TapPoolExhausted)
    }

    pub fn release(&self, vm_id: &str) {
        let mut state = self.state.lock().expect("tap pool lock poisoned");
        if let Some(device) = state.by_vm.remove(vm_id) {
            state.bound.remove(&device);
        }
    }

    /// Drop any binding whose vm id is not in `active_ids`, returning
    /// devices to the free pool. Used by startup reconciliation, which may
    /// find records that disappeared from the store without releasing
    /// their device first (e.g. a crash between delete and release).
    pub fn cleanup_stale(&self, active_ids: &[String]) {
        let mut state = self.state.lock().expect("tap pool lock poisoned");
        let stale: Vec<String> = state
            .by_vm
            .keys()
            .filter(|id| !active_ids.contains(id))
            .cloned()
            .collect();
        for vm_id in stale {
            if let Some(device) = state.by_vm.remove(&vm_id) {
                state.bound.remove(&device);
            }
        }
    }

    pub fn health(&self) -> TapHealth {
        let configured = self.seed.is_some();
        let state = self.state.lock().expect("tap pool lock poisoned");
        let total = self.seed.as_ref().map(|s| s.devices.len()).unwrap_or(0);
        TapHealth {
            configured,
            healthy: configured,
            available: total.saturating_sub(state.bound.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> TapPoolSeed {
        TapPoolSeed {
            bridge: "vmbr0".to_string(),
            gateway: "192.168.100.1".to_string(),
            guest_ip_range: ("192.168.100.10".to_string(), "192.168.100.250".to_string()),
            devices: vec!["vmtap0".to_string(), "vmtap1".to_string()],
        }
    }

    #[test]
    fn allocate_is_idempotent_per_vm() {
        let pool = TapPool::new(Some(seed()));
        let first = pool.allocate("vm-a").unwrap();
        let second = pool.allocate("vm-a").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exhaustion_once_all_devices_bound() {
        let pool = TapPool::new(Some(seed()));
        pool.allocate("vm-a").unwrap();
        pool.allocate("vm-b").unwrap();
        let err = pool.allocate("vm-c").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn release_frees_device_for_reuse() {
        let pool = TapPool::new(Some(seed()));
        let device = pool.allocate("vm-a").unwrap();
        pool.release("vm-a");
        let reused = pool.allocate("vm-b").unwrap();
        assert_eq!(device, reused);
    }

    #[test]
    fn cleanup_stale_drops_unreferenced_bindings() {
        let pool = TapPool::new(Some(seed()));
        pool.allocate("vm-a").unwrap();
        pool.cleanup_stale(&[]);
        let health = pool.health();
        assert_eq!(health.available, 2);
    }

    #[test]
    fn unconfigured_pool_reports_not_healthy() {
        let pool = TapPool::new(None);
        let health = pool.health();
        assert!(!health.configured);
        assert!(!health.healthy);
    }
}
