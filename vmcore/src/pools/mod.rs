//! Resource pools (SPEC_FULL.md §4.A): MAC addresses, TAP devices, and SSH
//! forwarding ports. Each pool owns its own coarse lock; the coordinator
//! never takes more than one pool lock at a time.

pub mod mac;
pub mod ssh_port;
pub mod tap;

pub use mac::MacPool;
pub use ssh_port::SshPortPool;
pub use tap::{TapHealth, TapPool, TapPoolSeed};
