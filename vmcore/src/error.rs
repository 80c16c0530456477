//! Error taxonomy shared across every component.
//!
//! Each component module defines whatever error detail it needs, but every
//! leaf error maps into one of these kinds via [`CoreError::kind`] so callers
//! can match on kind without string-sniffing (see SPEC_FULL.md §7). This
//! mirrors the teacher's `map_manager_error` function, which maps
//! `VmManagerError` into a `tonic::Status` code — here there is no RPC layer,
//! so the target is this shared enum instead.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ResourceExhausted,
    Precondition,
    MonitorFailure,
    GuestTimeout,
    Transient,
    Corruption,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("vm {0} not found")]
    VmNotFound(String),

    #[error("base image {0} not found")]
    BaseImageNotFound(String),

    #[error("vm name {0} already in use")]
    NameConflict(String),

    #[error("resource already held: {0}")]
    ResourceHeld(String),

    #[error("TAP pool exhausted")]
    TapPoolExhausted,

    #[error("no free SSH forwarding port in range")]
    SshPortExhausted,

    #[error("no unique MAC address found after {0} attempts")]
    MacExhausted(usize),

    #[error("disk operation failed: {0}")]
    DiskExhausted(String),

    #[error("operation requires vm {id} to be {expected}, but it is {actual}")]
    Precondition {
        id: String,
        expected: &'static str,
        actual: String,
    },

    #[error("failed to spawn monitor process: {0}")]
    SpawnFailed(std::io::Error),

    #[error("monitor control API call to {path} failed: {message}")]
    MonitorApi { path: String, message: String },

    #[error("monitor API socket at {0:?} never appeared")]
    SocketTimeout(PathBuf),

    #[error("boot-complete marker not observed for vm {0} within timeout")]
    BootTimeout(String),

    #[error("vm {0} did not become reachable within timeout")]
    ReachabilityTimeout(String),

    #[error("vsock request failed after retries: {0}")]
    VsockTransient(String),

    #[error("failed to parse persisted state at {path:?}: {message}")]
    Corruption { path: PathBuf, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        use CoreError::*;
        match self {
            VmNotFound(_) | BaseImageNotFound(_) => ErrorKind::NotFound,
            NameConflict(_) | ResourceHeld(_) => ErrorKind::Conflict,
            TapPoolExhausted | SshPortExhausted | MacExhausted(_) | DiskExhausted(_) => {
                ErrorKind::ResourceExhausted
            }
            Precondition { .. } => ErrorKind::Precondition,
            SpawnFailed(_) | MonitorApi { .. } | SocketTimeout(_) => ErrorKind::MonitorFailure,
            BootTimeout(_) | ReachabilityTimeout(_) => ErrorKind::GuestTimeout,
            VsockTransient(_) => ErrorKind::Transient,
            Corruption { .. } => ErrorKind::Corruption,
            Io(_) | Json(_) => ErrorKind::MonitorFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
