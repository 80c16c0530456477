//! Persistent Store (SPEC_FULL.md §4.B).
//!
//! One directory per VM under `data_dir`, each holding a `state.json`
//! written atomically (temp file + fsync + rename) so a crash mid-write
//! never leaves a half-written record behind. On startup every VM directory
//! is reloaded; a directory whose `state.json` fails to parse is logged and
//! skipped rather than aborting the whole reload, per the `Corruption`
//! handling described in SPEC_FULL.md §7.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::record::VmRecord;

pub struct Store {
    data_dir: PathBuf,
    records: RwLock<HashMap<String, VmRecord>>,
}

impl Store {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Scan `data_dir` for VM subdirectories and load each `state.json`.
    /// Directories with no `state.json`, or a `state.json` that fails to
    /// parse, are skipped with a warning rather than failing the whole load.
    pub fn reload(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.data_dir)?;
        let mut loaded = HashMap::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let state_path = entry.path().join("state.json");
            if !state_path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&state_path) {
                Ok(raw) => match serde_json::from_str::<VmRecord>(&raw) {
                    Ok(record) => {
                        loaded.insert(record.id.clone(), record);
                    }
                    Err(e) => {
                        warn!(path = ?state_path, error = %e, "skipping unparsable vm state");
                    }
                },
                Err(e) => {
                    warn!(path = ?state_path, error = %e, "skipping unreadable vm state");
                }
            }
        }
        let count = loaded.len();
        info!(count, "reloaded vm records from disk");
        *self.records.write().expect("store lock poisoned") = loaded;
        Ok(count)
    }

    pub fn get(&self, vm_id: &str) -> Option<VmRecord> {
        self.records
            .read()
            .expect("store lock poisoned")
            .get(vm_id)
            .cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<VmRecord> {
        self.records
            .read()
            .expect("store lock poisoned")
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn list(&self) -> Vec<VmRecord> {
        self.records
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// List all non-warmup records, the view exposed to clients per
    /// SPEC_FULL.md §4.G ("warmup VMs are never included in `list_vms`").
    pub fn list_public(&self) -> Vec<VmRecord> {
        self.list().into_iter().filter(|r| !r.is_warmup()).collect()
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.records
            .read()
            .expect("store lock poisoned")
            .values()
            .any(|r| r.name == name)
    }

    pub fn all_macs(&self) -> std::collections::HashSet<String> {
        self.records
            .read()
            .expect("store lock poisoned")
            .values()
            .map(|r| r.network.mac.clone())
            .collect()
    }

    /// Persist `record`, replacing any prior on-disk state for the same id.
    pub fn put(&self, record: VmRecord) -> Result<()> {
        let vm_dir = self.data_dir.join(&record.id);
        std::fs::create_dir_all(&vm_dir)?;
        let final_path = vm_dir.join("state.json");
        let tmp_path = vm_dir.join("state.json.tmp");

        let serialized = serde_json::to_vec_pretty(&record)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        if let Some(dir_file) = std::fs::File::open(&vm_dir).ok() {
            let _ = dir_file.sync_all();
        }

        self.records
            .write()
            .expect("store lock poisoned")
            .insert(record.id.clone(), record);
        Ok(())
    }

    pub fn remove(&self, vm_id: &str) -> Result<()> {
        let vm_dir = self.data_dir.join(vm_id);
        if vm_dir.exists() {
            std::fs::remove_dir_all(&vm_dir)?;
        }
        self.records.write().expect("store lock poisoned").remove(vm_id);
        Ok(())
    }

    pub fn require(&self, vm_id: &str) -> Result<VmRecord> {
        self.get(vm_id)
            .ok_or_else(|| CoreError::VmNotFound(vm_id.to_string()))
    }

    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.data_dir.join(vm_id)
    }
}

pub fn default_state_path(vm_dir: &Path) -> PathBuf {
    vm_dir.join("state.json")
}
