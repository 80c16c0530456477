//! Disk Manager (SPEC_FULL.md §4.F).
//!
//! Creates a qcow2 overlay backed by a base image for each VM, and ensures
//! the overlay's reported virtual size is at least the VM's requested disk
//! size before boot. Grounded on `qarax-node`'s `image_store::manager`
//! disk-preparation flow, swapped to go through the [`Qcow2Tool`]
//! capability rather than shelling out inline.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::capabilities::Qcow2Tool;
use crate::error::Result;

pub struct DiskManager<'a> {
    tool: &'a dyn Qcow2Tool,
}

impl<'a> DiskManager<'a> {
    pub fn new(tool: &'a dyn Qcow2Tool) -> Self {
        Self { tool }
    }

    /// Create `overlay_path` as a copy-on-write overlay of `base_qcow2`.
    /// Overlay creation is metadata-only regardless of the base image's
    /// size, which is what makes per-VM disk provisioning fast enough for
    /// the cold-boot path to stay within its own timeout budget.
    pub async fn create_overlay(&self, base_qcow2: &Path, overlay_path: &Path) -> Result<()> {
        if let Some(parent) = overlay_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.tool.create(overlay_path, Some(base_qcow2), 0).await?;
        info!(overlay = %overlay_path.display(), base = %base_qcow2.display(), "created disk overlay");
        Ok(())
    }

    /// Grow `overlay_path` so its virtual size is at least
    /// `requested_gib`. A no-op if the overlay (which inherits the base
    /// image's virtual size) is already large enough.
    pub async fn ensure_minimum_size(&self, overlay_path: &Path, requested_gib: u32) -> Result<()> {
        let current = self.tool.virtual_size_gib(overlay_path).await?;
        if current < requested_gib {
            self.tool.resize(overlay_path, requested_gib).await?;
            info!(overlay = %overlay_path.display(), from = current, to = requested_gib, "grew disk overlay");
        }
        Ok(())
    }

    /// Create a standalone (non-overlay) qcow2 image of `size_gib`, used
    /// when a base image itself needs provisioning rather than a per-VM
    /// overlay.
    pub async fn create_standalone(&self, path: &Path, size_gib: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.tool.create(path, None, size_gib).await
    }
}

pub fn overlay_path_for(vm_dir: &Path) -> PathBuf {
    vm_dir.join("disk.qcow2")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubQcow2Tool {
        created_with_backing: Mutex<Option<PathBuf>>,
        reported_size_gib: Mutex<u32>,
        resized_to: Mutex<Option<u32>>,
    }

    #[async_trait]
    impl Qcow2Tool for StubQcow2Tool {
        async fn create(
            &self,
            _path: &Path,
            backing_file: Option<&Path>,
            _virtual_size_gib: u32,
        ) -> Result<()> {
            *self.created_with_backing.lock().unwrap() = backing_file.map(|p| p.to_path_buf());
            Ok(())
        }

        async fn virtual_size_gib(&self, _path: &Path) -> Result<u32> {
            Ok(*self.reported_size_gib.lock().unwrap())
        }

        async fn resize(&self, _path: &Path, new_size_gib: u32) -> Result<()> {
            *self.resized_to.lock().unwrap() = Some(new_size_gib);
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_overlay_passes_base_as_backing_file() {
        let tool = StubQcow2Tool::default();
        let dir = tempfile::tempdir().unwrap();
        let manager = DiskManager::new(&tool);
        let base = dir.path().join("base.qcow2");
        let overlay = dir.path().join("vm-1").join("disk.qcow2");
        manager.create_overlay(&base, &overlay).await.unwrap();
        assert_eq!(*tool.created_with_backing.lock().unwrap(), Some(base));
    }

    #[tokio::test]
    async fn ensure_minimum_size_skips_resize_when_large_enough() {
        let tool = StubQcow2Tool::default();
        *tool.reported_size_gib.lock().unwrap() = 20;
        let manager = DiskManager::new(&tool);
        manager
            .ensure_minimum_size(Path::new("/tmp/whatever.qcow2"), 10)
            .await
            .unwrap();
        assert_eq!(*tool.resized_to.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn ensure_minimum_size_resizes_when_too_small() {
        let tool = StubQcow2Tool::default();
        *tool.reported_size_gib.lock().unwrap() = 5;
        let manager = DiskManager::new(&tool);
        manager
            .ensure_minimum_size(Path::new("/tmp/whatever.qcow2"), 10)
            .await
            .unwrap();
        assert_eq!(*tool.resized_to.lock().unwrap(), Some(10));
    }
}
