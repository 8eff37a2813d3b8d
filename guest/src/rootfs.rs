//! Writable root composition.
//!
//! The staged root is an overlay of the read-only base image and a tmpfs
//! writable layer. The initramfs root itself is never used as the final
//! root: it has no distinct parent mount, which breaks `pivot_root(2)` for
//! container runtimes later on. A freshly created overlay mount does not
//! have that problem.

use crate::BootError;
use guestboot_mount::{MountUnit, Mounter, OverlaySpec};
use std::path::{Path, PathBuf};

/// Directory layout used while composing the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout {
    /// Mountpoint of the read-only base image.
    pub base: PathBuf,
    /// Mountpoint of the tmpfs writable layer.
    pub writable: PathBuf,
    /// Where the merged root is assembled.
    pub staging: PathBuf,
}

impl RootLayout {
    pub fn new(scratch: &Path, staging: &Path) -> Self {
        Self {
            base: scratch.join("base"),
            writable: scratch.join("rw"),
            staging: staging.to_path_buf(),
        }
    }

    pub fn upper(&self) -> PathBuf {
        self.writable.join("upper")
    }

    pub fn work(&self) -> PathBuf {
        self.writable.join("work")
    }
}

pub struct RootComposer<'a> {
    mounter: &'a dyn Mounter,
    layout: RootLayout,
    image_fstype: String,
    tmpfs_size: Option<String>,
}

impl<'a> RootComposer<'a> {
    pub fn new(mounter: &'a dyn Mounter, layout: RootLayout, image_fstype: &str) -> Self {
        Self {
            mounter,
            layout,
            image_fstype: image_fstype.to_string(),
            tmpfs_size: None,
        }
    }

    pub fn with_tmpfs_size(mut self, size: Option<String>) -> Self {
        self.tmpfs_size = size;
        self
    }

    pub fn layout(&self) -> &RootLayout {
        &self.layout
    }

    /// Mount `image` read-only and assemble the writable root over it.
    pub fn compose(&self, image: &Path) -> Result<(), BootError> {
        self.mount_base(image)?;
        self.compose_over(&self.layout.base)
    }

    /// Assemble the writable root with `lower` as the read-only layer.
    pub fn compose_over(&self, lower: &Path) -> Result<(), BootError> {
        self.mount_writable()?;

        // Only now: created before the tmpfs mount they would be hidden by it.
        let overlay = OverlaySpec::new(lower, self.layout.upper(), self.layout.work());
        overlay
            .prepare_dirs()
            .map_err(|e| BootError::Compose(format!("creating upper/work: {}", e)))?;

        let unit = overlay
            .to_unit(&self.layout.staging)
            .map_err(|e| BootError::Compose(e.to_string()))?;
        self.mounter
            .mount(&unit)
            .map_err(|e| BootError::Compose(format!("overlay assembly at {:?}: {}", self.layout.staging, e)))?;

        tracing::info!(
            lower = %lower.display(),
            staging = %self.layout.staging.display(),
            "writable root assembled"
        );
        Ok(())
    }

    fn mount_base(&self, image: &Path) -> Result<(), BootError> {
        let source = image.to_string_lossy();
        let unit = MountUnit::new(&source, &self.layout.base, &self.image_fstype, &["ro", "loop"]);
        self.mounter
            .mount(&unit)
            .map_err(|e| BootError::Compose(format!("base image {:?}: {}", image, e)))
    }

    fn mount_writable(&self) -> Result<(), BootError> {
        let mut options = vec!["nosuid".to_string(), "mode=0755".to_string()];
        if let Some(size) = &self.tmpfs_size {
            options.push(format!("size={}", size));
        }
        let unit = MountUnit {
            source: "tmpfs".to_string(),
            target: self.layout.writable.clone(),
            fstype: Some("tmpfs".to_string()),
            options,
        };
        self.mounter
            .mount(&unit)
            .map_err(|e| BootError::Compose(format!("writable layer {:?}: {}", self.layout.writable, e)))
    }
}
