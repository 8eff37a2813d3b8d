//! Mount primitives for the guest boot sequence.
//!
//! Everything that touches the kernel mount table goes through the
//! [`Mounter`] trait so the orchestration logic can be exercised against a
//! recording implementation in tests.

mod error;
mod loopdev;
mod mountinfo;
mod overlay;
mod system;

pub use error::MountError;
pub use loopdev::attach_loop;
pub use mountinfo::{MountEntry, MountTable};
pub use overlay::OverlaySpec;
pub use system::SystemMounter;

use nix::mount::MsFlags;
use std::path::{Path, PathBuf};

/// A single mount to be established.
///
/// `options` mixes flag-like options (`ro`, `nosuid`, `loop`, ...) with
/// filesystem data (`lowerdir=...`, `size=...`); [`MountUnit::split_options`]
/// separates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountUnit {
    pub source: String,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub options: Vec<String>,
}

impl MountUnit {
    pub fn new(source: &str, target: impl Into<PathBuf>, fstype: &str, options: &[&str]) -> Self {
        Self {
            source: source.to_string(),
            target: target.into(),
            fstype: Some(fstype.to_string()),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    pub fn bind(source: impl AsRef<Path>, target: impl Into<PathBuf>, read_only: bool) -> Self {
        let mut options = vec!["bind".to_string()];
        if read_only {
            options.push("ro".to_string());
        }
        Self {
            source: source.as_ref().to_string_lossy().into_owned(),
            target: target.into(),
            fstype: None,
            options,
        }
    }

    pub fn is_bind(&self) -> bool {
        self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    pub fn wants_loop(&self) -> bool {
        self.options.iter().any(|o| o == "loop")
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Split options into mount flags and the comma-joined data string.
    pub fn split_options(&self) -> (MsFlags, Option<String>) {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();

        for opt in &self.options {
            match opt.as_str() {
                "ro" => flags |= MsFlags::MS_RDONLY,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "noatime" => flags |= MsFlags::MS_NOATIME,
                "relatime" => flags |= MsFlags::MS_RELATIME,
                "bind" => flags |= MsFlags::MS_BIND,
                "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
                "loop" | "rw" | "defaults" => {}
                other => data.push(other),
            }
        }

        let data = if data.is_empty() {
            None
        } else {
            Some(data.join(","))
        };
        (flags, data)
    }
}

/// Operations on the mount namespace.
pub trait Mounter {
    /// Establish `unit`, creating the target directory first.
    fn mount(&self, unit: &MountUnit) -> Result<(), MountError>;

    /// Move an active mount to a new location (`mount --move`).
    fn move_mount(&self, from: &Path, to: &Path) -> Result<(), MountError>;

    /// Recursively mark everything under `target` as private propagation.
    fn make_rprivate(&self, target: &Path) -> Result<(), MountError>;

    /// Whether `target` is itself a mountpoint.
    fn is_mounted(&self, target: &Path) -> Result<bool, MountError>;

    fn unmount(&self, target: &Path) -> Result<(), MountError>;
}
