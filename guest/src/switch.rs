//! Hand-off from stage one to stage two.
//!
//! Live mounts are moved (not remounted) into the staged root, the module
//! archive is made available under the staged root's module tree, and the
//! current process image is replaced by the staged root's entry program.
//! Nothing else from stage one survives.

use crate::BootError;
use guestboot_mount::{MountUnit, Mounter};
use nix::mount::MsFlags;
use nix::unistd::{chdir, chroot, execv};
use std::convert::Infallible;
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Location of a path from the current root inside the staged root.
pub fn under(staging: &Path, path: &Path) -> PathBuf {
    staging.join(path.strip_prefix("/").unwrap_or(path))
}

pub struct Handoff<'a> {
    mounter: &'a dyn Mounter,
    staging: PathBuf,
    relocations: Vec<PathBuf>,
    init: PathBuf,
}

impl<'a> Handoff<'a> {
    pub fn new(mounter: &'a dyn Mounter, staging: &Path, init: &Path) -> Self {
        Self {
            mounter,
            staging: staging.to_path_buf(),
            relocations: ["/proc", "/sys", "/dev"].iter().map(PathBuf::from).collect(),
            init: init.to_path_buf(),
        }
    }

    /// Also carry the mount at `path` into the staged root.
    pub fn relocate(mut self, path: &Path) -> Self {
        self.relocations.push(path.to_path_buf());
        self
    }

    /// Move every relocated mount into the staged root. Paths that are not
    /// mountpoints are skipped. Returns the new locations.
    pub fn relocate_mounts(&self) -> Result<Vec<PathBuf>, BootError> {
        let mut moved = Vec::new();

        for source in &self.relocations {
            let destination = under(&self.staging, source);
            std::fs::create_dir_all(&destination)?;

            if !self.mounter.is_mounted(source)? {
                tracing::warn!("{:?} is not mounted, nothing to relocate", source);
                continue;
            }

            self.mounter
                .move_mount(source, &destination)
                .map_err(|e| BootError::Handoff(e.to_string()))?;
            moved.push(destination);
        }

        Ok(moved)
    }

    /// Mount the module archive inside the staged root and bind it over
    /// `lib/modules/<release>`, so stage two can still load modules once
    /// the initramfs is gone.
    pub fn attach_module_archive(&self, archive: &Path, fstype: &str, release: &str) -> Result<PathBuf, BootError> {
        let archive_mount = self.staging.join("mnt/modules");
        let unit = MountUnit::new(&archive.to_string_lossy(), &archive_mount, fstype, &["ro", "loop"]);
        self.mounter
            .mount(&unit)
            .map_err(|e| BootError::Handoff(format!("module archive {:?}: {}", archive, e)))?;

        let tree = self.staging.join("lib/modules").join(release);
        self.mounter
            .mount(&MountUnit::bind(&archive_mount, &tree, true))
            .map_err(|e| BootError::Handoff(format!("module tree bind {:?}: {}", tree, e)))?;

        tracing::info!(tree = %tree.display(), "module archive attached");
        Ok(tree)
    }

    /// Preconditions that must hold before anything is moved.
    pub fn check(&self) -> Result<(), BootError> {
        if !self.mounter.is_mounted(&self.staging)? {
            return Err(BootError::Handoff(format!(
                "staged root {:?} is not a mountpoint",
                self.staging
            )));
        }

        let entry = under(&self.staging, &self.init);
        if !entry.exists() {
            return Err(BootError::Handoff(format!("entry program {:?} missing", entry)));
        }
        Ok(())
    }

    /// Run the whole hand-off. Only returns on failure.
    pub fn handoff(self, archive: &Path, fstype: &str, release: &str) -> Result<Infallible, BootError> {
        self.prepare(archive, fstype, release)?;
        self.switch_root()
    }

    /// Everything up to the root switch. The archive is attached while
    /// `/dev` and the share are still at their original locations.
    fn prepare(&self, archive: &Path, fstype: &str, release: &str) -> Result<(), BootError> {
        self.check()?;
        self.attach_module_archive(archive, fstype, release)?;
        self.relocate_mounts()?;
        Ok(())
    }

    /// Make the staged root `/` and exec the entry program in place.
    fn switch_root(&self) -> Result<Infallible, BootError> {
        let init = CString::new(self.init.as_os_str().as_encoded_bytes())
            .map_err(|e| BootError::Handoff(format!("entry program path: {}", e)))?;

        tracing::info!(
            root = %self.staging.display(),
            init = %self.init.display(),
            "switching root"
        );

        chdir(self.staging.as_path())?;
        nix::mount::mount(
            Some("."),
            "/",
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .map_err(|e| BootError::Handoff(format!("moving staged root onto /: {}", e)))?;
        chroot(".")?;
        chdir("/")?;

        let err = match execv(&init, &[&init]) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        Err(BootError::Handoff(format!("exec {:?}: {}", self.init, err)))
    }
}
