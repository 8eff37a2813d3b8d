//! Test doubles shared by the orchestration tests.

use guestboot_mount::{MountError, MountUnit, Mounter};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount(MountUnit),
    Move(PathBuf, PathBuf),
    Rprivate(PathBuf),
    Unmount(PathBuf),
}

/// Mounter that keeps an in-memory mount table and records every call.
/// Targets are created on disk so directory-ordering checks still work.
#[derive(Default)]
pub struct RecordingMounter {
    pub calls: RefCell<Vec<MountCall>>,
    pub mounted: RefCell<BTreeSet<PathBuf>>,
    /// Mount targets (or move destinations) that fail.
    pub fail_on: RefCell<BTreeSet<PathBuf>>,
    pub fail_rprivate: bool,
}

impl RecordingMounter {
    pub fn with_mounted<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mounter = Self::default();
        mounter
            .mounted
            .borrow_mut()
            .extend(paths.iter().map(|p| p.as_ref().to_path_buf()));
        mounter
    }

    pub fn fail_on(&self, path: &Path) {
        self.fail_on.borrow_mut().insert(path.to_path_buf());
    }

    pub fn mounted_at(&self, path: &Path) -> bool {
        self.mounted.borrow().contains(path)
    }

    pub fn mount_targets(&self) -> Vec<PathBuf> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                MountCall::Mount(unit) => Some(unit.target.clone()),
                _ => None,
            })
            .collect()
    }

    fn check(&self, path: &Path) -> Result<(), MountError> {
        if self.fail_on.borrow().contains(path) {
            Err(MountError::MountFailed(format!("injected failure at {:?}", path)))
        } else {
            Ok(())
        }
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, unit: &MountUnit) -> Result<(), MountError> {
        self.calls.borrow_mut().push(MountCall::Mount(unit.clone()));
        self.check(&unit.target)?;
        std::fs::create_dir_all(&unit.target)?;
        self.mounted.borrow_mut().insert(unit.target.clone());
        Ok(())
    }

    fn move_mount(&self, from: &Path, to: &Path) -> Result<(), MountError> {
        self.calls
            .borrow_mut()
            .push(MountCall::Move(from.to_path_buf(), to.to_path_buf()));
        self.check(to)?;
        if !self.mounted.borrow_mut().remove(from) {
            return Err(MountError::MountFailed(format!("{:?} is not a mountpoint", from)));
        }
        self.mounted.borrow_mut().insert(to.to_path_buf());
        Ok(())
    }

    fn make_rprivate(&self, target: &Path) -> Result<(), MountError> {
        self.calls
            .borrow_mut()
            .push(MountCall::Rprivate(target.to_path_buf()));
        if self.fail_rprivate {
            return Err(MountError::MountFailed("injected rprivate failure".to_string()));
        }
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        Ok(self.mounted_at(target))
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.calls
            .borrow_mut()
            .push(MountCall::Unmount(target.to_path_buf()));
        self.mounted.borrow_mut().remove(target);
        Ok(())
    }
}

/// Move the calling test thread into a private mount namespace.
///
/// Returns false when not running as root or when namespaces are
/// unavailable; privileged tests skip themselves in that case.
pub fn enter_private_mount_namespace() -> bool {
    use nix::mount::{MsFlags, mount};
    use nix::sched::{CloneFlags, unshare};

    if !nix::unistd::Uid::effective().is_root() {
        return false;
    }
    if unshare(CloneFlags::CLONE_NEWNS).is_err() {
        return false;
    }
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .is_ok()
}
