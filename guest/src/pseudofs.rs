//! Kernel pseudo filesystems for each stage.

use crate::BootError;
use guestboot_mount::{MountUnit, Mounter};
use std::path::Path;

struct Pseudo {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    options: &'static [&'static str],
}

/// Mounted by stage one before anything else. `/proc` comes first since
/// mount-table queries depend on it.
const EARLY: &[Pseudo] = &[
    Pseudo {
        source: "proc",
        target: "proc",
        fstype: "proc",
        options: &["nosuid", "nodev", "noexec"],
    },
    Pseudo {
        source: "sysfs",
        target: "sys",
        fstype: "sysfs",
        options: &["nosuid", "nodev", "noexec"],
    },
    Pseudo {
        source: "devtmpfs",
        target: "dev",
        fstype: "devtmpfs",
        options: &["nosuid", "mode=0755"],
    },
    Pseudo {
        source: "tmpfs",
        target: "run",
        fstype: "tmpfs",
        options: &["nosuid", "nodev", "mode=0755"],
    },
];

const RUNTIME: &[Pseudo] = &[
    Pseudo {
        source: "devpts",
        target: "dev/pts",
        fstype: "devpts",
        options: &["nosuid", "noexec", "mode=0620", "gid=5", "ptmxmode=0666"],
    },
    Pseudo {
        source: "shm",
        target: "dev/shm",
        fstype: "tmpfs",
        options: &["nosuid", "nodev", "mode=1777"],
    },
    Pseudo {
        source: "tmpfs",
        target: "tmp",
        fstype: "tmpfs",
        options: &["nosuid", "nodev", "mode=1777"],
    },
];

/// Mount `/proc`, `/sys`, `/dev` and `/run` below `root`. Targets that are
/// already mounted (e.g. a kernel-mounted devtmpfs) are left alone.
pub fn mount_early(mounter: &dyn Mounter, root: &Path) -> Result<(), BootError> {
    for fs in EARLY {
        mount_pseudo(mounter, root, fs)?;
    }
    Ok(())
}

/// Stage-two extras. Every entry is attempted.
pub fn mount_runtime(mounter: &dyn Mounter, root: &Path) -> Result<(), BootError> {
    let problems: Vec<String> = RUNTIME
        .iter()
        .filter_map(|fs| {
            mount_pseudo(mounter, root, fs)
                .err()
                .map(|e| format!("{}: {}", fs.target, e))
        })
        .collect();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(BootError::Degraded {
            step: "pseudofs".to_string(),
            problems,
        })
    }
}

fn mount_pseudo(mounter: &dyn Mounter, root: &Path, fs: &Pseudo) -> Result<(), BootError> {
    let target = root.join(fs.target);
    // Without /proc the table cannot be read; treat that as "not mounted".
    if mounter.is_mounted(&target).unwrap_or(false) {
        tracing::debug!(?target, "already mounted");
        return Ok(());
    }
    std::fs::create_dir_all(&target)?;
    mounter.mount(&MountUnit::new(fs.source, &target, fs.fstype, fs.options))?;
    tracing::debug!(?target, fstype = fs.fstype, "mounted");
    Ok(())
}
