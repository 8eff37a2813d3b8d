//! Prerequisites for a nested OCI container runtime.

use crate::BootError;
use crate::config::ContainerSettings;
use guestboot_mount::{MountUnit, Mounter};
use std::path::Path;

/// Prepare cgroups, writable image storage, forwarding and mount
/// propagation. Every sub-step is attempted; problems are collected into
/// a single `Degraded` error. Private propagation is always applied last.
pub fn prepare_container_runtime(
    mounter: &dyn Mounter,
    settings: &ContainerSettings,
) -> Result<(), BootError> {
    let mut problems = Vec::new();

    if let Err(e) = mount_cgroup2(mounter, &settings.cgroup_mountpoint) {
        problems.push(format!("cgroup2: {}", e));
    }

    if let Err(e) = mount_storage(mounter, settings) {
        problems.push(format!("container storage: {}", e));
    }

    if let Err(e) = enable_forwarding(&settings.ip_forward) {
        problems.push(format!("ip forwarding: {}", e));
    }

    match mounter.make_rprivate(&settings.propagation_root) {
        Ok(()) => tracing::info!(root = ?settings.propagation_root, "mount propagation set to private"),
        Err(e) => problems.push(format!("private propagation: {}", e)),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(BootError::Degraded {
            step: "containers".to_string(),
            problems,
        })
    }
}

fn mount_cgroup2(mounter: &dyn Mounter, target: &Path) -> Result<(), BootError> {
    if mounter.is_mounted(target)? {
        tracing::debug!(?target, "cgroup2 already mounted");
        return Ok(());
    }
    std::fs::create_dir_all(target)?;
    mounter.mount(&MountUnit::new(
        "cgroup2",
        target,
        "cgroup2",
        &["nosuid", "nodev", "noexec", "nsdelegate"],
    ))?;
    tracing::info!(?target, "cgroup2 mounted");
    Ok(())
}

// The base image is squashfs, which an overlay cannot use as an upper
// layer, so image storage lives on tmpfs.
fn mount_storage(mounter: &dyn Mounter, settings: &ContainerSettings) -> Result<(), BootError> {
    let target = &settings.storage_dir;
    if mounter.is_mounted(target)? {
        return Ok(());
    }
    std::fs::create_dir_all(target)?;

    let size = settings.storage_tmpfs_size.as_ref().map(|s| format!("size={}", s));
    let mut options = vec!["nodev", "mode=0700"];
    if let Some(size) = size.as_deref() {
        options.push(size);
    }
    mounter.mount(&MountUnit::new("tmpfs", target, "tmpfs", &options))?;
    tracing::info!(?target, "container storage mounted");
    Ok(())
}

fn enable_forwarding(path: &Path) -> Result<(), BootError> {
    std::fs::write(path, b"1\n")?;
    Ok(())
}
