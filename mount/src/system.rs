use crate::error::MountError;
use crate::loopdev::attach_loop;
use crate::mountinfo::MountTable;
use crate::{MountUnit, Mounter};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::path::Path;

/// [`Mounter`] backed by the real mount(2) family of syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, unit: &MountUnit) -> Result<(), MountError> {
        std::fs::create_dir_all(&unit.target)?;

        if unit.is_bind() {
            mount_bind(unit)
        } else {
            mount_fs(unit)
        }
    }

    fn move_mount(&self, from: &Path, to: &Path) -> Result<(), MountError> {
        std::fs::create_dir_all(to)?;

        tracing::debug!("Moving mount {:?} to {:?}", from, to);

        mount(Some(from), to, None::<&str>, MsFlags::MS_MOVE, None::<&str>).map_err(|e| {
            MountError::MoveFailed {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!("Moved mount {:?} to {:?}", from, to);
        Ok(())
    }

    fn make_rprivate(&self, target: &Path) -> Result<(), MountError> {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| MountError::MountFailed(format!("make-rprivate {:?}: {}", target, e)))?;

        tracing::info!("Marked {:?} recursively private", target);
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        Ok(MountTable::read()?.contains(target))
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        tracing::debug!("Unmounting {:?}", target);

        umount2(target, MntFlags::MNT_DETACH)
            .map_err(|e| MountError::UnmountFailed(format!("unmount failed: {}", e)))?;

        tracing::info!("Unmounted {:?}", target);
        Ok(())
    }
}

fn mount_fs(unit: &MountUnit) -> Result<(), MountError> {
    let (flags, data) = unit.split_options();
    let fstype = unit
        .fstype
        .as_deref()
        .ok_or_else(|| MountError::InvalidSpec(format!("no filesystem type for {:?}", unit.target)))?;

    let source = if unit.wants_loop() {
        let device = attach_loop(Path::new(&unit.source), unit.is_read_only())?;
        device.to_string_lossy().into_owned()
    } else {
        unit.source.clone()
    };

    tracing::info!(
        "Mounting {} ({}) at {:?} with flags {:?}, data {:?}",
        source,
        fstype,
        unit.target,
        flags,
        data
    );

    mount(
        Some(source.as_str()),
        unit.target.as_path(),
        Some(fstype),
        flags,
        data.as_deref(),
    )
    .map_err(|e| MountError::MountFailed(format!("{} mount at {:?} failed: {}", fstype, unit.target, e)))?;

    Ok(())
}

fn mount_bind(unit: &MountUnit) -> Result<(), MountError> {
    let source = Path::new(&unit.source);
    let (flags, _) = unit.split_options();
    let bind_flags = flags & (MsFlags::MS_BIND | MsFlags::MS_REC);

    tracing::info!(
        "Bind mounting {:?} to {:?} with flags {:?}, options {:?}",
        source,
        unit.target,
        bind_flags,
        unit.options
    );

    mount(Some(source), unit.target.as_path(), None::<&str>, bind_flags, None::<&str>)
        .map_err(|e| MountError::MountFailed(format!("bind mount failed: {}", e)))?;

    // MS_RDONLY is ignored on the initial bind; it needs a remount.
    if unit.is_read_only() {
        mount(
            None::<&str>,
            unit.target.as_path(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| MountError::MountFailed(format!("remount read-only failed: {}", e)))?;
    }

    Ok(())
}
