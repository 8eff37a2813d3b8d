//! virtio-fs shares exported by the host.

use crate::BootError;
use crate::config::ExtraShare;
use crate::retry::{PollResult, poll_until};
use guestboot_mount::{MountUnit, Mounter};
use std::path::Path;
use std::time::Duration;

pub fn mount_share(
    mounter: &dyn Mounter,
    tag: &str,
    target: &Path,
    read_only: bool,
) -> Result<(), BootError> {
    if mounter.is_mounted(target)? {
        return Ok(());
    }
    std::fs::create_dir_all(target)?;
    let options: &[&str] = if read_only { &["ro"] } else { &["rw"] };
    mounter.mount(&MountUnit::new(tag, target, "virtiofs", options))?;
    tracing::info!(tag, ?target, "share mounted");
    Ok(())
}

/// Retry mounting the boot share until the transport exposes the tag.
pub fn wait_for_share(
    mounter: &dyn Mounter,
    tag: &str,
    target: &Path,
    attempts: u32,
    interval: Duration,
) -> Result<(), BootError> {
    let mut last_error = None;
    let result = poll_until(
        || match mount_share(mounter, tag, target, false) {
            Ok(()) => true,
            Err(e) => {
                last_error = Some(e.to_string());
                false
            }
        },
        attempts,
        interval,
    );

    match result {
        PollResult::Found { attempt } => {
            tracing::debug!(tag, attempt, "share available");
            Ok(())
        }
        PollResult::TimedOut => Err(BootError::ShareUnavailable(format!(
            "{} after {} attempts: {}",
            tag,
            attempts,
            last_error.unwrap_or_else(|| "no attempts made".to_string())
        ))),
    }
}

/// Mount optional shares. Failures are collected, never fatal.
pub fn mount_extra_shares(mounter: &dyn Mounter, shares: &[ExtraShare]) -> Result<(), BootError> {
    let problems: Vec<String> = shares
        .iter()
        .filter_map(|share| {
            mount_share(mounter, &share.tag, &share.target, share.read_only)
                .err()
                .map(|e| format!("{}: {}", share.tag, e))
        })
        .collect();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(BootError::Degraded {
            step: "shares".to_string(),
            problems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MountCall, RecordingMounter};
    use guestboot_mount::MountError;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Fails the first `failures` mounts, as a share whose tag is not yet
    /// registered would.
    struct LateShare {
        inner: RecordingMounter,
        failures: Cell<u32>,
    }

    impl Mounter for LateShare {
        fn mount(&self, unit: &MountUnit) -> Result<(), MountError> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(MountError::MountFailed("ENOENT".to_string()));
            }
            self.inner.mount(unit)
        }

        fn move_mount(&self, from: &Path, to: &Path) -> Result<(), MountError> {
            self.inner.move_mount(from, to)
        }

        fn make_rprivate(&self, target: &Path) -> Result<(), MountError> {
            self.inner.make_rprivate(target)
        }

        fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
            self.inner.is_mounted(target)
        }

        fn unmount(&self, target: &Path) -> Result<(), MountError> {
            self.inner.unmount(target)
        }
    }

    #[test]
    fn test_share_appears_late() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("mnt/share");
        let mounter = LateShare {
            inner: RecordingMounter::default(),
            failures: Cell::new(2),
        };

        wait_for_share(&mounter, "bootshare", &target, 5, Duration::from_millis(1)).unwrap();
        assert!(mounter.inner.mounted_at(&target));
    }

    #[test]
    fn test_share_never_appears() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("mnt/share");
        let mounter = LateShare {
            inner: RecordingMounter::default(),
            failures: Cell::new(u32::MAX),
        };

        let err = wait_for_share(&mounter, "bootshare", &target, 3, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, BootError::ShareUnavailable(_)));
        assert!(err.to_string().contains("ENOENT"));
    }

    #[test]
    fn test_extra_share_failure_is_collected() {
        let dir = TempDir::new().unwrap();
        let shares = vec![
            ExtraShare {
                tag: "home".to_string(),
                target: dir.path().join("home/guest"),
                read_only: false,
            },
            ExtraShare {
                tag: "data".to_string(),
                target: dir.path().join("data"),
                read_only: true,
            },
        ];
        let mounter = RecordingMounter::default();
        mounter.fail_on(&shares[0].target);

        let err = mount_extra_shares(&mounter, &shares).unwrap_err();
        assert!(err.to_string().contains("home"));

        let calls = mounter.calls.borrow();
        match calls.last() {
            Some(MountCall::Mount(unit)) => {
                assert_eq!(unit.source, "data");
                assert_eq!(unit.fstype.as_deref(), Some("virtiofs"));
                assert!(unit.is_read_only());
            }
            other => panic!("unexpected call {:?}", other),
        }
    }
}
