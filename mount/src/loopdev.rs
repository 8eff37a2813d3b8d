use crate::error::MountError;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

// linux/loop.h
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LOOP_CONTROL: &str = "/dev/loop-control";
const MAX_ATTACH_ATTEMPTS: usize = 3;

/// Attach `image` to a free loop device and return the device path.
///
/// Another process may grab the device between `LOOP_CTL_GET_FREE` and
/// `LOOP_SET_FD`, in which case the kernel reports `EBUSY` and we ask for a
/// new one.
pub fn attach_loop(image: &Path, read_only: bool) -> Result<PathBuf, MountError> {
    let backing = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(image)
        .map_err(|e| MountError::LoopDevice(format!("open {:?}: {}", image, e)))?;

    let control = File::open(LOOP_CONTROL)
        .map_err(|e| MountError::LoopDevice(format!("open {}: {}", LOOP_CONTROL, e)))?;

    for _ in 0..MAX_ATTACH_ATTEMPTS {
        let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if index < 0 {
            return Err(MountError::LoopDevice(format!(
                "LOOP_CTL_GET_FREE: {}",
                std::io::Error::last_os_error()
            )));
        }

        let device_path = PathBuf::from(format!("/dev/loop{}", index));
        let device = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&device_path)
            .map_err(|e| MountError::LoopDevice(format!("open {:?}: {}", device_path, e)))?;

        let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD as _, backing.as_raw_fd()) };
        if rc == 0 {
            tracing::info!("Attached {:?} to {:?}", image, device_path);
            return Ok(device_path);
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EBUSY) {
            return Err(MountError::LoopDevice(format!("LOOP_SET_FD {:?}: {}", device_path, err)));
        }
        tracing::debug!("{:?} taken before attach, retrying", device_path);
    }

    Err(MountError::LoopDevice(format!(
        "no free loop device for {:?} after {} attempts",
        image, MAX_ATTACH_ATTEMPTS
    )))
}
