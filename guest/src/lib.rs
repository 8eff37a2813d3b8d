//! Two-stage boot orchestrator for a headless virtio guest.
//!
//! Stage one (`guestboot-init`) runs as PID 1 from the initramfs: it loads
//! the kernel modules needed to reach the host share, locates the versioned
//! boot assets, composes an overlay root and hands off to stage two.
//! Stage two (`guestboot-stage2`) brings up networking, the clock and the
//! container prerequisites, then supervises the guest agent forever.

pub mod assets;
pub mod clock;
pub mod config;
pub mod container;
mod error;
pub mod logging;
pub mod logsink;
pub mod modules;
pub mod net;
pub mod pipeline;
pub mod pseudofs;
pub mod rescue;
pub mod retry;
pub mod rootfs;
pub mod share;
pub mod supervisor;
pub mod switch;

#[cfg(test)]
mod testing;

pub use error::BootError;
