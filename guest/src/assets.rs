//! Boot asset resolution.
//!
//! The kernel command line carries `<namespace>.boot_asset_version=<v>`,
//! which selects `boot/<v>/` on the external share. Both the root image and
//! the module archive must exist there before anything is mounted.

use crate::BootError;
use crate::config::BootConfig;
use std::path::{Path, PathBuf};

const PROC_CMDLINE: &str = "/proc/cmdline";

/// Parsed kernel command line.
#[derive(Debug, Clone, Default)]
pub struct BootCmdline {
    tokens: Vec<String>,
}

impl BootCmdline {
    pub fn read() -> Result<Self, BootError> {
        let content = std::fs::read_to_string(PROC_CMDLINE)?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        Self {
            tokens: content.split_whitespace().map(String::from).collect(),
        }
    }

    /// Value of the last `key=value` token for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tokens
            .iter()
            .rev()
            .find_map(|t| t.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
    }

    /// True for a bare `key` token or `key=1|true|yes`.
    pub fn flag(&self, key: &str) -> bool {
        if self.tokens.iter().any(|t| t == key) {
            return true;
        }
        matches!(self.get(key), Some("1" | "true" | "yes"))
    }
}

/// Resolved locations of one versioned asset set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPaths {
    pub version: String,
    pub dir: PathBuf,
    pub root_image: PathBuf,
    pub module_archive: PathBuf,
}

/// Resolve the boot asset set named on the command line.
pub fn locate(cmdline: &BootCmdline, config: &BootConfig) -> Result<AssetPaths, BootError> {
    let key = config.version_key();
    let version = match cmdline.get(&key) {
        Some(v) if !v.is_empty() => v,
        _ => return Err(BootError::MissingBootToken(key)),
    };

    validate_version(version)?;

    let dir = config.share.mountpoint.join("boot").join(version);
    let root_image = dir.join(&config.share.rootfs_image);
    let module_archive = dir.join(&config.share.module_archive);

    for path in [&root_image, &module_archive] {
        require_file(path)?;
    }

    tracing::info!(version, dir = %dir.display(), "boot assets located");

    Ok(AssetPaths {
        version: version.to_string(),
        dir,
        root_image,
        module_archive,
    })
}

// The version becomes a path component on a host-controlled share.
fn validate_version(version: &str) -> Result<(), BootError> {
    let acceptable = version != "."
        && version != ".."
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));

    if acceptable {
        Ok(())
    } else {
        Err(BootError::InvalidAssetVersion(version.to_string()))
    }
}

fn require_file(path: &Path) -> Result<(), BootError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(BootError::AssetMissing(path.to_path_buf())),
    }
}
