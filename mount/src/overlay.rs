use crate::MountUnit;
use crate::error::MountError;
use std::path::{Path, PathBuf};

/// The three directories an overlay mount is assembled from.
///
/// `upperdir` and `workdir` must live on the same writable filesystem and
/// must be created only after that filesystem is mounted, otherwise the
/// mount hides them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub lowerdir: PathBuf,
    pub upperdir: PathBuf,
    pub workdir: PathBuf,
}

impl OverlaySpec {
    pub fn new(lowerdir: impl Into<PathBuf>, upperdir: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            lowerdir: lowerdir.into(),
            upperdir: upperdir.into(),
            workdir: workdir.into(),
        }
    }

    /// Create the upper and work directories.
    pub fn prepare_dirs(&self) -> Result<(), MountError> {
        std::fs::create_dir_all(&self.upperdir)?;
        std::fs::create_dir_all(&self.workdir)?;
        Ok(())
    }

    /// Build the mount unit for assembling this overlay at `target`.
    pub fn to_unit(&self, target: &Path) -> Result<MountUnit, MountError> {
        for dir in [&self.lowerdir, &self.upperdir, &self.workdir] {
            let s = dir.to_string_lossy();
            if s.contains(',') || s.contains(':') {
                return Err(MountError::InvalidSpec(format!(
                    "overlay directory contains a separator: {}",
                    s
                )));
            }
        }

        Ok(MountUnit {
            source: "overlay".to_string(),
            target: target.to_path_buf(),
            fstype: Some("overlay".to_string()),
            options: vec![
                format!("lowerdir={}", self.lowerdir.display()),
                format!("upperdir={}", self.upperdir.display()),
                format!("workdir={}", self.workdir.display()),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_unit() {
        let spec = OverlaySpec::new("/run/overlay/base", "/run/overlay/rw/upper", "/run/overlay/rw/work");
        let unit = spec.to_unit(Path::new("/newroot")).unwrap();

        assert_eq!(unit.fstype.as_deref(), Some("overlay"));
        assert_eq!(unit.options.len(), 3);

        let (_, data) = unit.split_options();
        assert_eq!(
            data.as_deref(),
            Some("lowerdir=/run/overlay/base,upperdir=/run/overlay/rw/upper,workdir=/run/overlay/rw/work")
        );
    }

    #[test]
    fn test_overlay_rejects_separators() {
        let spec = OverlaySpec::new("/a:b", "/upper", "/work");
        assert!(matches!(
            spec.to_unit(Path::new("/newroot")),
            Err(MountError::InvalidSpec(_))
        ));
    }
}
