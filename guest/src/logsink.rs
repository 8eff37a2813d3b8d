//! Log target selection.
//!
//! A sink prefers a host-visible path on the shared directory and falls
//! back to a local path when that is not writable. The choice is made once,
//! when the sink is created.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    /// Neither path was writable; output goes to the console.
    Console,
}

#[derive(Debug, Clone)]
pub struct LogSink {
    target: LogTarget,
}

impl LogSink {
    pub fn select(primary: &Path, fallback: &Path) -> Self {
        Self::first_writable(&[primary, fallback])
    }

    /// A single file, or the console when it is not writable.
    pub fn file_or_console(path: &Path) -> Self {
        Self::first_writable(&[path])
    }

    fn first_writable(candidates: &[&Path]) -> Self {
        for &candidate in candidates {
            match probe(candidate) {
                Ok(()) => {
                    return Self {
                        target: LogTarget::File(candidate.to_path_buf()),
                    };
                }
                Err(e) => {
                    tracing::debug!("Log path {:?} not writable: {}", candidate, e);
                }
            }
        }

        Self {
            target: LogTarget::Console,
        }
    }

    pub fn console() -> Self {
        Self {
            target: LogTarget::Console,
        }
    }

    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            LogTarget::File(path) => Some(path),
            LogTarget::Console => None,
        }
    }

    /// Open the target for appending. `None` means console output.
    pub fn open(&self) -> std::io::Result<Option<File>> {
        match &self.target {
            LogTarget::File(path) => open_append(path).map(Some),
            LogTarget::Console => Ok(None),
        }
    }
}

fn probe(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    open_append(path).map(drop)
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_primary_preferred() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("share/logs/agent.log");
        let fallback = dir.path().join("local/agent.log");

        let sink = LogSink::select(&primary, &fallback);
        assert_eq!(sink.target(), &LogTarget::File(primary.clone()));
        assert!(primary.exists());
        assert!(!fallback.exists());
    }

    #[test]
    fn test_fallback_when_primary_unwritable() {
        let dir = TempDir::new().unwrap();
        // A regular file where the primary's parent directory should be.
        let blocker = dir.path().join("share");
        std::fs::write(&blocker, b"").unwrap();
        let primary = blocker.join("logs/agent.log");
        let fallback = dir.path().join("local/agent.log");

        let sink = LogSink::select(&primary, &fallback);
        assert_eq!(sink.path(), Some(fallback.as_path()));

        let mut file = sink.open().unwrap().unwrap();
        writeln!(file, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&fallback).unwrap(), "hello\n");
    }

    #[test]
    fn test_console_when_nothing_writable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let sink = LogSink::select(&blocker.join("a/x.log"), &blocker.join("b/x.log"));
        assert_eq!(sink.target(), &LogTarget::Console);
        assert!(sink.open().unwrap().is_none());
    }

    #[test]
    fn test_selection_is_not_reevaluated() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("share/agent.log");
        let fallback = dir.path().join("local/agent.log");

        let sink = LogSink::select(&primary, &fallback);
        std::fs::remove_dir_all(dir.path().join("share")).unwrap();

        assert_eq!(sink.path(), Some(primary.as_path()));
        assert!(sink.open().is_err());
    }
}
