use crate::error::MountError;
use std::path::{Path, PathBuf};

// thread-self: a thread that unshared its mount namespace sees its own table.
const MOUNTINFO: &str = "/proc/thread-self/mountinfo";

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub mount_point: PathBuf,
    pub fstype: String,
    pub source: String,
}

/// Snapshot of the calling process's mount table.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn read() -> Result<Self, MountError> {
        let content = std::fs::read_to_string(MOUNTINFO)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, MountError> {
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_line)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The topmost mount at `path`, if any.
    pub fn find(&self, path: &Path) -> Option<&MountEntry> {
        self.entries.iter().rev().find(|e| e.mount_point == path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.find(path).is_some()
    }

    /// Whether a filesystem of `fstype` is mounted at `path`.
    pub fn has_fstype(&self, path: &Path, fstype: &str) -> bool {
        self.find(path).is_some_and(|e| e.fstype == fstype)
    }
}

// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
fn parse_line(line: &str) -> Result<MountEntry, MountError> {
    let invalid = || MountError::InvalidSpec(format!("malformed mountinfo line: {}", line));

    let (pre, post) = line.split_once(" - ").ok_or_else(invalid)?;
    let mut pre = pre.split_whitespace();
    let mount_id = pre.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
    let parent_id = pre.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
    let mount_point = pre.nth(2).ok_or_else(invalid)?;

    let mut post = post.split_whitespace();
    let fstype = post.next().ok_or_else(invalid)?;
    let source = post.next().unwrap_or("none");

    Ok(MountEntry {
        mount_id,
        parent_id,
        mount_point: PathBuf::from(unescape(mount_point)),
        fstype: fstype.to_string(),
        source: unescape(source),
    })
}

/// Decode the octal escapes (`\040` etc.) the kernel uses for whitespace.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
