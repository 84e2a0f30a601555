//! Plain directory listing inside a mounted filesystem.

use crate::mount::FilesystemHandle;
use btq_error::Result;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;

/// One directory entry: name, raw mode bits, inode number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryRecord {
    pub name: String,
    pub mode: u32,
    pub inode: u64,
}

/// Entry-type filter for a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeFilter {
    #[default]
    All,
    Dir,
    Block,
}

impl TypeFilter {
    /// Parse a filter name as it appears on the wire.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "all" => Some(Self::All),
            "dir" => Some(Self::Dir),
            "block" => Some(Self::Block),
            _ => None,
        }
    }

    fn matches(self, mode: u32) -> bool {
        let fmt = mode & libc::S_IFMT;
        match self {
            Self::All => true,
            Self::Dir => fmt == libc::S_IFDIR,
            Self::Block => fmt == libc::S_IFBLK,
        }
    }
}

/// List the directory at `path` beneath the mounted root, name-sorted.
///
/// `path` is treated as root-relative; pass `.` (or an empty path) for
/// the root directory itself.
pub fn ls(fs: &FilesystemHandle, path: &str, filter: TypeFilter) -> Result<Vec<DirEntryRecord>> {
    let dir = fs.subpath(path);
    let mut entries = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let mode = meta.mode();
        if !filter.matches(mode) {
            continue;
        }
        entries.push(DirEntryRecord {
            name: entry.file_name().to_string_lossy().into_owned(),
            mode,
            inode: meta.ino(),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{MountTable, Mounter};
    use btq_error::Result as HelperResult;
    use std::fs;
    use std::path::Path;

    /// Mounts nothing; the mount point directory itself is the "filesystem".
    struct NullMounter;
    impl Mounter for NullMounter {
        fn mount(&self, _uuid: &str, _target: &Path) -> HelperResult<()> {
            Ok(())
        }
        fn unmount(&self, _target: &Path) -> HelperResult<()> {
            Ok(())
        }
    }

    const UUID: &str = "12345678-9abc-def0-0123-456789abcdef";

    #[test]
    fn lists_sorted_and_filtered() {
        let table = MountTable::new(Box::new(NullMounter));
        let handle = table.acquire(UUID).expect("acquire");

        fs::create_dir(handle.root_path().join("zeta")).expect("mkdir");
        fs::create_dir(handle.root_path().join("alpha")).expect("mkdir");
        fs::write(handle.root_path().join("file.txt"), b"x").expect("write");

        let all = ls(&handle, ".", TypeFilter::All).expect("ls");
        let names: Vec<&str> = all.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "file.txt", "zeta"]);
        assert!(all.iter().all(|e| e.inode != 0));

        let dirs = ls(&handle, "/", TypeFilter::Dir).expect("ls dirs");
        let names: Vec<&str> = dirs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        for entry in &dirs {
            assert_eq!(entry.mode & libc::S_IFMT, libc::S_IFDIR);
        }

        let blocks = ls(&handle, "", TypeFilter::Block).expect("ls blocks");
        assert!(blocks.is_empty());

        handle.release();
        table.cleanup();
    }

    #[test]
    fn listing_missing_directory_fails() {
        let table = MountTable::new(Box::new(NullMounter));
        let handle = table.acquire(UUID).expect("acquire");
        assert!(ls(&handle, "no/such/dir", TypeFilter::All).is_err());
        table.cleanup();
    }

    #[test]
    fn filter_names() {
        assert_eq!(TypeFilter::parse("all"), Some(TypeFilter::All));
        assert_eq!(TypeFilter::parse("dir"), Some(TypeFilter::Dir));
        assert_eq!(TypeFilter::parse("block"), Some(TypeFilter::Block));
        assert_eq!(TypeFilter::parse("socket"), None);
    }
}
