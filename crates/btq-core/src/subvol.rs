//! Subvolume graph reconstruction and the subvolume ioctls.
//!
//! The listing is rebuilt from scratch on every call: enumerate root-tree
//! back-references, resolve each subvolume's local path inside its parent,
//! then stitch full paths together once every record is known (parents can
//! surface after their children in tree order). Nothing is cached here —
//! refresh policy belongs to the front-end.

use crate::mount::FilesystemHandle;
use crate::parse_to_helper_error;
use crate::search::{Continuation, SearchIter, TreeSearch, search_one};
use crate::sys;
use btq_error::{HelperError, Result};
use btq_ondisk::{InodeRef, RootRef, SearchKey, VolArgs, parse_dir_entries};
use btq_types::{
    DIR_ITEM_KEY, FIRST_FREE_OBJECTID, FS_TREE_OBJECTID, INODE_REF_KEY, IOC_SNAP_CREATE,
    IOC_SNAP_DESTROY, IOC_SUBVOL_CREATE, ITEM_TYPE_MAX, ROOT_BACKREF_KEY, ROOT_TREE_DIR_OBJECTID,
    ROOT_TREE_OBJECTID, SUBVOL_ROOT_INODE, name_to_string,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::os::unix::fs::MetadataExt;

/// One subvolume in the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeRecord {
    pub id: u64,
    pub name: String,
    pub parent: u64,
    /// Path of the containing directory within the parent subvolume.
    pub sv_path: Vec<String>,
    /// Path from the filesystem root, own name included.
    pub full_path: String,
    #[serde(rename = "default")]
    pub is_default: bool,
}

/// Enumerate every subvolume, resolve full paths, and mark the default.
pub fn list_subvolumes(trees: &dyn TreeSearch) -> Result<BTreeMap<u64, SubvolumeRecord>> {
    let mut records = BTreeMap::new();
    // The top-level tree has no back-reference; it anchors the listing so
    // the default flag has somewhere to land when no default is set.
    records.insert(
        FS_TREE_OBJECTID,
        SubvolumeRecord {
            id: FS_TREE_OBJECTID,
            name: String::new(),
            parent: 0,
            sv_path: Vec::new(),
            full_path: String::new(),
            is_default: false,
        },
    );

    let key = SearchKey::for_tree(ROOT_TREE_OBJECTID)
        .objectid_range(FIRST_FREE_OBJECTID, u64::MAX)
        .item_type_range(0, ITEM_TYPE_MAX);
    for item in SearchIter::new(trees, key, Continuation::TypeWraparound) {
        let item = item?;
        if item.header.item_type != u32::from(ROOT_BACKREF_KEY) {
            continue;
        }

        let (head, name) =
            RootRef::parse_with_name(&item.data).map_err(|e| parse_to_helper_error(&e))?;
        let id = item.header.objectid;
        let parent = item.header.offset;
        let sv_path = local_path(trees, parent, head.dirid)?;

        records.insert(
            id,
            SubvolumeRecord {
                id,
                name: name_to_string(name),
                parent,
                sv_path,
                full_path: String::new(),
                is_default: false,
            },
        );
    }

    resolve_full_paths(&mut records)?;

    if let Some(default_id) = default_subvolume(trees)? {
        match records.get_mut(&default_id) {
            Some(record) => record.is_default = true,
            None => {
                tracing::warn!(default_id, "default subvolume points at an unlisted tree");
            }
        }
    }

    Ok(records)
}

/// Resolve the path of `inode` within `tree` by walking inode references
/// up to the subvolume's root inode, then reversing into root-to-leaf
/// order.
fn local_path(trees: &dyn TreeSearch, tree: u64, inode: u64) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    let mut seen = HashSet::new();
    let mut inode = inode;

    while inode != SUBVOL_ROOT_INODE {
        if !seen.insert(inode) {
            return Err(HelperError::InconsistentMetadata {
                detail: format!("inode reference cycle at {inode} in tree {tree}"),
            });
        }

        let key = SearchKey::for_tree(tree)
            .objectid(inode)
            .item_type(INODE_REF_KEY)
            .offset_range(0, u64::MAX);
        let Some(item) = search_one(trees, key)? else {
            return Err(HelperError::MissingLink { tree, inode });
        };

        let (_, name) =
            InodeRef::parse_with_name(&item.data).map_err(|e| parse_to_helper_error(&e))?;
        segments.push(name_to_string(name));
        // The reference's key offset is the parent directory's inode.
        inode = item.header.offset;
    }

    segments.reverse();
    Ok(segments)
}

/// Stitch each record's full path from the filesystem root by walking the
/// parent chain. Runs after collection so discovery order cannot matter.
fn resolve_full_paths(records: &mut BTreeMap<u64, SubvolumeRecord>) -> Result<()> {
    let mut resolved: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    resolved.insert(FS_TREE_OBJECTID, Vec::new());

    let ids: Vec<u64> = records.keys().copied().collect();
    for id in ids {
        let mut chain = Vec::new();
        let segments = resolve_one(id, records, &mut resolved, &mut chain)?;
        if let Some(record) = records.get_mut(&id) {
            record.full_path = segments.join("/");
        }
    }
    Ok(())
}

fn resolve_one(
    id: u64,
    records: &BTreeMap<u64, SubvolumeRecord>,
    resolved: &mut BTreeMap<u64, Vec<String>>,
    chain: &mut Vec<u64>,
) -> Result<Vec<String>> {
    if let Some(done) = resolved.get(&id) {
        return Ok(done.clone());
    }
    if chain.contains(&id) {
        return Err(HelperError::InconsistentMetadata {
            detail: format!("subvolume parent chain contains a cycle at {id}"),
        });
    }

    let record = records.get(&id).ok_or_else(|| {
        HelperError::InconsistentMetadata {
            detail: format!("subvolume {id} is referenced as a parent but not listed"),
        }
    })?;

    chain.push(id);
    let mut segments = resolve_one(record.parent, records, resolved, chain)?;
    chain.pop();

    segments.extend(record.sv_path.iter().cloned());
    segments.push(record.name.clone());
    resolved.insert(id, segments.clone());
    Ok(segments)
}

/// Find the subvolume id the root tree's `"default"` dir item points at.
fn default_subvolume(trees: &dyn TreeSearch) -> Result<Option<u64>> {
    let key = SearchKey::for_tree(ROOT_TREE_OBJECTID)
        .objectid(ROOT_TREE_DIR_OBJECTID)
        .item_type(DIR_ITEM_KEY)
        .offset_range(0, u64::MAX);
    for item in SearchIter::new(trees, key, Continuation::Offset) {
        let item = item?;
        for entry in parse_dir_entries(&item.data).map_err(|e| parse_to_helper_error(&e))? {
            if entry.name == b"default" {
                return Ok(Some(entry.item.location.objectid));
            }
        }
    }
    Ok(None)
}

/// Split a root-relative path into its parent directory and final name.
fn split_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(HelperError::InvalidRequest {
            reason: "empty subvolume path".into(),
        });
    }
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => Ok((parent.to_owned(), name.to_owned())),
        None => Ok((String::new(), trimmed.to_owned())),
    }
}

fn encode_vol_args(fd: i64, name: String) -> Result<[u8; VolArgs::SIZE]> {
    VolArgs { fd, name }
        .to_bytes()
        .map_err(|e| parse_to_helper_error(&e))
}

/// Create an empty subvolume at `path`.
pub fn create(fs: &mut FilesystemHandle, path: &str) -> Result<()> {
    let (parent, name) = split_path(path)?;
    let parent_fd = fs.open_subpath(&parent)?;
    let mut args = encode_vol_args(0, name)?;
    sys::vol_args_ioctl(parent_fd, "subvol_create", IOC_SUBVOL_CREATE, &mut args)
}

/// Delete the subvolume at `path`.
pub fn delete(fs: &mut FilesystemHandle, path: &str) -> Result<()> {
    let (parent, name) = split_path(path)?;
    let parent_fd = fs.open_subpath(&parent)?;
    let mut args = encode_vol_args(0, name)?;
    sys::vol_args_ioctl(parent_fd, "snap_destroy", IOC_SNAP_DESTROY, &mut args)
}

/// Snapshot the subvolume at `source` to `dest`.
///
/// Both preconditions are checked before any ioctl: the source must be a
/// subvolume root (its directory inode is the fixed root inode number)
/// and the destination must not exist yet.
pub fn snapshot(fs: &mut FilesystemHandle, source: &str, dest: &str) -> Result<()> {
    let source_meta = std::fs::metadata(fs.subpath(source)).map_err(|_| {
        HelperError::InvalidRequest {
            reason: format!("snapshot source {source} does not exist"),
        }
    })?;
    if !source_meta.is_dir() || source_meta.ino() != SUBVOL_ROOT_INODE {
        return Err(HelperError::InvalidRequest {
            reason: format!("snapshot source {source} is not a subvolume"),
        });
    }
    if std::fs::symlink_metadata(fs.subpath(dest)).is_ok() {
        return Err(HelperError::InvalidRequest {
            reason: format!("snapshot destination {dest} already exists"),
        });
    }

    let source_fd = fs.open_subpath(source)?;
    let (dest_parent, dest_name) = split_path(dest)?;
    let parent_fd = fs.open_subpath(&dest_parent)?;
    let mut args = encode_vol_args(i64::from(source_fd), dest_name)?;
    sys::vol_args_ioctl(parent_fd, "snap_create", IOC_SNAP_CREATE, &mut args)
}

/// Make `subvol_id` the default subvolume.
pub fn set_default(fs: &FilesystemHandle, subvol_id: u64) -> Result<()> {
    sys::set_default_subvol(fs.root_fd(), subvol_id)
}
