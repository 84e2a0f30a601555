#![forbid(unsafe_code)]
//! Shared constants, key spaces, and byte-level helpers for the btrquery
//! helper.
//!
//! Everything here mirrors the kernel's btrfs ABI: tree object ids, item
//! type keys, ioctl request numbers, and the little-endian field readers
//! the record codec is built from.

use thiserror::Error;

// ── Well-known tree object ids ──────────────────────────────────────────────

/// The tree of tree roots.
pub const ROOT_TREE_OBJECTID: u64 = 1;
/// Extent allocation tree (block group items live here).
pub const EXTENT_TREE_OBJECTID: u64 = 2;
/// Chunk tree: logical→physical mapping and device items.
pub const CHUNK_TREE_OBJECTID: u64 = 3;
/// Device tree: per-device extent records.
pub const DEV_TREE_OBJECTID: u64 = 4;
/// The top-level filesystem tree.
pub const FS_TREE_OBJECTID: u64 = 5;
/// Directory holding the default-subvolume dir item in the root tree.
pub const ROOT_TREE_DIR_OBJECTID: u64 = 6;
/// Checksum tree.
pub const CSUM_TREE_OBJECTID: u64 = 7;

/// Object id of device items within the chunk tree.
pub const DEV_ITEMS_OBJECTID: u64 = 1;
/// First object id assignable to user-created trees and inodes.
pub const FIRST_FREE_OBJECTID: u64 = 256;
/// First chunk tree object id.
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/// Inode number of every subvolume's root directory.
pub const SUBVOL_ROOT_INODE: u64 = 256;

// ── Item type keys ──────────────────────────────────────────────────────────

pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const XATTR_ITEM_KEY: u8 = 24;
pub const DIR_ITEM_KEY: u8 = 84;
pub const DIR_INDEX_KEY: u8 = 96;
pub const EXTENT_DATA_KEY: u8 = 108;
pub const ROOT_ITEM_KEY: u8 = 132;
pub const ROOT_BACKREF_KEY: u8 = 144;
pub const ROOT_REF_KEY: u8 = 156;
pub const EXTENT_ITEM_KEY: u8 = 168;
pub const BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const DEV_EXTENT_KEY: u8 = 204;
pub const DEV_ITEM_KEY: u8 = 216;
pub const CHUNK_ITEM_KEY: u8 = 228;

/// Highest value in the item-type key space (types are a `u8`).
pub const ITEM_TYPE_MAX: u8 = 255;

// ── Block group type flags ──────────────────────────────────────────────────

pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BLOCK_GROUP_RAID10: u64 = 1 << 6;

// ── ioctl request numbers ───────────────────────────────────────────────────
//
// Encoded exactly as the kernel's _IOW/_IOWR macros do on every Linux
// target this helper supports: dir<<30 | size<<16 | type<<8 | nr.

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | (ty << 8) | nr
}

const fn iow(ty: u64, nr: u64, size: u64) -> u64 {
    ioc(IOC_WRITE, ty, nr, size)
}

const fn iowr(ty: u64, nr: u64, size: u64) -> u64 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// btrfs ioctl magic.
pub const BTRFS_IOCTL_MAGIC: u64 = 0x94;

/// Size of `struct btrfs_ioctl_vol_args` (fd + NUL-padded name).
pub const VOL_ARGS_SIZE: usize = 4096;
/// Maximum path-component length accepted in a vol-args name.
pub const PATH_NAME_MAX: usize = 4087;
/// Size of `struct btrfs_ioctl_search_args` (search key + item buffer).
pub const SEARCH_ARGS_SIZE: usize = 4096;
/// Size of `struct btrfs_ioctl_space_args` without trailing slots.
pub const SPACE_ARGS_SIZE: usize = 16;

pub const IOC_SNAP_CREATE: u64 = iow(BTRFS_IOCTL_MAGIC, 1, VOL_ARGS_SIZE as u64);
pub const IOC_ADD_DEV: u64 = iow(BTRFS_IOCTL_MAGIC, 10, VOL_ARGS_SIZE as u64);
pub const IOC_RM_DEV: u64 = iow(BTRFS_IOCTL_MAGIC, 11, VOL_ARGS_SIZE as u64);
pub const IOC_SUBVOL_CREATE: u64 = iow(BTRFS_IOCTL_MAGIC, 14, VOL_ARGS_SIZE as u64);
pub const IOC_SNAP_DESTROY: u64 = iow(BTRFS_IOCTL_MAGIC, 15, VOL_ARGS_SIZE as u64);
pub const IOC_TREE_SEARCH: u64 = iowr(BTRFS_IOCTL_MAGIC, 17, SEARCH_ARGS_SIZE as u64);
pub const IOC_DEFAULT_SUBVOL: u64 = iow(BTRFS_IOCTL_MAGIC, 19, 8);
pub const IOC_SPACE_INFO: u64 = iowr(BTRFS_IOCTL_MAGIC, 20, SPACE_ARGS_SIZE as u64);

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Decode a length-delimited on-disk name into text.
///
/// Names in btrfs items are raw bytes; anything non-UTF-8 is replaced
/// rather than rejected so a single odd name cannot poison a listing.
#[must_use]
pub fn name_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Render 16 raw identifier bytes in canonical hyphenated hex form.
#[must_use]
pub fn format_uuid(id: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7],
        id[8], id[9], id[10], id[11], id[12], id[13], id[14], id[15]
    )
}
