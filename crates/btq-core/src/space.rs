//! Space accounting: global per-block-group-type totals and a single
//! device's usage broken down by block-group type.

use crate::mount::FilesystemHandle;
use crate::parse_to_helper_error;
use crate::search::{Continuation, SearchIter, TreeSearch, search_single};
use crate::sys;
use btq_error::{HelperError, Result};
use btq_ondisk::{BlockGroupItem, Chunk, DevExtent, DevItem, SearchKey, SpaceArgs, SpaceInfo};
use btq_types::{
    BLOCK_GROUP_ITEM_KEY, CHUNK_ITEM_KEY, CHUNK_TREE_OBJECTID, DEV_EXTENT_KEY, DEV_ITEMS_OBJECTID,
    DEV_ITEM_KEY, DEV_TREE_OBJECTID, EXTENT_TREE_OBJECTID, ParseError, format_uuid, u64_to_usize,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One block-group-type line: flags, allocated bytes, used bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUsageRecord {
    pub flags: u64,
    pub size: u64,
    pub used: u64,
}

/// Global allocation totals, one record per space-info slot.
///
/// This is the two-call ioctl idiom: the first call reports how many
/// slots exist, the second call is sized to exactly fit them.
pub fn df(fs: &FilesystemHandle) -> Result<Vec<SpaceUsageRecord>> {
    let mut probe = SpaceArgs {
        space_slots: 0,
        total_spaces: 0,
    }
    .to_bytes();
    sys::space_info(fs.root_fd(), &mut probe)?;
    let total = SpaceArgs::parse(&probe)
        .map_err(|e| parse_to_helper_error(&e))?
        .total_spaces;

    let slots = u64_to_usize(total, "total_spaces").map_err(|e| parse_to_helper_error(&e))?;
    let mut buf = vec![0_u8; SpaceArgs::SIZE + slots * SpaceInfo::SIZE];
    buf[..SpaceArgs::SIZE].copy_from_slice(
        &SpaceArgs {
            space_slots: total,
            total_spaces: 0,
        }
        .to_bytes(),
    );
    sys::space_info(fs.root_fd(), &mut buf)?;

    decode_space_buffer(&buf).map_err(|e| parse_to_helper_error(&e))
}

/// Decode a filled space-info buffer into usage records.
pub fn decode_space_buffer(buf: &[u8]) -> std::result::Result<Vec<SpaceUsageRecord>, ParseError> {
    let head = SpaceArgs::parse(buf)?;
    let filled = head.total_spaces.min(head.space_slots);
    let count = u64_to_usize(filled, "total_spaces")?;

    let mut records = Vec::with_capacity(count);
    for slot in 0..count {
        let start = SpaceArgs::SIZE + slot * SpaceInfo::SIZE;
        let info = SpaceInfo::parse(buf.get(start..).unwrap_or(&[]))?;
        records.push(SpaceUsageRecord {
            flags: info.flags,
            size: info.total_bytes,
            used: info.used_bytes,
        });
    }
    Ok(records)
}

/// One device's totals plus its usage per block-group type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub size: u64,
    pub used: u64,
    pub uuid: String,
    pub usage: BTreeMap<u64, SpaceUsageRecord>,
}

/// Break one device's allocation down by block-group type.
///
/// Three trees are joined: the device's extents (device tree) resolve to
/// their owning chunks (chunk tree), and each chunk's block group (extent
/// tree) supplies the used-bytes figure. A device extent is one slice of
/// a chunk that may span several devices, so used bytes are attributed
/// proportionally: `chunk_used * extent_len / chunk_len`, integer
/// division. The truncation is part of the contract.
pub fn volume_df(trees: &dyn TreeSearch, devid: u64) -> Result<VolumeUsage> {
    // The device item pins the device's identity and raw totals. Zero
    // matches and several matches are equally fatal — the device id no
    // longer names exactly one device.
    let dev_key = SearchKey::for_tree(CHUNK_TREE_OBJECTID)
        .objectid(DEV_ITEMS_OBJECTID)
        .item_type(DEV_ITEM_KEY)
        .offset(devid);
    let dev_item = search_single(trees, dev_key, &format!("device {devid}"))?;
    let dev = DevItem::parse(&dev_item.data).map_err(|e| parse_to_helper_error(&e))?;

    let extent_key = SearchKey::for_tree(DEV_TREE_OBJECTID)
        .objectid(devid)
        .item_type(DEV_EXTENT_KEY)
        .offset_range(0, u64::MAX);

    let mut usage: BTreeMap<u64, SpaceUsageRecord> = BTreeMap::new();
    for item in SearchIter::new(trees, extent_key, Continuation::Offset) {
        let item = item?;
        let extent = DevExtent::parse(&item.data).map_err(|e| parse_to_helper_error(&e))?;

        let chunk_key = SearchKey::for_tree(CHUNK_TREE_OBJECTID)
            .objectid(extent.chunk_objectid)
            .item_type(CHUNK_ITEM_KEY)
            .offset(extent.chunk_offset);
        let chunk_item = search_single(
            trees,
            chunk_key,
            &format!("chunk at offset {}", extent.chunk_offset),
        )?;
        let chunk = Chunk::parse(&chunk_item.data).map_err(|e| parse_to_helper_error(&e))?;

        let group_key = SearchKey::for_tree(EXTENT_TREE_OBJECTID)
            .objectid(extent.chunk_offset)
            .item_type(BLOCK_GROUP_ITEM_KEY)
            .offset_range(0, u64::MAX);
        let group_item = search_single(
            trees,
            group_key,
            &format!("block group at {}", extent.chunk_offset),
        )?;

        // The block group's key offset is its length; the chunk tree must
        // agree or the two trees describe different extents.
        if group_item.header.offset != chunk.length || chunk.length == 0 {
            return Err(HelperError::InconsistentMetadata {
                detail: format!(
                    "block group at {} has length {}, chunk tree says {}",
                    extent.chunk_offset, group_item.header.offset, chunk.length
                ),
            });
        }
        let group = BlockGroupItem::parse(&group_item.data).map_err(|e| parse_to_helper_error(&e))?;

        let entry = usage.entry(chunk.chunk_type).or_insert(SpaceUsageRecord {
            flags: chunk.chunk_type,
            size: 0,
            used: 0,
        });
        entry.size += extent.length;
        entry.used += proportional_used(group.used, extent.length, chunk.length);
    }

    Ok(VolumeUsage {
        size: dev.total_bytes,
        used: dev.bytes_used,
        uuid: format_uuid(&dev.uuid),
        usage,
    })
}

/// The widened intermediate keeps `used * extent_len` from overflowing;
/// the final value fits because `used ≤ chunk_len` implies the quotient
/// is at most `extent_len`.
#[allow(clippy::cast_possible_truncation)]
fn proportional_used(chunk_used: u64, extent_len: u64, chunk_len: u64) -> u64 {
    (u128::from(chunk_used) * u128::from(extent_len) / u128::from(chunk_len)) as u64
}
