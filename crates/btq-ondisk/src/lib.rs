#![forbid(unsafe_code)]
//! Fixed-layout encode/decode for every ioctl argument and on-disk item
//! the helper touches.
//!
//! All layouts are the kernel's native ABI: little-endian, unpadded, field
//! order exactly as the kernel headers declare it. Variable-length trailing
//! data (names, raw item payloads) is never part of a fixed struct — callers
//! slice it from the surrounding buffer using the decoded length field.
//!
//! Decoding a truncated buffer returns `ParseError`; it never panics.
//! Sizing the buffer correctly for a fixed-size decode is the caller's
//! contract.

use btq_types::{
    ParseError, SEARCH_ARGS_SIZE, SPACE_ARGS_SIZE, VOL_ARGS_SIZE, ensure_slice, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, u64_to_usize,
};
use serde::{Deserialize, Serialize};

/// Bytes available for returned items in one search ioctl call.
pub const SEARCH_BUF_SIZE: usize = SEARCH_ARGS_SIZE - SearchKey::SIZE;

/// Default per-page item cap for a search key.
pub const DEFAULT_SEARCH_ITEMS: u32 = 4096;

// ── btrfs_ioctl_search_key ──────────────────────────────────────────────────

/// Query descriptor for one tree-search ioctl call.
///
/// Every dimension is a closed `[min, max]` range; scalar constructors set
/// `min == max`. The kernel returns items ascending by
/// `(objectid, item type, offset)` within `tree_id`, bounding results by
/// comparing each whole key against the min and max tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
}

impl SearchKey {
    pub const SIZE: usize = 104;

    /// A key covering the whole of `tree_id`.
    #[must_use]
    pub fn for_tree(tree_id: u64) -> Self {
        Self {
            tree_id,
            min_objectid: 0,
            max_objectid: u64::MAX,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            min_type: 0,
            max_type: u32::from(u8::MAX),
            nr_items: DEFAULT_SEARCH_ITEMS,
        }
    }

    #[must_use]
    pub fn objectid(mut self, value: u64) -> Self {
        self.min_objectid = value;
        self.max_objectid = value;
        self
    }

    #[must_use]
    pub fn objectid_range(mut self, min: u64, max: u64) -> Self {
        self.min_objectid = min;
        self.max_objectid = max;
        self
    }

    #[must_use]
    pub fn item_type(mut self, value: u8) -> Self {
        self.min_type = u32::from(value);
        self.max_type = u32::from(value);
        self
    }

    #[must_use]
    pub fn item_type_range(mut self, min: u8, max: u8) -> Self {
        self.min_type = u32::from(min);
        self.max_type = u32::from(max);
        self
    }

    #[must_use]
    pub fn offset(mut self, value: u64) -> Self {
        self.min_offset = value;
        self.max_offset = value;
        self
    }

    #[must_use]
    pub fn offset_range(mut self, min: u64, max: u64) -> Self {
        self.min_offset = min;
        self.max_offset = max;
        self
    }

    #[must_use]
    pub fn transid_range(mut self, min: u64, max: u64) -> Self {
        self.min_transid = min;
        self.max_transid = max;
        self
    }

    #[must_use]
    pub fn max_items(mut self, nr_items: u32) -> Self {
        self.nr_items = nr_items;
        self
    }

    /// Check the `min ≤ max` invariant on every range.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.min_objectid > self.max_objectid {
            return Err(ParseError::InvalidField {
                field: "objectid",
                reason: "min exceeds max",
            });
        }
        if self.min_offset > self.max_offset {
            return Err(ParseError::InvalidField {
                field: "offset",
                reason: "min exceeds max",
            });
        }
        if self.min_transid > self.max_transid {
            return Err(ParseError::InvalidField {
                field: "transid",
                reason: "min exceeds max",
            });
        }
        if self.min_type > self.max_type {
            return Err(ParseError::InvalidField {
                field: "item_type",
                reason: "min exceeds max",
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; Self::SIZE], ParseError> {
        self.validate()?;
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.tree_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.min_objectid.to_le_bytes());
        out[16..24].copy_from_slice(&self.max_objectid.to_le_bytes());
        out[24..32].copy_from_slice(&self.min_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.max_offset.to_le_bytes());
        out[40..48].copy_from_slice(&self.min_transid.to_le_bytes());
        out[48..56].copy_from_slice(&self.max_transid.to_le_bytes());
        out[56..60].copy_from_slice(&self.min_type.to_le_bytes());
        out[60..64].copy_from_slice(&self.max_type.to_le_bytes());
        out[64..68].copy_from_slice(&self.nr_items.to_le_bytes());
        // bytes 68..104 are reserved, kept zero
        Ok(out)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            tree_id: read_le_u64(data, 0)?,
            min_objectid: read_le_u64(data, 8)?,
            max_objectid: read_le_u64(data, 16)?,
            min_offset: read_le_u64(data, 24)?,
            max_offset: read_le_u64(data, 32)?,
            min_transid: read_le_u64(data, 40)?,
            max_transid: read_le_u64(data, 48)?,
            min_type: read_le_u32(data, 56)?,
            max_type: read_le_u32(data, 60)?,
            nr_items: read_le_u32(data, 64)?,
        })
    }
}

// ── btrfs_ioctl_search_header ───────────────────────────────────────────────

/// Header preceding each item payload in a search result buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

impl SearchHeader {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            transid: read_le_u64(data, 0)?,
            objectid: read_le_u64(data, 8)?,
            offset: read_le_u64(data, 16)?,
            item_type: read_le_u32(data, 24)?,
            len: read_le_u32(data, 28)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.transid.to_le_bytes());
        out[8..16].copy_from_slice(&self.objectid.to_le_bytes());
        out[16..24].copy_from_slice(&self.offset.to_le_bytes());
        out[24..28].copy_from_slice(&self.item_type.to_le_bytes());
        out[28..32].copy_from_slice(&self.len.to_le_bytes());
        out
    }
}

// ── btrfs_ioctl_space_args / space_info ─────────────────────────────────────

/// Header of the space-info ioctl argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceArgs {
    pub space_slots: u64,
    pub total_spaces: u64,
}

impl SpaceArgs {
    pub const SIZE: usize = SPACE_ARGS_SIZE;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            space_slots: read_le_u64(data, 0)?,
            total_spaces: read_le_u64(data, 8)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.space_slots.to_le_bytes());
        out[8..16].copy_from_slice(&self.total_spaces.to_le_bytes());
        out
    }
}

/// One space-info slot: block-group-type flags plus allocation totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub flags: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl SpaceInfo {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            flags: read_le_u64(data, 0)?,
            total_bytes: read_le_u64(data, 8)?,
            used_bytes: read_le_u64(data, 16)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.total_bytes.to_le_bytes());
        out[16..24].copy_from_slice(&self.used_bytes.to_le_bytes());
        out
    }
}

// ── btrfs_ioctl_vol_args ────────────────────────────────────────────────────

/// Volume-args argument: target fd plus a NUL-padded name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolArgs {
    pub fd: i64,
    pub name: String,
}

impl VolArgs {
    pub const SIZE: usize = VOL_ARGS_SIZE;

    pub fn to_bytes(&self) -> Result<[u8; Self::SIZE], ParseError> {
        let name = self.name.as_bytes();
        if name.len() > btq_types::PATH_NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "exceeds path component limit",
            });
        }
        if name.contains(&0) {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "embedded NUL",
            });
        }
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.fd.to_le_bytes());
        out[8..8 + name.len()].copy_from_slice(name);
        Ok(out)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let fd = i64::from_le_bytes(read_fixed::<8>(data, 0)?);
        let name_area = ensure_slice(data, 8, Self::SIZE - 8)?;
        let end = name_area
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(name_area.len());
        Ok(Self {
            fd,
            name: String::from_utf8_lossy(&name_area[..end]).into_owned(),
        })
    }
}

// ── btrfs_disk_key ──────────────────────────────────────────────────────────

/// On-disk key: objectid, item type, offset — 17 unpadded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl DiskKey {
    pub const SIZE: usize = 17;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let _ = ensure_slice(data, 0, Self::SIZE)?;
        Ok(Self {
            objectid: read_le_u64(data, 0)?,
            item_type: data[8],
            offset: read_le_u64(data, 9)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        out[8] = self.item_type;
        out[9..17].copy_from_slice(&self.offset.to_le_bytes());
        out
    }
}

// ── btrfs_dev_item ──────────────────────────────────────────────────────────

/// Device item: per-device totals and identity, keyed by device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: [u8; 16],
    pub fsid: [u8; 16],
}

impl DevItem {
    pub const SIZE: usize = 98;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let _ = ensure_slice(data, 0, Self::SIZE)?;
        Ok(Self {
            devid: read_le_u64(data, 0)?,
            total_bytes: read_le_u64(data, 8)?,
            bytes_used: read_le_u64(data, 16)?,
            io_align: read_le_u32(data, 24)?,
            io_width: read_le_u32(data, 28)?,
            sector_size: read_le_u32(data, 32)?,
            dev_type: read_le_u64(data, 36)?,
            generation: read_le_u64(data, 44)?,
            start_offset: read_le_u64(data, 52)?,
            dev_group: read_le_u32(data, 60)?,
            seek_speed: data[64],
            bandwidth: data[65],
            uuid: read_fixed::<16>(data, 66)?,
            fsid: read_fixed::<16>(data, 82)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.devid.to_le_bytes());
        out[8..16].copy_from_slice(&self.total_bytes.to_le_bytes());
        out[16..24].copy_from_slice(&self.bytes_used.to_le_bytes());
        out[24..28].copy_from_slice(&self.io_align.to_le_bytes());
        out[28..32].copy_from_slice(&self.io_width.to_le_bytes());
        out[32..36].copy_from_slice(&self.sector_size.to_le_bytes());
        out[36..44].copy_from_slice(&self.dev_type.to_le_bytes());
        out[44..52].copy_from_slice(&self.generation.to_le_bytes());
        out[52..60].copy_from_slice(&self.start_offset.to_le_bytes());
        out[60..64].copy_from_slice(&self.dev_group.to_le_bytes());
        out[64] = self.seek_speed;
        out[65] = self.bandwidth;
        out[66..82].copy_from_slice(&self.uuid);
        out[82..98].copy_from_slice(&self.fsid);
        out
    }
}

// ── btrfs_dev_extent ────────────────────────────────────────────────────────

/// Device extent: the physical per-device slice backing part of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevExtent {
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
    pub chunk_tree_uuid: [u8; 16],
}

impl DevExtent {
    pub const SIZE: usize = 48;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            chunk_tree: read_le_u64(data, 0)?,
            chunk_objectid: read_le_u64(data, 8)?,
            chunk_offset: read_le_u64(data, 16)?,
            length: read_le_u64(data, 24)?,
            chunk_tree_uuid: read_fixed::<16>(data, 32)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.chunk_tree.to_le_bytes());
        out[8..16].copy_from_slice(&self.chunk_objectid.to_le_bytes());
        out[16..24].copy_from_slice(&self.chunk_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.length.to_le_bytes());
        out[32..48].copy_from_slice(&self.chunk_tree_uuid);
        out
    }
}

// ── btrfs_stripe / btrfs_chunk ──────────────────────────────────────────────

/// A single stripe within a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

impl Stripe {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            devid: read_le_u64(data, 0)?,
            offset: read_le_u64(data, 8)?,
            dev_uuid: read_fixed::<16>(data, 16)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.devid.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out[16..32].copy_from_slice(&self.dev_uuid);
        out
    }
}

/// Chunk item: logical allocation record mapping a block group onto one or
/// more device extents. The fixed head is followed by `num_stripes`
/// embedded stripe records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl Chunk {
    /// Bytes before the embedded stripe array.
    pub const FIXED_SIZE: usize = 48;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let num_stripes = read_le_u16(data, 44)?;
        if num_stripes == 0 {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "chunk must have at least one stripe",
            });
        }

        let mut stripes = Vec::with_capacity(usize::from(num_stripes));
        let mut cur = Self::FIXED_SIZE;
        for _ in 0..num_stripes {
            let raw = ensure_slice(data, cur, Stripe::SIZE)?;
            stripes.push(Stripe::parse(raw)?);
            cur += Stripe::SIZE;
        }

        Ok(Self {
            length: read_le_u64(data, 0)?,
            owner: read_le_u64(data, 8)?,
            stripe_len: read_le_u64(data, 16)?,
            chunk_type: read_le_u64(data, 24)?,
            io_align: read_le_u32(data, 32)?,
            io_width: read_le_u32(data, 36)?,
            sector_size: read_le_u32(data, 40)?,
            num_stripes,
            sub_stripes: read_le_u16(data, 46)?,
            stripes,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_SIZE + self.stripes.len() * Stripe::SIZE);
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.owner.to_le_bytes());
        out.extend_from_slice(&self.stripe_len.to_le_bytes());
        out.extend_from_slice(&self.chunk_type.to_le_bytes());
        out.extend_from_slice(&self.io_align.to_le_bytes());
        out.extend_from_slice(&self.io_width.to_le_bytes());
        out.extend_from_slice(&self.sector_size.to_le_bytes());
        out.extend_from_slice(&self.num_stripes.to_le_bytes());
        out.extend_from_slice(&self.sub_stripes.to_le_bytes());
        for stripe in &self.stripes {
            out.extend_from_slice(&stripe.to_bytes());
        }
        out
    }
}

// ── btrfs_block_group_item ──────────────────────────────────────────────────

/// Block group item: bytes actually used within one block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: u64,
}

impl BlockGroupItem {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            used: read_le_u64(data, 0)?,
            chunk_objectid: read_le_u64(data, 8)?,
            flags: read_le_u64(data, 16)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.used.to_le_bytes());
        out[8..16].copy_from_slice(&self.chunk_objectid.to_le_bytes());
        out[16..24].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

// ── btrfs_root_ref ──────────────────────────────────────────────────────────

/// Root back-reference: links a subvolume tree to its parent subvolume and
/// the directory entry naming it. The fixed head is followed by the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name_len: u16,
}

impl RootRef {
    pub const SIZE: usize = 18;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            dirid: read_le_u64(data, 0)?,
            sequence: read_le_u64(data, 8)?,
            name_len: read_le_u16(data, 16)?,
        })
    }

    /// Decode the fixed head and slice the trailing name.
    pub fn parse_with_name(data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let head = Self::parse(data)?;
        let name = ensure_slice(data, Self::SIZE, usize::from(head.name_len))?;
        Ok((head, name))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.dirid.to_le_bytes());
        out[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        out[16..18].copy_from_slice(&self.name_len.to_le_bytes());
        out
    }

    /// Encode head plus name, with `name_len` taken from `name`.
    pub fn to_bytes_with_name(&self, name: &[u8]) -> Result<Vec<u8>, ParseError> {
        let name_len = u16::try_from(name.len())
            .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
        let head = Self { name_len, ..*self };
        let mut out = head.to_bytes().to_vec();
        out.extend_from_slice(name);
        Ok(out)
    }
}

// ── btrfs_inode_ref ─────────────────────────────────────────────────────────

/// Inode reference: one directory entry pointing at an inode. The fixed
/// head is followed by the entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRef {
    pub index: u64,
    pub name_len: u16,
}

impl InodeRef {
    pub const SIZE: usize = 10;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            index: read_le_u64(data, 0)?,
            name_len: read_le_u16(data, 8)?,
        })
    }

    /// Decode the fixed head and slice the trailing name.
    pub fn parse_with_name(data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let head = Self::parse(data)?;
        let name = ensure_slice(data, Self::SIZE, usize::from(head.name_len))?;
        Ok((head, name))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.index.to_le_bytes());
        out[8..10].copy_from_slice(&self.name_len.to_le_bytes());
        out
    }

    /// Encode head plus name, with `name_len` taken from `name`.
    pub fn to_bytes_with_name(&self, name: &[u8]) -> Result<Vec<u8>, ParseError> {
        let name_len = u16::try_from(name.len())
            .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
        let head = Self { name_len, ..*self };
        let mut out = head.to_bytes().to_vec();
        out.extend_from_slice(name);
        Ok(out)
    }
}

// ── btrfs_dir_item ──────────────────────────────────────────────────────────

/// Directory item head: location key, transid, payload lengths, entry type.
/// Followed by the name and then `data_len` bytes of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirItem {
    pub location: DiskKey,
    pub transid: u64,
    pub data_len: u16,
    pub name_len: u16,
    pub entry_type: u8,
}

impl DirItem {
    pub const SIZE: usize = 30;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let _ = ensure_slice(data, 0, Self::SIZE)?;
        Ok(Self {
            location: DiskKey::parse(&data[0..DiskKey::SIZE])?,
            transid: read_le_u64(data, 17)?,
            data_len: read_le_u16(data, 25)?,
            name_len: read_le_u16(data, 27)?,
            entry_type: data[29],
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..17].copy_from_slice(&self.location.to_bytes());
        out[17..25].copy_from_slice(&self.transid.to_le_bytes());
        out[25..27].copy_from_slice(&self.data_len.to_le_bytes());
        out[27..29].copy_from_slice(&self.name_len.to_le_bytes());
        out[29] = self.entry_type;
        out
    }

    /// Encode head plus name, with `name_len` taken from `name` and
    /// `data_len` honored from the head (payload appended by the caller).
    pub fn to_bytes_with_name(&self, name: &[u8]) -> Result<Vec<u8>, ParseError> {
        let name_len = u16::try_from(name.len())
            .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
        let head = Self { name_len, ..*self };
        let mut out = head.to_bytes().to_vec();
        out.extend_from_slice(name);
        Ok(out)
    }
}

/// One decoded directory entry: head plus owned name bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub item: DirItem,
    pub name: Vec<u8>,
}

/// Walk every `[head, name, data]` entry packed into one dir-item payload.
///
/// A single item payload can hold several entries when names collide in
/// the directory hash.
pub fn parse_dir_entries(data: &[u8]) -> Result<Vec<DirEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        let head = DirItem::parse(&data[cur..])?;
        let name_start = cur + DirItem::SIZE;
        let name = ensure_slice(data, name_start, usize::from(head.name_len))?.to_vec();
        let advance = DirItem::SIZE + usize::from(head.name_len) + usize::from(head.data_len);
        entries.push(DirEntry { item: head, name });
        cur += advance;
    }

    Ok(entries)
}

/// Walk a raw search-result buffer into `(header, payload)` pairs.
///
/// `count` is the item count the kernel reported back. The buffer layout
/// is `count` repetitions of a 32-byte header followed by `len` payload
/// bytes, with no padding between items.
pub fn parse_search_buffer(
    data: &[u8],
    count: u32,
) -> Result<Vec<(SearchHeader, Vec<u8>)>, ParseError> {
    // The claimed count cannot be trusted for sizing: cap the allocation
    // by how many headers the buffer could physically hold.
    let fits = data.len() / SearchHeader::SIZE;
    let mut items = Vec::with_capacity(usize::try_from(count).unwrap_or(usize::MAX).min(fits));
    let mut cur = 0_usize;

    for _ in 0..count {
        let header = SearchHeader::parse(&data[cur.min(data.len())..])?;
        let payload_start = cur + SearchHeader::SIZE;
        let payload_len = u64_to_usize(u64::from(header.len), "item_len")?;
        let payload = ensure_slice(data, payload_start, payload_len)?.to_vec();
        items.push((header, payload));
        cur = payload_start + payload_len;
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_key_layout_pinned() {
        let key = SearchKey::for_tree(1)
            .objectid_range(256, u64::MAX)
            .item_type_range(0, 255)
            .offset_range(7, 9)
            .transid_range(0, u64::MAX)
            .max_items(4096);
        let bytes = key.to_bytes().expect("encode");
        assert_eq!(bytes.len(), 104);
        assert_eq!(&bytes[0..8], &1_u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &256_u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &u64::MAX.to_le_bytes());
        assert_eq!(&bytes[24..32], &7_u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &9_u64.to_le_bytes());
        assert_eq!(&bytes[56..60], &0_u32.to_le_bytes());
        assert_eq!(&bytes[60..64], &255_u32.to_le_bytes());
        assert_eq!(&bytes[64..68], &4096_u32.to_le_bytes());
        assert_eq!(&bytes[68..104], &[0_u8; 36]);

        let back = SearchKey::parse(&bytes).expect("decode");
        assert_eq!(back, key);
    }

    #[test]
    fn search_key_rejects_inverted_range() {
        let key = SearchKey::for_tree(1).offset_range(10, 5);
        assert!(matches!(
            key.to_bytes(),
            Err(ParseError::InvalidField {
                field: "offset",
                ..
            })
        ));
        let key = SearchKey::for_tree(1).objectid_range(2, 1);
        assert!(key.validate().is_err());
    }

    #[test]
    fn search_header_round_trip() {
        let header = SearchHeader {
            transid: u64::MAX,
            objectid: 257,
            offset: 5,
            item_type: 144,
            len: 22,
        };
        assert_eq!(SearchHeader::parse(&header.to_bytes()).expect("parse"), header);

        let zero = SearchHeader {
            transid: 0,
            objectid: 0,
            offset: 0,
            item_type: 0,
            len: 0,
        };
        assert_eq!(SearchHeader::parse(&zero.to_bytes()).expect("parse"), zero);
    }

    #[test]
    fn space_records_round_trip() {
        let args = SpaceArgs {
            space_slots: 0,
            total_spaces: 7,
        };
        assert_eq!(SpaceArgs::parse(&args.to_bytes()).expect("parse"), args);

        let info = SpaceInfo {
            flags: btq_types::BLOCK_GROUP_DATA,
            total_bytes: 10 * (1 << 30),
            used_bytes: 4 * (1 << 30),
        };
        assert_eq!(SpaceInfo::parse(&info.to_bytes()).expect("parse"), info);

        let max = SpaceInfo {
            flags: u64::MAX,
            total_bytes: u64::MAX,
            used_bytes: u64::MAX,
        };
        assert_eq!(SpaceInfo::parse(&max.to_bytes()).expect("parse"), max);
    }

    #[test]
    fn vol_args_round_trip_and_limits() {
        let args = VolArgs {
            fd: -1,
            name: "snapshots/daily".into(),
        };
        let bytes = args.to_bytes().expect("encode");
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[0..8], &(-1_i64).to_le_bytes());
        assert_eq!(VolArgs::parse(&bytes).expect("decode"), args);

        let long = VolArgs {
            fd: 0,
            name: "x".repeat(btq_types::PATH_NAME_MAX + 1),
        };
        assert!(long.to_bytes().is_err());

        let nul = VolArgs {
            fd: 0,
            name: "a\0b".into(),
        };
        assert!(nul.to_bytes().is_err());

        let exact = VolArgs {
            fd: 3,
            name: "y".repeat(btq_types::PATH_NAME_MAX),
        };
        let bytes = exact.to_bytes().expect("encode at limit");
        assert_eq!(VolArgs::parse(&bytes).expect("decode"), exact);
    }

    #[test]
    fn disk_key_round_trip() {
        let key = DiskKey {
            objectid: u64::MAX,
            item_type: 84,
            offset: 0,
        };
        assert_eq!(DiskKey::parse(&key.to_bytes()).expect("parse"), key);
        assert!(DiskKey::parse(&[0_u8; 16]).is_err());
    }

    #[test]
    fn dev_item_round_trip() {
        let item = DevItem {
            devid: 2,
            total_bytes: 500 * (1 << 30),
            bytes_used: 123_456_789,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            dev_type: 0,
            generation: 99,
            start_offset: 0,
            dev_group: 0,
            seek_speed: 8,
            bandwidth: 9,
            uuid: [0xAB; 16],
            fsid: [0xCD; 16],
        };
        let bytes = item.to_bytes();
        assert_eq!(bytes.len(), 98);
        assert_eq!(DevItem::parse(&bytes).expect("parse"), item);
        assert!(DevItem::parse(&bytes[..97]).is_err());
    }

    #[test]
    fn dev_extent_round_trip() {
        let extent = DevExtent {
            chunk_tree: 3,
            chunk_objectid: 256,
            chunk_offset: 0x2000_0000,
            length: 1 << 30,
            chunk_tree_uuid: [7; 16],
        };
        assert_eq!(DevExtent::parse(&extent.to_bytes()).expect("parse"), extent);
    }

    #[test]
    fn chunk_round_trip_with_stripes() {
        let chunk = Chunk {
            length: 2 << 30,
            owner: 2,
            stripe_len: 65536,
            chunk_type: btq_types::BLOCK_GROUP_DATA | btq_types::BLOCK_GROUP_RAID1,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 2,
            sub_stripes: 0,
            stripes: vec![
                Stripe {
                    devid: 1,
                    offset: 0x10_0000,
                    dev_uuid: [1; 16],
                },
                Stripe {
                    devid: 2,
                    offset: 0x20_0000,
                    dev_uuid: [2; 16],
                },
            ],
        };
        let bytes = chunk.to_bytes();
        assert_eq!(bytes.len(), Chunk::FIXED_SIZE + 2 * Stripe::SIZE);
        assert_eq!(Chunk::parse(&bytes).expect("parse"), chunk);
    }

    #[test]
    fn chunk_rejects_zero_stripes() {
        let mut bytes = vec![0_u8; Chunk::FIXED_SIZE];
        bytes[44..46].copy_from_slice(&0_u16.to_le_bytes());
        assert!(matches!(
            Chunk::parse(&bytes),
            Err(ParseError::InvalidField {
                field: "num_stripes",
                ..
            })
        ));
    }

    #[test]
    fn chunk_rejects_truncated_stripe_array() {
        let mut bytes = vec![0_u8; Chunk::FIXED_SIZE + Stripe::SIZE];
        bytes[44..46].copy_from_slice(&2_u16.to_le_bytes());
        assert!(matches!(
            Chunk::parse(&bytes),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn block_group_item_round_trip() {
        let item = BlockGroupItem {
            used: 4 * (1 << 30),
            chunk_objectid: 256,
            flags: btq_types::BLOCK_GROUP_DATA,
        };
        assert_eq!(BlockGroupItem::parse(&item.to_bytes()).expect("parse"), item);
    }

    #[test]
    fn root_ref_name_handling() {
        let head = RootRef {
            dirid: 256,
            sequence: 3,
            name_len: 0,
        };
        let bytes = head.to_bytes_with_name(b"home").expect("encode");
        assert_eq!(bytes.len(), RootRef::SIZE + 4);

        let (back, name) = RootRef::parse_with_name(&bytes).expect("decode");
        assert_eq!(back.dirid, 256);
        assert_eq!(back.sequence, 3);
        assert_eq!(back.name_len, 4);
        assert_eq!(name, b"home");

        // Claimed name longer than the payload is a decode error.
        let short = RootRef {
            dirid: 1,
            sequence: 0,
            name_len: 10,
        };
        assert!(RootRef::parse_with_name(&short.to_bytes()).is_err());
    }

    #[test]
    fn inode_ref_name_handling() {
        let head = InodeRef {
            index: 2,
            name_len: 0,
        };
        let bytes = head.to_bytes_with_name(b"user").expect("encode");
        let (back, name) = InodeRef::parse_with_name(&bytes).expect("decode");
        assert_eq!(back.index, 2);
        assert_eq!(back.name_len, 4);
        assert_eq!(name, b"user");
    }

    #[test]
    fn dir_entries_walk_multiple_packed_entries() {
        let first = DirItem {
            location: DiskKey {
                objectid: 257,
                item_type: 132,
                offset: u64::MAX,
            },
            transid: 8,
            data_len: 0,
            name_len: 0,
            entry_type: 2,
        };
        let second = DirItem {
            location: DiskKey {
                objectid: 300,
                item_type: 132,
                offset: u64::MAX,
            },
            transid: 8,
            data_len: 0,
            name_len: 0,
            entry_type: 2,
        };

        let mut payload = first.to_bytes_with_name(b"default").expect("encode");
        payload.extend_from_slice(&second.to_bytes_with_name(b"other").expect("encode"));

        let entries = parse_dir_entries(&payload).expect("walk");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"default");
        assert_eq!(entries[0].item.location.objectid, 257);
        assert_eq!(entries[1].name, b"other");
        assert_eq!(entries[1].item.location.objectid, 300);
    }

    #[test]
    fn dir_entries_skip_trailing_data() {
        let head = DirItem {
            location: DiskKey {
                objectid: 1,
                item_type: 24,
                offset: 0,
            },
            transid: 1,
            data_len: 3,
            name_len: 0,
            entry_type: 0,
        };
        let mut payload = head.to_bytes_with_name(b"attr").expect("encode");
        payload.extend_from_slice(&[9, 9, 9]);

        let entries = parse_dir_entries(&payload).expect("walk");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"attr");
    }

    #[test]
    fn search_buffer_walk() {
        let mut buf = Vec::new();
        let first = SearchHeader {
            transid: 5,
            objectid: 257,
            offset: 5,
            item_type: 144,
            len: 4,
        };
        buf.extend_from_slice(&first.to_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let second = SearchHeader {
            transid: 5,
            objectid: 258,
            offset: 257,
            item_type: 144,
            len: 0,
        };
        buf.extend_from_slice(&second.to_bytes());

        let items = parse_search_buffer(&buf, 2).expect("walk");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, first);
        assert_eq!(items[0].1, vec![1, 2, 3, 4]);
        assert_eq!(items[1].0, second);
        assert!(items[1].1.is_empty());
    }

    #[test]
    fn search_buffer_rejects_count_past_end() {
        let header = SearchHeader {
            transid: 0,
            objectid: 1,
            offset: 0,
            item_type: 1,
            len: 0,
        };
        let buf = header.to_bytes();
        assert!(parse_search_buffer(&buf, 2).is_err());

        // Payload length overrunning the buffer is also rejected.
        let bad = SearchHeader {
            transid: 0,
            objectid: 1,
            offset: 0,
            item_type: 1,
            len: 64,
        };
        assert!(parse_search_buffer(&bad.to_bytes(), 1).is_err());
    }
}
