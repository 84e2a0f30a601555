#![deny(unsafe_code)]
//! Core engine of the btrquery helper: mount/session lifecycle, the
//! tree-search protocol, space accounting, and the subvolume graph.
//!
//! Everything here is synchronous and blocking. Operations acquire a
//! [`FilesystemHandle`] from the process-wide [`MountTable`], run one or
//! more searches through a [`TreeSearch`] implementation, and hand plain
//! data structures back to the caller for serialization. Unsafe code is
//! confined to the ioctl shim in [`sys`].

use btq_error::HelperError;
use btq_types::ParseError;

pub mod devices;
pub mod mount;
pub mod search;
pub mod space;
pub mod subvol;
#[allow(unsafe_code)]
pub mod sys;
pub mod vfs;

pub use mount::{FilesystemHandle, MountTable, Mounter, SystemMounter};
pub use search::{
    Continuation, KernelTrees, SearchCursor, SearchItem, SearchIter, TreeSearch, search_one,
    search_single,
};
pub use space::{SpaceUsageRecord, VolumeUsage, df, volume_df};
pub use subvol::{SubvolumeRecord, list_subvolumes};
pub use sys::effective_uid;
pub use vfs::{DirEntryRecord, TypeFilter, ls};

/// Bridge a codec-level `ParseError` into the user-facing error type.
pub(crate) fn parse_to_helper_error(err: &ParseError) -> HelperError {
    HelperError::Parse {
        detail: err.to_string(),
    }
}
