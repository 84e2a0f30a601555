#![forbid(unsafe_code)]
//! Error types for the btrquery helper.
//!
//! Two-layer model: the record codec reports `ParseError` (in `btq-types`)
//! for byte-level violations; everything user-facing is a `HelperError`.
//! This crate is intentionally independent of `btq-types` — the conversion
//! from `ParseError` happens at the `btq-core` boundary, which depends on
//! both.
//!
//! Every variant maps to exactly one wire status code via
//! [`HelperError::to_status`]. The mapping is exhaustive (no wildcard arm)
//! so adding a variant without assigning a status is a compile error.
//!
//! | Variant | status | retried |
//! |---------|--------|---------|
//! | `Ioctl` | 550 | never |
//! | `Mount` | 500 | never |
//! | `NotFound` | 404 | client may correct and retry |
//! | `InconsistentMetadata` | 500 | never — indicates corruption or a raced external mutation |
//! | `MissingLink` | 500 | never |
//! | `InvalidRequest` | 400 | client may correct and retry |
//! | `Parse` | 500 | never |
//! | `Io` | 550 | never |

use thiserror::Error;

/// Unified error type for all helper operations.
#[derive(Debug, Error)]
pub enum HelperError {
    /// A kernel ioctl failed; carries the operation name and the OS error.
    #[error("ioctl {op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The external mount/unmount command failed.
    ///
    /// `detail` carries the command's exit status and captured stderr so
    /// the front-end can render a useful diagnostic.
    #[error("mount of {uuid} failed: {detail}")]
    Mount { uuid: String, detail: String },

    /// Exactly one record was required; zero or several matched.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Two metadata trees disagree about the same object.
    ///
    /// Fatal to the operation: either the filesystem is corrupt or an
    /// external writer raced us between searches.
    #[error("inconsistent metadata: {detail}")]
    InconsistentMetadata { detail: String },

    /// An expected inode/name reference was absent during a path walk.
    #[error("item {inode} in tree {tree} has no inode reference")]
    MissingLink { tree: u64, inode: u64 },

    /// The request itself is malformed or violates a precondition the
    /// client can check (bad path, wrong argument shape, source of a
    /// snapshot is not a subvolume).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Byte-level decode failure surfaced from the record codec.
    #[error("parse error: {detail}")]
    Parse { detail: String },

    /// Operating system I/O error outside an ioctl.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HelperError {
    /// Wire status code for the request/response protocol.
    #[must_use]
    pub fn to_status(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Mount { .. }
            | Self::InconsistentMetadata { .. }
            | Self::MissingLink { .. }
            | Self::Parse { .. } => 500,
            Self::Ioctl { .. } | Self::Io(_) => 550,
        }
    }

    /// The raw OS error code, when this error wraps one.
    #[must_use]
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Ioctl { source, .. } => source.raw_os_error(),
            Self::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Result alias using `HelperError`.
pub type Result<T> = std::result::Result<T, HelperError>;
