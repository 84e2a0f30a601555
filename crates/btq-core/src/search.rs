//! The generic tree-search protocol.
//!
//! One ioctl call returns at most a buffer's worth of items, so exhaustive
//! enumeration is a continuation protocol: an explicit [`SearchCursor`]
//! holds the next lower bound and [`SearchCursor::next_page`] returns one
//! finite batch. [`SearchIter`] wraps the cursor into a lazy sequence for
//! callers that just want to iterate. A cursor is not restartable — every
//! page advances it.

use crate::mount::FilesystemHandle;
use crate::parse_to_helper_error;
use crate::sys;
use btq_error::{HelperError, Result};
use btq_ondisk::{SearchHeader, SearchKey, parse_search_buffer};
use btq_types::{ITEM_TYPE_MAX, SEARCH_ARGS_SIZE};
use std::collections::VecDeque;

/// One item returned by a range query: kernel header plus raw payload.
///
/// Typed decoding is per-call opt-in — callers that only need the header
/// leave the payload alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchItem {
    pub header: SearchHeader,
    pub data: Vec<u8>,
}

/// A source of search pages: the live kernel, or an in-memory tree in
/// tests.
pub trait TreeSearch {
    /// Issue one bounded range query and return the items it produced,
    /// ascending by `(objectid, item type, offset)`.
    fn search_page(&self, key: &SearchKey) -> Result<Vec<SearchItem>>;
}

/// The real thing: `BTRFS_IOC_TREE_SEARCH` against a mounted root.
pub struct KernelTrees<'a> {
    fs: &'a FilesystemHandle,
}

impl<'a> KernelTrees<'a> {
    #[must_use]
    pub fn new(fs: &'a FilesystemHandle) -> Self {
        Self { fs }
    }
}

impl TreeSearch for KernelTrees<'_> {
    fn search_page(&self, key: &SearchKey) -> Result<Vec<SearchItem>> {
        let mut args = [0_u8; SEARCH_ARGS_SIZE];
        args[..SearchKey::SIZE]
            .copy_from_slice(&key.to_bytes().map_err(|e| parse_to_helper_error(&e))?);

        sys::tree_search(self.fs.root_fd(), &mut args)?;

        // The kernel rewrites nr_items to the count it returned.
        let returned = SearchKey::parse(&args[..SearchKey::SIZE])
            .map_err(|e| parse_to_helper_error(&e))?
            .nr_items;

        // A buffer that does not decode after a successful ioctl means the
        // kernel and this process disagree about the ABI; that is fatal,
        // not recoverable.
        let raw = parse_search_buffer(&args[SearchKey::SIZE..], returned).map_err(|e| {
            HelperError::InconsistentMetadata {
                detail: format!("garbled search buffer ({returned} items claimed): {e}"),
            }
        })?;

        Ok(raw
            .into_iter()
            .map(|(header, data)| SearchItem { header, data })
            .collect())
    }
}

/// How a cursor advances its lower bound past the last item of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Advance the offset lower bound to `last + 1`. For enumerations
    /// where objectid and item type are pinned (device extents).
    Offset,
    /// Advance through the 256-valued item-type sub-key: `last type + 1`,
    /// wrapping past the type maximum into the next objectid. For
    /// root-tree enumerations.
    TypeWraparound,
}

/// Explicit continuation state for a multi-page search.
#[derive(Debug, Clone)]
pub struct SearchCursor {
    key: SearchKey,
    advance: Continuation,
    exhausted: bool,
}

impl SearchCursor {
    #[must_use]
    pub fn new(key: SearchKey, advance: Continuation) -> Self {
        Self {
            key,
            advance,
            exhausted: false,
        }
    }

    /// Fetch the next batch. An empty batch means the enumeration is
    /// complete; every non-empty batch advances the cursor, so the same
    /// page cannot be fetched twice.
    pub fn next_page(&mut self, trees: &dyn TreeSearch) -> Result<Vec<SearchItem>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let items = trees.search_page(&self.key)?;
        match items.last() {
            None => self.exhausted = true,
            Some(last) => self.advance_past(last.header),
        }
        Ok(items)
    }

    fn advance_past(&mut self, header: SearchHeader) {
        match self.advance {
            Continuation::Offset => match header.offset.checked_add(1) {
                Some(next) => self.key.min_offset = next,
                None => self.exhausted = true,
            },
            Continuation::TypeWraparound => {
                self.key.min_objectid = header.objectid;
                let next_type = header.item_type + 1;
                if next_type > u32::from(ITEM_TYPE_MAX) {
                    match header.objectid.checked_add(1) {
                        Some(next_objectid) => {
                            self.key.min_objectid = next_objectid;
                            self.key.min_type = 0;
                        }
                        None => self.exhausted = true,
                    }
                } else {
                    self.key.min_type = next_type;
                }
            }
        }

        // Advancing past the upper bound ends the enumeration.
        if self.key.validate().is_err() {
            self.exhausted = true;
        }
    }
}

/// Lazy sequence adapter over a cursor. Finite; ends at the first empty
/// page or fails sticky on the first error.
pub struct SearchIter<'t> {
    trees: &'t dyn TreeSearch,
    cursor: SearchCursor,
    page: VecDeque<SearchItem>,
    failed: bool,
}

impl<'t> SearchIter<'t> {
    pub fn new(trees: &'t dyn TreeSearch, key: SearchKey, advance: Continuation) -> Self {
        Self {
            trees,
            cursor: SearchCursor::new(key, advance),
            page: VecDeque::new(),
            failed: false,
        }
    }
}

impl Iterator for SearchIter<'_> {
    type Item = Result<SearchItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.page.is_empty() {
            match self.cursor.next_page(self.trees) {
                Ok(items) if items.is_empty() => return None,
                Ok(items) => self.page.extend(items),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

/// Fetch at most one item for `key`.
pub fn search_one(trees: &dyn TreeSearch, key: SearchKey) -> Result<Option<SearchItem>> {
    let items = trees.search_page(&key.max_items(1))?;
    Ok(items.into_iter().next())
}

/// Fetch the item `key` must match exactly once; zero and many are the
/// same client-visible failure.
pub fn search_single(trees: &dyn TreeSearch, key: SearchKey, what: &str) -> Result<SearchItem> {
    let mut items = trees.search_page(&key.max_items(2))?;
    if items.len() != 1 {
        return Err(HelperError::NotFound {
            what: format!("{what} ({} matches)", items.len()),
        });
    }
    Ok(items.remove(0))
}
