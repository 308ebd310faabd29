//! Pagination bookkeeping for children containers.
//!
//! Upstream pages may omit their total row count or report a negative one.
//! [`reconcile`] turns such a page into a [`Count`] the tree can rely on.

use serde::{Serialize, Serializer};
use tracing::warn;

/// Believed total number of children across all pages of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Count {
    /// Total is known.
    Known(usize),
    /// Total is not known yet; more pages may exist.
    Unknown,
}

impl Count {
    /// Interprets an upstream count where negative or missing means unknown.
    pub fn from_reported(count: Option<i64>) -> Self {
        match count {
            Some(n) if n >= 0 => Count::Known(n as usize),
            _ => Count::Unknown,
        }
    }

    /// Returns the total when known.
    pub fn known(self) -> Option<usize> {
        match self {
            Count::Known(n) => Some(n),
            Count::Unknown => None,
        }
    }
}

impl Serialize for Count {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.known().serialize(serializer)
    }
}

/// Pagination state of one node's children.
///
/// `limit` tracks how many children are materialized, not a page size, and
/// `complete` holds when `offset + limit` reaches a known `count`. A count
/// below the materialized rows is an upstream inconsistency and still
/// counts as complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Pagination {
    /// Offset of the first materialized child.
    pub offset: usize,
    /// Number of materialized children.
    pub limit: usize,
    /// Believed total.
    pub count: Count,
    /// Whether every child is materialized.
    pub complete: bool,
}

impl Pagination {
    /// Builds a pagination record with `complete` derived from the other fields.
    pub fn new(offset: usize, limit: usize, count: Count) -> Self {
        let complete = match count {
            Count::Known(total) if offset + limit > total => {
                warn!(offset, limit, count = total, "reported count is below materialized rows");
                true
            }
            Count::Known(total) => offset + limit == total,
            Count::Unknown => false,
        };
        Self {
            offset,
            limit,
            count,
            complete,
        }
    }

    /// Fresh container state: nothing materialized, total unknown.
    pub fn unknown() -> Self {
        Self::new(0, 0, Count::Unknown)
    }

    /// Offset the next "load more" request starts at.
    pub fn next_offset(&self) -> usize {
        self.offset + self.limit
    }

    /// Recomputes the record after the materialized count changed.
    pub fn with_materialized(&self, limit: usize, count: Count) -> Self {
        Self::new(self.offset, limit, count)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::unknown()
    }
}

/// What one returned page says about its node's children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageWindow {
    /// Offset the page starts at.
    pub offset: usize,
    /// Rows actually returned.
    pub returned: usize,
    /// Total reported or inferred so far.
    pub count: Count,
}

/// Settles the total for a page fetched with `requested_limit`.
///
/// A known count is trusted. Otherwise a short page is the last one, so the
/// total becomes `offset + returned`; a full page leaves the total unknown.
/// Running it again on its own output changes nothing.
pub fn reconcile(requested_limit: usize, window: PageWindow) -> PageWindow {
    let count = match window.count {
        Count::Known(total) => Count::Known(total),
        Count::Unknown if window.returned < requested_limit => {
            Count::Known(window.offset + window.returned)
        }
        Count::Unknown => Count::Unknown,
    };
    PageWindow { count, ..window }
}
