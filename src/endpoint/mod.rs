//! Contract between the data source and whatever serves breakdown rows.
//!
//! A single [`Endpoint::fetch`] call covers every sibling parent of one batch:
//! the request lists the parents in `breakdown_page` and the response carries
//! one [`Page`] per parent, in the same order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tree::{Count, PageWindow, Stats};
use crate::types::{BreakdownId, BreakdownPath, DateRange, Dimension, Filter, Order, QueryConfig};

pub mod dataset;
pub mod memory;

pub use dataset::{Dataset, DatasetError, Fact};
pub use memory::MemoryEndpoint;

/// Failures reported by an [`Endpoint`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// Transport or server failure.
    #[error("request failed: {0}")]
    Request(String),
    /// A cell edit was refused.
    #[error("invalid value for '{field}': {message}")]
    Validation {
        /// Field the edit targeted.
        field: String,
        /// Message for the editor.
        message: String,
    },
}

impl EndpointError {
    /// Convenience constructor for [`EndpointError::Request`].
    pub fn request(message: impl Into<String>) -> Self {
        EndpointError::Request(message.into())
    }

    /// Returns `true` when retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EndpointError::Request(_))
    }
}

/// One batched page request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakdownRequest {
    /// Level of the rows being requested (1 for the first breakdown level).
    pub level: usize,
    /// Full configured path, not only the dimension of `level`.
    pub breakdown_path: BreakdownPath,
    /// Parents being paged, in response order; empty for level 1.
    pub breakdown_page: Vec<BreakdownId>,
    /// Offset into each parent's children.
    pub offset: usize,
    /// Rows requested per parent.
    pub limit: usize,
    /// Sort order.
    pub order: Option<Order>,
    /// Reporting window.
    pub date_range: Option<DateRange>,
    /// Global filters.
    pub filters: Vec<Filter>,
}

impl BreakdownRequest {
    /// Dimension that groups the requested level.
    pub fn dimension(&self) -> Option<&Dimension> {
        self.breakdown_path.dimension_for_level(self.level)
    }
}

/// Pagination as reported by the endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePagination {
    /// Offset of the first row in the page.
    pub offset: usize,
    /// Row limit the page was served with.
    pub limit: usize,
    /// Total rows for the parent; missing or negative when unknown.
    #[serde(default)]
    pub count: Option<i64>,
}

/// One aggregate row in a page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    /// Entity the row aggregates.
    pub breakdown_id: BreakdownId,
    /// Column/metric values.
    #[serde(default)]
    pub stats: Stats,
}

/// Rows of one parent at one level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Parent being paged; `None` for the first level under the root.
    #[serde(default)]
    pub breakdown_id: Option<BreakdownId>,
    /// Level of `rows`.
    pub level: usize,
    /// Rows in display order.
    pub rows: Vec<Row>,
    /// Pagination metadata.
    pub pagination: PagePagination,
    /// Totals row for the root, when the endpoint reports one.
    #[serde(default)]
    pub totals: Option<Stats>,
}

impl Page {
    /// Pagination facts of this page before reconciliation.
    pub fn window(&self) -> PageWindow {
        PageWindow {
            offset: self.pagination.offset,
            returned: self.rows.len(),
            count: Count::from_reported(self.pagination.count),
        }
    }
}

/// Column advertised by the endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Stat key.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Whether cells of this column accept edits.
    #[serde(default)]
    pub editable: bool,
}

/// Static description of what the endpoint serves.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    /// Available columns.
    pub columns: Vec<Column>,
    /// Dimensions that may appear in a breakdown path.
    pub breakdown_groups: Vec<Dimension>,
    /// Level the grid starts at.
    pub base_level: usize,
}

impl MetaData {
    /// Returns `true` when every dimension of `path` is advertised.
    pub fn supports(&self, path: &BreakdownPath) -> bool {
        path.iter().all(|dim| self.breakdown_groups.contains(dim))
    }

    /// Looks up a column by key.
    pub fn column(&self, key: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.key == key)
    }
}

/// In-place edit of one cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CellEdit {
    /// Row being edited.
    pub breakdown_id: BreakdownId,
    /// Level of the row.
    pub level: usize,
    /// Stat key being edited.
    pub field: String,
    /// New value.
    pub value: serde_json::Value,
    /// Configuration the row was fetched under.
    pub context: QueryConfig,
}

/// Source of breakdown rows.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Columns, breakdown groups and base level. Idempotent and cacheable.
    async fn metadata(&self) -> Result<MetaData, EndpointError>;

    /// Serves one page per parent listed in the request.
    async fn fetch(&self, request: &BreakdownRequest) -> Result<Vec<Page>, EndpointError>;

    /// Applies a cell edit and returns the updated row as a page.
    async fn save(&self, edit: &CellEdit) -> Result<Page, EndpointError>;
}
