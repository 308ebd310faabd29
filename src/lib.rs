//! Strata: a lazily populated breakdown tree for multi-dimensional aggregate
//! statistics, fetched level by level from a paginated endpoint.

#![warn(missing_docs)]

pub mod endpoint;
pub mod source;
pub mod tree;
pub mod types;

pub use endpoint::{Endpoint, EndpointError};
pub use source::{DataSource, DataSourceOptions, FetchOutcome, FetchSummary, RetryPolicy};
pub use tree::{Node, Pagination};
pub use types::{BreakdownId, BreakdownPath, EngineError, NodeRef, Result};
