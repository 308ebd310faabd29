use thiserror::Error;

use crate::endpoint::EndpointError;
use crate::types::{BreakdownId, NodeRef};

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by [`crate::DataSource`] operations.
///
/// Responses that arrive after their configuration epoch was superseded are
/// not errors; they are reported as [`crate::FetchOutcome::Stale`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The endpoint rejected a batch; nothing from the batch was merged.
    #[error("breakdown request for level {level} failed: {source}")]
    RequestFailed {
        /// Level of the rows the batch was fetching.
        level: usize,
        /// Underlying endpoint failure.
        #[source]
        source: EndpointError,
    },
    /// A cell edit was refused by the endpoint.
    #[error("cannot set '{field}' on {node}: {message}")]
    Validation {
        /// Row the edit targeted.
        node: BreakdownId,
        /// Field that failed validation.
        field: String,
        /// Message to show next to the editor.
        message: String,
    },
    /// A response page names a parent that was not requested or is missing from the tree.
    #[error("merge target {0} not found in breakdown tree")]
    MergeTargetMissing(NodeRef),
    /// Caller referenced a node that is not materialized.
    #[error("node {0} not found")]
    NodeNotFound(NodeRef),
    /// The node sits on the deepest configured level and has no children to page.
    #[error("node {0} has no further breakdown level")]
    NotExpandable(NodeRef),
    /// Every child of the node is already materialized.
    #[error("all rows under {0} are already loaded")]
    AlreadyComplete(NodeRef),
    /// Breakdown path failed structural validation.
    #[error("invalid breakdown path: {0}")]
    InvalidPath(String),
    /// Endpoint metadata could not be loaded.
    #[error("failed to load endpoint metadata: {0}")]
    Metadata(#[source] EndpointError),
}

impl EngineError {
    /// Returns `true` when the failure came from the endpoint transport.
    pub fn is_request_failure(&self) -> bool {
        matches!(self, EngineError::RequestFailed { .. })
    }
}
