//! Applies fetched pages to the tree.

use std::sync::Arc;

use crate::endpoint::Page;
use crate::tree::{
    allocate_child_container, locate, locate_ref, node_mut, reconcile, ChildContainer, Node,
    Pagination,
};
use crate::types::{BreakdownId, EngineError, NodeRef, Result};

/// Where a page lands. Chosen by the caller that issued the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeTarget {
    /// First page of level 1: replaces the root's children wholesale and
    /// adopts the page totals as root stats.
    Reset,
    /// Appends the page rows to an existing node's children.
    Append(NodeRef),
}

impl MergeTarget {
    /// Node whose children the page fills.
    pub fn node(&self) -> NodeRef {
        match self {
            MergeTarget::Reset => NodeRef::Root,
            MergeTarget::Append(node) => node.clone(),
        }
    }
}

/// Outcome of merging one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeReport {
    /// Node whose children changed.
    pub target: NodeRef,
    /// Ids of the rows added, in order.
    pub appended: Vec<BreakdownId>,
    /// Subset of `appended` that received an empty container for the next level.
    pub expandable: Vec<BreakdownId>,
    /// Target pagination after the merge.
    pub pagination: Pagination,
}

/// Merges `page` into the tree.
///
/// `requested_limit` is the row limit the page was requested with; `depth` is
/// the configured path length, so rows above the deepest level get an empty
/// children container straight away.
///
/// Nothing is modified when the target cannot be found.
pub fn merge(
    root: &mut Arc<Node>,
    target: &MergeTarget,
    page: &Page,
    requested_limit: usize,
    depth: usize,
) -> Result<MergeReport> {
    let window = reconcile(requested_limit, page.window());
    let row_level = match target {
        MergeTarget::Reset => 1,
        MergeTarget::Append(_) => page.level,
    };
    let node = match target {
        MergeTarget::Reset => Arc::make_mut(root),
        MergeTarget::Append(node) => {
            let parent_level = page.level.checked_sub(1);
            let path = parent_level
                .and_then(|level| locate_ref(root, node, Some(level)))
                .ok_or_else(|| EngineError::MergeTargetMissing(node.clone()))?;
            node_mut(root, &path).ok_or_else(|| EngineError::MergeTargetMissing(node.clone()))?
        }
    };

    let mut appended = Vec::with_capacity(page.rows.len());
    let mut expandable = Vec::new();
    let rows = page.rows.iter().map(|row| {
        let mut child = Node::row(row.breakdown_id.clone(), row_level, row.stats.clone());
        appended.push(row.breakdown_id.clone());
        if row_level < depth {
            allocate_child_container(&mut child);
            expandable.push(row.breakdown_id.clone());
        }
        Arc::new(child)
    });

    let container = match target {
        MergeTarget::Reset => {
            if let Some(totals) = page.totals.as_ref() {
                node.stats = Some(totals.clone());
            }
            node.children.insert(ChildContainer {
                nodes: rows.collect(),
                pagination: Pagination::new(window.offset, 0, window.count),
            })
        }
        MergeTarget::Append(_) => {
            if node.is_root() {
                if let Some(totals) = page.totals.as_ref() {
                    node.stats = Some(totals.clone());
                }
            }
            let container = node.children.get_or_insert_with(ChildContainer::default);
            container.nodes.extend(rows);
            container
        }
    };
    container.pagination = container
        .pagination
        .with_materialized(container.nodes.len(), window.count);

    Ok(MergeReport {
        target: target.node(),
        appended,
        expandable,
        pagination: container.pagination,
    })
}

/// Replaces the stats of every row in `page` with the returned values.
///
/// Used for edit results: the row is swapped wholesale, its children are
/// kept. Fails without modifying anything when a row is not in the tree.
pub fn replace_rows(root: &mut Arc<Node>, page: &Page) -> Result<usize> {
    let mut located = Vec::with_capacity(page.rows.len());
    for row in &page.rows {
        let path = locate(root, &row.breakdown_id, Some(page.level))
            .ok_or_else(|| EngineError::MergeTargetMissing(NodeRef::Node(row.breakdown_id.clone())))?;
        located.push((path, row));
    }
    for (path, row) in &located {
        if let Some(node) = node_mut(root, path) {
            node.stats = Some(row.stats.clone());
        }
    }
    if let Some(totals) = page.totals.as_ref() {
        Arc::make_mut(root).stats = Some(totals.clone());
    }
    Ok(located.len())
}
