//! In-memory breakdown tree.
//!
//! The root is level 0 and carries only the totals row. Every other node is one
//! aggregate row; its `children` container, when present, holds the next
//! configured level together with that level's pagination state. Nodes are
//! shared through [`Arc`] so readers get cheap consistent snapshots while the
//! data source edits a copy-on-write clone.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{BreakdownId, NodeRef};

pub mod merge;
pub mod pagination;

pub use merge::{merge, replace_rows, MergeReport, MergeTarget};
pub use pagination::{reconcile, Count, PageWindow, Pagination};

/// Column or metric value with optional edit metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatValue {
    /// Raw value as served by the endpoint.
    pub value: serde_json::Value,
    /// Whether the cell accepts edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_editable: Option<bool>,
    /// Explanation shown when the cell is read-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_message: Option<String>,
}

impl StatValue {
    /// Plain read-only value.
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            is_editable: None,
            edit_message: None,
        }
    }

    /// Value that accepts edits.
    pub fn editable(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            is_editable: Some(true),
            edit_message: None,
        }
    }
}

/// Column/metric key to value. Keys are not known in advance.
pub type Stats = BTreeMap<String, StatValue>;

/// Materialized children of a node plus their pagination state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChildContainer {
    /// Children in fetch order; new pages are appended at the end.
    pub nodes: Vec<Arc<Node>>,
    /// Pagination over `nodes`; `limit` always equals `nodes.len()`.
    pub pagination: Pagination,
}

impl ChildContainer {
    /// Number of materialized children.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when no child has been materialized yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates the children in order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|node| node.as_ref())
    }
}

/// One aggregate row at one breakdown level.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Node {
    /// Entity this row aggregates; `None` only for the root.
    pub breakdown_id: Option<BreakdownId>,
    /// 0 for the root, parent level + 1 otherwise.
    pub level: usize,
    /// Row values; the root holds the totals row once the first page arrived.
    pub stats: Option<Stats>,
    /// Next level, absent on leaves and on nodes not yet expanded.
    pub children: Option<ChildContainer>,
    /// Set while a request for this node's children is in flight.
    pub loading: bool,
}

impl Node {
    /// Creates an unexpanded row.
    pub fn row(id: BreakdownId, level: usize, stats: Stats) -> Self {
        Self {
            breakdown_id: Some(id),
            level,
            stats: Some(stats),
            children: None,
            loading: false,
        }
    }

    /// Returns `true` for the level-0 node.
    pub fn is_root(&self) -> bool {
        self.breakdown_id.is_none()
    }

    /// Reference naming this node.
    pub fn node_ref(&self) -> NodeRef {
        match &self.breakdown_id {
            Some(id) => NodeRef::Node(id.clone()),
            None => NodeRef::Root,
        }
    }

    /// Pagination of the children container, if allocated.
    pub fn pagination(&self) -> Option<&Pagination> {
        self.children.as_ref().map(|children| &children.pagination)
    }

    /// Looks up one stat value by key.
    pub fn stat(&self, key: &str) -> Option<&serde_json::Value> {
        self.stats
            .as_ref()
            .and_then(|stats| stats.get(key))
            .map(|stat| &stat.value)
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self
            .children
            .as_ref()
            .map(|children| children.iter().map(Node::subtree_len).sum::<usize>())
            .unwrap_or(0)
    }
}

/// Creates a fresh root with no stats and no children.
pub fn create_root() -> Node {
    Node::default()
}

/// Gives `node` an empty children container whose total is unknown.
///
/// Any previously materialized children are dropped.
pub fn allocate_child_container(node: &mut Node) {
    node.children = Some(ChildContainer {
        nodes: Vec::new(),
        pagination: Pagination::unknown(),
    });
}

/// Depth-first search for the first node whose breakdown id matches.
pub fn find_node_by_id<'a>(root: &'a Node, id: &BreakdownId) -> Option<&'a Node> {
    let path = locate(root, id, None)?;
    node_at(root, &path)
}

/// Resolves a [`NodeRef`] against the tree.
pub fn find_node<'a>(root: &'a Node, node: &NodeRef) -> Option<&'a Node> {
    match node {
        NodeRef::Root => Some(root),
        NodeRef::Node(id) => find_node_by_id(root, id),
    }
}

/// Child-index path from `root` to the first node with `id`, optionally
/// restricted to one level.
pub(crate) fn locate(root: &Node, id: &BreakdownId, level: Option<usize>) -> Option<Vec<usize>> {
    let mut trail = Vec::new();
    if locate_into(root, id, level, &mut trail) {
        Some(trail)
    } else {
        None
    }
}

fn locate_into(node: &Node, id: &BreakdownId, level: Option<usize>, trail: &mut Vec<usize>) -> bool {
    let level_matches = level.map_or(true, |wanted| wanted == node.level);
    if level_matches && node.breakdown_id.as_ref() == Some(id) {
        return true;
    }
    if let Some(wanted) = level {
        if node.level >= wanted {
            return false;
        }
    }
    let Some(children) = node.children.as_ref() else {
        return false;
    };
    for (idx, child) in children.nodes.iter().enumerate() {
        trail.push(idx);
        if locate_into(child, id, level, trail) {
            return true;
        }
        trail.pop();
    }
    false
}

/// Resolves a node reference to a child-index path, optionally pinned to a level.
pub(crate) fn locate_ref(root: &Node, node: &NodeRef, level: Option<usize>) -> Option<Vec<usize>> {
    match node {
        NodeRef::Root => (level.unwrap_or(0) == 0).then(Vec::new),
        NodeRef::Node(id) => locate(root, id, level),
    }
}

fn node_at<'a>(root: &'a Node, path: &[usize]) -> Option<&'a Node> {
    let mut node = root;
    for &idx in path {
        node = node.children.as_ref()?.nodes.get(idx)?.as_ref();
    }
    Some(node)
}

/// Mutable access along a located path, cloning shared nodes on the way down.
pub(crate) fn node_mut<'a>(root: &'a mut Arc<Node>, path: &[usize]) -> Option<&'a mut Node> {
    let mut node = Arc::make_mut(root);
    for &idx in path {
        node = Arc::make_mut(node.children.as_mut()?.nodes.get_mut(idx)?);
    }
    Some(node)
}

/// Applies `edit` to every node at `level`, cloning only the shared spine.
pub(crate) fn for_each_at_level(root: &mut Arc<Node>, level: usize, edit: &mut dyn FnMut(&mut Node)) {
    let node = Arc::make_mut(root);
    if node.level == level {
        edit(node);
        return;
    }
    if let Some(children) = node.children.as_mut() {
        for child in children.nodes.iter_mut() {
            if child.level <= level {
                for_each_at_level(child, level, edit);
            }
        }
    }
}

/// Sets the loading flag on the referenced nodes that are still present.
pub(crate) fn set_loading(root: &mut Arc<Node>, nodes: &[NodeRef], loading: bool) {
    for node in nodes {
        let Some(path) = locate_ref(root, node, None) else {
            continue;
        };
        if node_at(root, &path).is_some_and(|current| current.loading != loading) {
            if let Some(target) = node_mut(root, &path) {
                target.loading = loading;
            }
        }
    }
}
