//! Breakdown path changes that keep every still-valid tree level.

use std::sync::Arc;

use crate::tree::{allocate_child_container, for_each_at_level, Node};
use crate::types::{BreakdownPath, NodeRef};

/// First index at which `new` stops agreeing with `current`.
///
/// When one path is a prefix of the other the result is `current.len()` if
/// `new` is longer (only deeper levels are missing) and `None` otherwise.
pub fn find_divergence(new: &BreakdownPath, current: &BreakdownPath) -> Option<usize> {
    let mismatch = new
        .iter()
        .zip(current.iter())
        .position(|(wanted, active)| wanted != active);
    match mismatch {
        Some(idx) => Some(idx),
        None if new.len() > current.len() => Some(current.len()),
        None => None,
    }
}

/// How the tree has to change for a new path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reconfiguration {
    /// Same path; nothing to do.
    Unchanged,
    /// New path is a strict prefix; drop levels below `depth`, fetch nothing.
    Prune {
        /// New depth.
        depth: usize,
    },
    /// Level 1 changed (or nothing is loaded yet): recreate the root.
    Reset,
    /// Levels `1..=level` stay; every node at `level` gets a fresh container
    /// and level `level + 1` is refetched.
    Rebuild {
        /// Deepest retained level.
        level: usize,
    },
}

/// Decides how to move the tree from `current` to `new`.
///
/// `tree_loaded` is false while the root has never been populated.
pub(crate) fn plan(new: &BreakdownPath, current: &BreakdownPath, tree_loaded: bool) -> Reconfiguration {
    if !tree_loaded {
        return Reconfiguration::Reset;
    }
    match find_divergence(new, current) {
        Some(0) => Reconfiguration::Reset,
        Some(idx) => Reconfiguration::Rebuild { level: idx },
        None if new.len() < current.len() => Reconfiguration::Prune { depth: new.len() },
        None => Reconfiguration::Unchanged,
    }
}

/// Resets the children of every node at `level` for a path of length `depth`.
///
/// Nodes that still have a deeper level get an empty container and are
/// returned as fetch targets; on the deepest level children are deleted.
pub(crate) fn reset_level(root: &mut Arc<Node>, level: usize, depth: usize) -> Vec<NodeRef> {
    let mut targets = Vec::new();
    for_each_at_level(root, level, &mut |node: &mut Node| {
        if level < depth {
            allocate_child_container(node);
            targets.push(node.node_ref());
        } else {
            node.children = None;
        }
    });
    targets
}
