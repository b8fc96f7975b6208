//! Immutable published-content trees.
//!
//! A [`TreeSnapshot`] is never mutated once handed out. Every patch returns a new
//! snapshot; nodes are held behind `Arc` so unchanged nodes are shared between
//! the old and the new tree and only the touched path is copied.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::node::{Node, NodeId, ROOT_ID};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraftError {
    #[error("node `{id}` cannot be grafted: parent `{parent_id}` is not in the tree")]
    ParentMissing { id: NodeId, parent_id: NodeId },
    #[error("node `{id}` cannot be moved under its own descendant `{parent_id}`")]
    Cycle { id: NodeId, parent_id: NodeId },
    #[error("node id `{id}` is reserved")]
    ReservedId { id: NodeId },
}

/// Read-only navigation over a published tree, as handed to rendering code.
pub trait TreeNavigation {
    fn get_by_id(&self, id: NodeId) -> Option<&Node>;
    fn get_children(&self, id: NodeId) -> Vec<&Node>;
    /// Top-level content, i.e. the children of the synthetic root.
    fn get_root(&self) -> Vec<&Node>;
}

/// Result of assembling a tree from a flat node list.
#[derive(Debug)]
pub struct Assembled {
    pub snapshot: TreeSnapshot,
    /// Nodes whose parent chain never reached the root, sorted by id.
    pub orphans: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TreeSnapshot {
    nodes: HashMap<NodeId, Arc<Node>>,
    root_children: Vec<NodeId>,
    content_types: BTreeMap<String, usize>,
}

impl TreeSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble a connected tree from nodes in source order.
    ///
    /// Siblings keep arrival order among equal `sort_order` values. Levels are
    /// derived from the parent. Nodes that cannot be reached from the root
    /// (missing parent, cycles, duplicates of an already placed id) are dropped
    /// and reported as orphans.
    pub fn assemble(nodes: impl IntoIterator<Item = Node>) -> Assembled {
        let mut index: HashMap<NodeId, Node> = HashMap::new();
        let mut children_of: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut orphans = Vec::new();

        for node in nodes {
            if node.id == ROOT_ID || node.id == node.parent_id || index.contains_key(&node.id) {
                orphans.push(node.id);
                continue;
            }
            children_of.entry(node.parent_id).or_default().push(node.id);
            index.insert(node.id, node);
        }

        let mut placed: HashMap<NodeId, Node> = HashMap::with_capacity(index.len());
        let mut root_children = Vec::new();
        let mut queue = VecDeque::from([(ROOT_ID, 0)]);

        while let Some((parent_id, parent_level)) = queue.pop_front() {
            let Some(mut ids) = children_of.remove(&parent_id) else {
                continue;
            };
            ids.sort_by_key(|id| index.get(id).map_or(i32::MAX, |node| node.sort_order));

            let mut attached = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(mut node) = index.remove(&id) else {
                    continue;
                };
                let level = parent_level + 1;
                if node.level != level {
                    debug!(
                        target = "verdant::domain::snapshot",
                        node_id = id,
                        declared_level = node.level,
                        level,
                        "Source level disagrees with tree depth; using tree depth"
                    );
                    node.level = level;
                }
                node.children.clear();
                queue.push_back((id, level));
                attached.push(id);
                placed.insert(id, node);
            }

            if parent_id == ROOT_ID {
                root_children = attached;
            } else if let Some(parent) = placed.get_mut(&parent_id) {
                parent.children = attached;
            }
        }

        orphans.extend(index.into_keys());
        orphans.sort_unstable();
        orphans.dedup();

        let mut snapshot = TreeSnapshot {
            nodes: HashMap::with_capacity(placed.len()),
            root_children,
            content_types: BTreeMap::new(),
        };
        for (id, node) in placed {
            snapshot.track_content_type(node.content_type());
            snapshot.nodes.insert(id, Arc::new(node));
        }

        Assembled { snapshot, orphans }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id).map(Arc::as_ref)
    }

    pub fn root_children(&self) -> &[NodeId] {
        &self.root_children
    }

    /// Child ids of `parent_id`; `ROOT_ID` yields the top-level ids.
    pub fn child_ids(&self, parent_id: NodeId) -> &[NodeId] {
        if parent_id == ROOT_ID {
            return &self.root_children;
        }
        self.nodes
            .get(&parent_id)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn children(&self, parent_id: NodeId) -> Vec<&Node> {
        self.child_ids(parent_id)
            .iter()
            .filter_map(|id| self.get(*id))
            .collect()
    }

    pub fn parent(&self, id: NodeId) -> Option<&Node> {
        self.get(id).and_then(|node| self.get(node.parent_id))
    }

    /// Every node below `id` in pre-order, excluding `id` itself.
    pub fn descendant_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.child_ids(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.child_ids(next).iter().rev().copied());
        }
        out
    }

    /// All nodes in pre-order: each parent before its children, siblings in order.
    pub fn preorder(&self) -> Vec<&Node> {
        self.descendant_ids(ROOT_ID)
            .into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn knows_content_type(&self, content_type: &str) -> bool {
        self.content_types.contains_key(content_type)
    }

    pub fn content_types(&self) -> impl Iterator<Item = &str> {
        self.content_types.keys().map(String::as_str)
    }

    /// Insert `node` or replace the node with the same id.
    ///
    /// A replaced node keeps its children unless `keep_descendants` is false, in
    /// which case its whole subtree is dropped. A node whose parent changed is
    /// moved with its subtree. Siblings are re-sorted only when the grafted node
    /// breaks the ordering.
    pub fn graft(&self, node: Node, keep_descendants: bool) -> Result<TreeSnapshot, GraftError> {
        let id = node.id;
        let parent_id = node.parent_id;
        if id == ROOT_ID {
            return Err(GraftError::ReservedId { id });
        }
        if id == parent_id {
            return Err(GraftError::Cycle { id, parent_id });
        }

        let parent_level = if parent_id == ROOT_ID {
            0
        } else {
            self.get(parent_id)
                .map(|parent| parent.level)
                .ok_or(GraftError::ParentMissing { id, parent_id })?
        };
        if self.contains(id) && self.is_ancestor(id, parent_id) {
            return Err(GraftError::Cycle { id, parent_id });
        }

        let mut next = self.clone();
        let mut incoming = node;
        incoming.level = parent_level + 1;
        incoming.children = Vec::new();

        let mut relevel = false;
        if let Some(previous) = self.nodes.get(&id) {
            next.untrack_content_type(previous.content_type());
            if keep_descendants {
                incoming.children = previous.children.clone();
                relevel = previous.level != incoming.level;
            } else {
                for descendant in self.descendant_ids(id) {
                    if let Some(removed) = next.nodes.remove(&descendant) {
                        next.untrack_content_type(removed.content_type());
                    }
                }
            }
            if previous.parent_id != parent_id {
                let mut siblings = next.take_children(previous.parent_id);
                siblings.retain(|child| *child != id);
                next.put_children(previous.parent_id, siblings);
            }
        }

        next.track_content_type(incoming.content_type());
        next.nodes.insert(id, Arc::new(incoming));

        let mut siblings = next.take_children(parent_id);
        if !siblings.contains(&id) {
            siblings.push(id);
        }
        next.order_around(&mut siblings, id);
        next.put_children(parent_id, siblings);

        if relevel {
            next.relevel_below(id);
        }

        Ok(next)
    }

    /// Remove `id` and its subtree. Returns `None` when `id` is not in the tree.
    pub fn prune(&self, id: NodeId) -> Option<(TreeSnapshot, Vec<NodeId>)> {
        let target = self.nodes.get(&id)?;
        let mut next = self.clone();

        let mut removed = vec![id];
        removed.extend(self.descendant_ids(id));
        for node_id in &removed {
            if let Some(node) = next.nodes.remove(node_id) {
                next.untrack_content_type(node.content_type());
            }
        }

        let mut siblings = next.take_children(target.parent_id);
        siblings.retain(|child| *child != id);
        next.put_children(target.parent_id, siblings);

        Some((next, removed))
    }

    /// Change the sort order of a cached node and reposition it among its siblings.
    pub fn with_sort_order(&self, id: NodeId, sort_order: i32) -> Option<TreeSnapshot> {
        let current = self.nodes.get(&id)?;
        if current.sort_order == sort_order {
            return None;
        }

        let parent_id = current.parent_id;
        let mut next = self.clone();
        if let Some(node) = next.nodes.get_mut(&id) {
            Arc::make_mut(node).sort_order = sort_order;
        }
        let mut siblings = next.take_children(parent_id);
        next.order_around(&mut siblings, id);
        next.put_children(parent_id, siblings);
        Some(next)
    }

    /// Re-sort the children of `parent_id`. Returns `None` when they already are.
    pub fn with_sorted_children(&self, parent_id: NodeId) -> Option<TreeSnapshot> {
        if parent_id != ROOT_ID && !self.contains(parent_id) {
            return None;
        }
        if self.is_sorted(self.child_ids(parent_id)) {
            return None;
        }

        let mut next = self.clone();
        let mut siblings = next.take_children(parent_id);
        next.sort_ids(&mut siblings);
        next.put_children(parent_id, siblings);
        Some(next)
    }

    /// True when `ancestor` appears on the parent chain of `id` (or is `id`).
    fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).map(|node| node.parent_id);
        }
        false
    }

    fn is_sorted(&self, ids: &[NodeId]) -> bool {
        ids.windows(2)
            .all(|pair| self.sort_key(pair[0]) <= self.sort_key(pair[1]))
    }

    fn sort_key(&self, id: NodeId) -> i32 {
        self.nodes.get(&id).map_or(i32::MAX, |node| node.sort_order)
    }

    fn sort_ids(&self, ids: &mut [NodeId]) {
        ids.sort_by_key(|id| self.sort_key(*id));
    }

    /// Re-sort `siblings` only if `id` is out of order with a neighbour.
    fn order_around(&self, siblings: &mut [NodeId], id: NodeId) {
        let Some(position) = siblings.iter().position(|child| *child == id) else {
            return;
        };
        let key = self.sort_key(id);
        let before = position
            .checked_sub(1)
            .is_some_and(|prev| self.sort_key(siblings[prev]) > key);
        let after = siblings
            .get(position + 1)
            .is_some_and(|next| self.sort_key(*next) < key);
        if before || after {
            self.sort_ids(siblings);
        }
    }

    fn take_children(&mut self, parent_id: NodeId) -> Vec<NodeId> {
        if parent_id == ROOT_ID {
            return std::mem::take(&mut self.root_children);
        }
        match self.nodes.get_mut(&parent_id) {
            Some(parent) => std::mem::take(&mut Arc::make_mut(parent).children),
            None => Vec::new(),
        }
    }

    fn put_children(&mut self, parent_id: NodeId, children: Vec<NodeId>) {
        if parent_id == ROOT_ID {
            self.root_children = children;
        } else if let Some(parent) = self.nodes.get_mut(&parent_id) {
            Arc::make_mut(parent).children = children;
        }
    }

    fn relevel_below(&mut self, id: NodeId) {
        let mut queue = VecDeque::from([id]);
        while let Some(parent_id) = queue.pop_front() {
            let Some(parent) = self.nodes.get(&parent_id) else {
                continue;
            };
            let level = parent.level + 1;
            let children = parent.children.clone();
            for child_id in children {
                if let Some(child) = self.nodes.get_mut(&child_id) {
                    if child.level != level {
                        Arc::make_mut(child).level = level;
                    }
                    queue.push_back(child_id);
                }
            }
        }
    }

    fn track_content_type(&mut self, content_type: &str) {
        *self
            .content_types
            .entry(content_type.to_string())
            .or_insert(0) += 1;
    }

    fn untrack_content_type(&mut self, content_type: &str) {
        if let Some(count) = self.content_types.get_mut(content_type) {
            *count -= 1;
            if *count == 0 {
                self.content_types.remove(content_type);
            }
        }
    }
}

impl TreeNavigation for TreeSnapshot {
    fn get_by_id(&self, id: NodeId) -> Option<&Node> {
        self.get(id)
    }

    fn get_children(&self, id: NodeId) -> Vec<&Node> {
        self.children(id)
    }

    fn get_root(&self) -> Vec<&Node> {
        self.children(ROOT_ID)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::domain::node::Payload;

    fn payload(content_type: &str) -> Payload {
        Payload {
            content_type: content_type.to_string(),
            attributes: Vec::new(),
            data: Value::Null,
        }
    }

    fn node(id: NodeId, parent_id: NodeId, sort_order: i32, level: i32) -> Node {
        Node::new(id, parent_id, sort_order, level, payload("page"))
    }

    fn ids(nodes: Vec<&Node>) -> Vec<NodeId> {
        nodes.into_iter().map(|node| node.id).collect()
    }

    fn sample() -> TreeSnapshot {
        TreeSnapshot::assemble([
            node(1, ROOT_ID, 0, 1),
            node(2, 1, 0, 2),
            node(3, 1, 10, 2),
            node(4, 2, 0, 3),
        ])
        .snapshot
    }

    #[test]
    fn assemble_links_rows_under_synthetic_root() {
        let tree = sample();
        assert_eq!(tree.root_children(), &[1]);
        assert_eq!(ids(tree.children(1)), vec![2, 3]);
        assert_eq!(ids(tree.children(2)), vec![4]);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn assemble_drops_orphans_and_cycles() {
        let assembled = TreeSnapshot::assemble([
            node(1, ROOT_ID, 0, 1),
            node(2, 99, 0, 2),
            node(5, 6, 0, 2),
            node(6, 5, 0, 2),
            node(7, 2, 0, 3),
        ]);
        assert_eq!(assembled.orphans, vec![2, 5, 6, 7]);
        assert_eq!(assembled.snapshot.len(), 1);
    }

    #[test]
    fn assemble_sorts_siblings_stably_and_derives_levels() {
        let tree = TreeSnapshot::assemble([
            node(1, ROOT_ID, 5, 1),
            node(2, ROOT_ID, 1, 1),
            node(3, ROOT_ID, 5, 1),
            node(4, 2, 0, 7),
        ])
        .snapshot;
        assert_eq!(tree.root_children(), &[2, 1, 3]);
        assert_eq!(tree.get(4).map(|n| n.level), Some(2));
    }

    #[test]
    fn graft_new_node_resorts_when_out_of_order() {
        let tree = sample();
        let next = tree.graft(node(5, 1, -5, 2), true).expect("graft");
        assert_eq!(ids(next.children(1)), vec![5, 2, 3]);
        assert_eq!(ids(tree.children(1)), vec![2, 3], "original untouched");
    }

    #[test]
    fn graft_replacement_keeps_children() {
        let tree = sample();
        let mut updated = node(2, 1, 0, 2);
        updated.payload.attributes.push(("title".into(), "new".into()));

        let next = tree.graft(updated, true).expect("graft");
        assert_eq!(ids(next.children(2)), vec![4]);
        assert_eq!(next.get(2).and_then(|n| n.payload.attribute("title")), Some("new"));
        assert!(Arc::ptr_eq(&tree.nodes[&4], &next.nodes[&4]), "subtree shared");
    }

    #[test]
    fn graft_without_descendants_drops_subtree() {
        let tree = sample();
        let next = tree.graft(node(2, 1, 0, 2), false).expect("graft");
        assert!(next.children(2).is_empty());
        assert!(!next.contains(4));
    }

    #[test]
    fn graft_moves_node_and_relevels_subtree() {
        let tree = sample();
        let next = tree.graft(node(2, ROOT_ID, 3, 1), true).expect("graft");
        assert_eq!(next.root_children(), &[1, 2]);
        assert_eq!(ids(next.children(1)), vec![3]);
        assert_eq!(next.get(2).map(|n| n.level), Some(1));
        assert_eq!(next.get(4).map(|n| n.level), Some(2));
    }

    #[test]
    fn graft_rejects_missing_parent_and_cycles() {
        let tree = sample();
        assert_eq!(
            tree.graft(node(9, 42, 0, 2), true),
            Err(GraftError::ParentMissing { id: 9, parent_id: 42 })
        );
        assert_eq!(
            tree.graft(node(1, 4, 0, 4), true),
            Err(GraftError::Cycle { id: 1, parent_id: 4 })
        );
    }

    #[test]
    fn prune_removes_subtree() {
        let tree = sample();
        let (next, removed) = tree.prune(2).expect("present");
        assert_eq!(removed, vec![2, 4]);
        assert_eq!(ids(next.children(1)), vec![3]);
        assert!(tree.prune(77).is_none());
    }

    #[test]
    fn sort_order_update_repositions() {
        let tree = sample();
        let next = tree.with_sort_order(3, -1).expect("changed");
        assert_eq!(ids(next.children(1)), vec![3, 2]);
        assert!(tree.with_sort_order(3, 10).is_none());
    }

    #[test]
    fn content_types_follow_patches() {
        let tree = sample();
        let mut article = node(5, 1, 20, 2);
        article.payload.content_type = "article".into();
        let next = tree.graft(article, true).expect("graft");
        assert!(next.knows_content_type("article"));
        let (pruned, _) = next.prune(5).expect("present");
        assert!(!pruned.knows_content_type("article"));
        assert_eq!(pruned, tree);
    }
}
