//! The node tree rooted at `/`, addressed by [`Fqn`].

use std::sync::Arc;

use crate::fqn::{Fqn, Segment};
use crate::lock::IsolationLevel;
use crate::node::{NodeKind, NodeSnapshot, TreeNode};

/// Root of the cache tree plus path navigation.
pub struct DataTree {
    root: Arc<TreeNode>,
    kind: NodeKind,
    isolation: IsolationLevel,
}

impl DataTree {
    /// Creates an empty tree whose nodes are of the given kind.
    pub fn new(kind: NodeKind, isolation: IsolationLevel) -> Self {
        Self {
            root: TreeNode::new_root(kind, isolation),
            kind,
            isolation,
        }
    }

    /// The root node.
    pub fn root(&self) -> &Arc<TreeNode> {
        &self.root
    }

    /// Node kind used for new nodes.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Finds the node at `fqn`. Tombstoned nodes (or nodes below one) are
    /// treated as absent unless `include_removed` is set.
    pub fn find_node(&self, fqn: &Fqn, include_removed: bool) -> Option<Arc<TreeNode>> {
        let mut node = self.root.clone();
        for segment in fqn.segments() {
            let child = node.child(segment)?;
            if !include_removed && child.is_marked_for_removal() {
                return None;
            }
            node = child;
        }
        Some(node)
    }

    /// True if a live node exists at `fqn`.
    pub fn exists(&self, fqn: &Fqn) -> bool {
        self.find_node(fqn, false).is_some()
    }

    /// Returns the node at `fqn`, creating any missing ancestors.
    /// `on_create` is called for each node created, top-down.
    pub fn get_or_create(
        &self,
        fqn: &Fqn,
        mut on_create: impl FnMut(&Arc<TreeNode>),
    ) -> Arc<TreeNode> {
        let mut node = self.root.clone();
        for segment in fqn.segments() {
            let (child, created) = node.add_child(segment.clone());
            if created {
                on_create(&child);
            }
            node = child;
        }
        node
    }

    /// Physically detaches the node at `fqn` from its parent.
    /// Removing the root detaches all of its children and clears its data.
    pub fn remove_node(&self, fqn: &Fqn) -> Option<Arc<TreeNode>> {
        match fqn.last_segment() {
            Some(name) => {
                let parent = self.find_node(&fqn.parent(), true)?;
                parent.remove_child(name)
            }
            None => {
                self.root.remove_children();
                self.root.clear_data();
                Some(self.root.clone())
            }
        }
    }

    /// Reattaches a subtree built from `snapshot` at `fqn`, creating missing
    /// ancestors. Any existing node at `fqn` is replaced.
    pub fn restore_subtree(&self, fqn: &Fqn, snapshot: &NodeSnapshot) -> Arc<TreeNode> {
        match fqn.last_segment() {
            Some(name) => {
                let parent = self.get_or_create(&fqn.parent(), |_| {});
                parent.remove_child(name);
                let node =
                    TreeNode::from_snapshot(fqn.clone(), snapshot, self.kind.fresh(), self.isolation);
                parent.attach_child(name.clone(), node.clone());
                node
            }
            None => {
                self.root.apply_snapshot(snapshot);
                self.root.clone()
            }
        }
    }

    /// Children names of the live node at `fqn`.
    pub fn children_names(&self, fqn: &Fqn) -> Option<std::collections::BTreeSet<Segment>> {
        self.find_node(fqn, false).map(|n| n.children_names(false))
    }

    /// Every node of the tree, parents before children.
    pub fn all_nodes(&self) -> Vec<Arc<TreeNode>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(node) = stack.pop() {
            stack.extend(node.children());
            out.push(node);
        }
        out
    }

    /// Number of live nodes, excluding the root.
    pub fn number_of_nodes(&self) -> usize {
        self.root.number_of_nodes()
    }

    /// Indented rendering of the whole tree.
    pub fn print_details(&self) -> String {
        let mut out = String::new();
        self.root.print_details(&mut out, 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> DataTree {
        DataTree::new(NodeKind::Standard, IsolationLevel::RepeatableRead)
    }

    #[test]
    fn test_get_or_create_reports_created_nodes() {
        let tree = tree();
        let mut created = Vec::new();
        tree.get_or_create(&Fqn::parse("/a/b/c"), |n| created.push(n.fqn().clone()));
        assert_eq!(
            created,
            vec![Fqn::parse("/a"), Fqn::parse("/a/b"), Fqn::parse("/a/b/c")]
        );
        created.clear();
        tree.get_or_create(&Fqn::parse("/a/b/d"), |n| created.push(n.fqn().clone()));
        assert_eq!(created, vec![Fqn::parse("/a/b/d")]);
    }

    #[test]
    fn test_find_node_respects_tombstones() {
        let tree = tree();
        tree.get_or_create(&Fqn::parse("/a/b"), |_| {});
        tree.find_node(&Fqn::parse("/a"), false)
            .unwrap()
            .mark_for_removal(true);
        assert!(!tree.exists(&Fqn::parse("/a")));
        assert!(!tree.exists(&Fqn::parse("/a/b")));
        assert!(tree.find_node(&Fqn::parse("/a/b"), true).is_some());
    }

    #[test]
    fn test_remove_node_and_restore() {
        let tree = tree();
        let b = tree.get_or_create(&Fqn::parse("/a/b"), |_| {});
        b.put("k".into(), "v".into());
        let snap = tree.find_node(&Fqn::parse("/a"), false).unwrap().snapshot();

        assert!(tree.remove_node(&Fqn::parse("/a")).is_some());
        assert!(!tree.exists(&Fqn::parse("/a")));

        tree.restore_subtree(&Fqn::parse("/a"), &snap);
        let restored = tree.find_node(&Fqn::parse("/a/b"), false).unwrap();
        assert_eq!(restored.get("k"), Some("v".into()));
    }

    #[test]
    fn test_remove_root_clears_everything() {
        let tree = tree();
        tree.get_or_create(&Fqn::parse("/a"), |_| {});
        tree.root().put("k".into(), "v".into());
        tree.remove_node(&Fqn::root());
        assert_eq!(tree.number_of_nodes(), 0);
        assert!(!tree.root().has_data());
    }

    #[test]
    fn test_all_nodes_parent_first() {
        let tree = tree();
        tree.get_or_create(&Fqn::parse("/a/b"), |_| {});
        let all = tree.all_nodes();
        assert_eq!(all.len(), 3);
        assert!(all[0].fqn().is_root());
    }
}
