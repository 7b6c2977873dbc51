//! Optimistic transactions: a private workspace validated at commit.
//!
//! Reads and writes inside an optimistic transaction go to copies of the
//! touched nodes. Commit write-locks the affected nodes in path order,
//! checks that nobody changed their versions in between, and applies the
//! copies. Removal is physical; optimistic nodes never carry tombstones.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::fqn::{Fqn, Segment};
use crate::lock::{LockOwner, LockType};
use crate::node::{DataMap, TreeNode};
use crate::tree::DataTree;

/// Private copy of one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkspaceNode {
    data: DataMap,
    version: Option<u64>,
    created: bool,
    deleted: bool,
    dirty: bool,
}

impl WorkspaceNode {
    /// Data as seen by the transaction.
    pub fn data(&self) -> &DataMap {
        &self.data
    }

    /// Mutable data; changes are written at commit.
    pub fn data_mut(&mut self) -> &mut DataMap {
        &mut self.data
    }

    /// Version read from the tree, `None` for nodes the transaction created.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// True if the transaction removed the node.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn touched(&self) -> bool {
        self.created || self.deleted || self.dirty
    }
}

/// Kind of change applied to the tree at commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppliedChange {
    /// Node created.
    Created,
    /// Node data replaced.
    Modified,
    /// Node removed.
    Removed,
}

/// Per-transaction copies of touched nodes, keyed by path.
#[derive(Clone, Debug, Default)]
pub struct Workspace {
    nodes: BTreeMap<Fqn, WorkspaceNode>,
}

impl Workspace {
    /// True if nothing was touched.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Copy of `fqn` if the transaction already touched it.
    pub fn peek(&self, fqn: &Fqn) -> Option<&WorkspaceNode> {
        self.nodes.get(fqn)
    }

    /// Live copy of `fqn`, copying it from the tree on first access.
    pub fn load(&mut self, tree: &DataTree, fqn: &Fqn) -> Option<&mut WorkspaceNode> {
        if !self.nodes.contains_key(fqn) {
            let node = tree.find_node(fqn, false)?;
            self.nodes.insert(fqn.clone(), copy_of(&node));
        }
        self.nodes.get_mut(fqn).filter(|n| !n.deleted)
    }

    /// Live copy of `fqn`, creating it and any missing ancestors in the
    /// workspace. Returns the paths created.
    pub fn create(&mut self, tree: &DataTree, fqn: &Fqn) -> Vec<Fqn> {
        let mut created = Vec::new();
        for len in 1..=fqn.len() {
            let path = fqn.prefix(len);
            if self.load(tree, &path).is_some() {
                continue;
            }
            let entry = self.nodes.entry(path.clone()).or_default();
            entry.created = true;
            entry.deleted = false;
            entry.dirty = true;
            entry.data.clear();
            created.push(path);
        }
        created
    }

    /// Mutable copy of `fqn` that will be written at commit, created if
    /// missing.
    pub fn write(&mut self, tree: &DataTree, fqn: &Fqn) -> &mut WorkspaceNode {
        self.create(tree, fqn);
        let node = self.nodes.entry(fqn.clone()).or_default();
        node.dirty = true;
        node
    }

    /// Marks `fqn` and its whole subtree removed. Returns false if the node
    /// was not visible to the transaction.
    pub fn delete(&mut self, tree: &DataTree, fqn: &Fqn) -> bool {
        if self.load(tree, fqn).is_none() {
            return false;
        }
        let mut doomed: Vec<Fqn> = self
            .nodes
            .keys()
            .filter(|k| k.is_child_or_equal_to(fqn))
            .cloned()
            .collect();
        if let Some(node) = tree.find_node(fqn, false) {
            let mut stack = vec![node];
            while let Some(node) = stack.pop() {
                stack.extend(node.children().into_iter().filter(|c| !c.is_marked_for_removal()));
                if !self.nodes.contains_key(node.fqn()) {
                    self.nodes.insert(node.fqn().clone(), copy_of(&node));
                    doomed.push(node.fqn().clone());
                }
            }
        }
        for path in doomed {
            if let Some(n) = self.nodes.get_mut(&path) {
                n.deleted = true;
                n.data.clear();
            }
        }
        true
    }

    /// Value of `key` at `fqn` as seen by the transaction.
    pub fn get(&mut self, tree: &DataTree, fqn: &Fqn, key: &str) -> Option<String> {
        self.load(tree, fqn).and_then(|n| n.data.get(key).cloned())
    }

    /// Children names of `fqn` as seen by the transaction.
    pub fn children_names(&mut self, tree: &DataTree, fqn: &Fqn) -> Option<BTreeSet<Segment>> {
        self.load(tree, fqn)?;
        let mut names = tree.children_names(fqn).unwrap_or_default();
        let depth = fqn.len() + 1;
        for (path, node) in self.nodes.iter().filter(|(p, _)| p.len() == depth && p.is_child_of(fqn)) {
            if let Some(name) = path.last_segment() {
                if node.deleted {
                    names.remove(name);
                } else {
                    names.insert(name.clone());
                }
            }
        }
        Some(names)
    }

    fn touched(&self) -> Vec<(&Fqn, &WorkspaceNode)> {
        self.nodes.iter().filter(|(_, n)| n.touched()).collect()
    }

    /// First phase: write-locks the nodes the workspace will change, plus the
    /// parents of created or removed nodes, in path order, then checks that
    /// every node read still has the version the transaction saw.
    ///
    /// Returns the nodes newly locked for `owner`. On failure nothing stays
    /// locked.
    pub fn prepare(
        &self,
        tree: &DataTree,
        owner: LockOwner,
        timeout: Duration,
    ) -> CacheResult<Vec<Arc<TreeNode>>> {
        let touched = self.touched();
        let mut to_lock: BTreeSet<Fqn> = BTreeSet::new();
        for (fqn, node) in &touched {
            if node.created || node.deleted {
                to_lock.insert(fqn.parent());
            }
            to_lock.insert((*fqn).clone());
        }

        let mut locked: Vec<Arc<TreeNode>> = Vec::new();
        if let Err(e) = Self::lock_and_validate(tree, owner, timeout, &to_lock, &touched, &mut locked) {
            for node in locked.iter().rev() {
                node.release(&owner);
            }
            return Err(e);
        }
        Ok(locked)
    }

    fn lock_and_validate(
        tree: &DataTree,
        owner: LockOwner,
        timeout: Duration,
        to_lock: &BTreeSet<Fqn>,
        touched: &[(&Fqn, &WorkspaceNode)],
        locked: &mut Vec<Arc<TreeNode>>,
    ) -> CacheResult<()> {
        for fqn in to_lock {
            if let Some(node) = tree.find_node(fqn, false) {
                if node.acquire(owner, LockType::Write, timeout)? {
                    locked.push(node);
                }
            }
        }
        for (fqn, ws) in touched {
            let Some(expected) = ws.version else { continue };
            match tree.find_node(fqn, false).and_then(|n| n.version()) {
                Some(current) if current == expected => {}
                Some(current) => {
                    return Err(CacheError::locking(
                        fqn,
                        format!(
                            "version mismatch: read {} but tree is at {}",
                            expected, current
                        ),
                    ))
                }
                None => {
                    return Err(CacheError::locking(
                        fqn,
                        "node was removed by a concurrent transaction",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Second phase: writes the workspace into the tree and bumps the
    /// versions of written nodes. Parents are applied before children and
    /// removals happen deepest first.
    pub fn apply(&self, tree: &DataTree) -> Vec<(Fqn, AppliedChange)> {
        let touched = self.touched();
        let mut applied = Vec::new();
        for (fqn, ws) in touched.iter().filter(|(_, n)| !n.deleted) {
            let mut created = false;
            let node = tree.get_or_create(fqn, |_| created = true);
            node.put_all(ws.data.clone(), true);
            node.bump_version();
            let change = if created || ws.created {
                AppliedChange::Created
            } else {
                AppliedChange::Modified
            };
            applied.push(((*fqn).clone(), change));
        }
        for (fqn, _) in touched.iter().rev().filter(|(_, n)| n.deleted) {
            if tree.remove_node(fqn).is_some() {
                applied.push(((*fqn).clone(), AppliedChange::Removed));
            }
        }
        applied
    }

    /// Prepares, applies and releases in one step.
    pub fn commit(
        &self,
        tree: &DataTree,
        owner: LockOwner,
        timeout: Duration,
    ) -> CacheResult<Vec<(Fqn, AppliedChange)>> {
        let locked = self.prepare(tree, owner, timeout)?;
        let applied = self.apply(tree);
        for node in locked.iter().rev() {
            node.release(&owner);
        }
        tracing::debug!(%owner, changes = applied.len(), "applied optimistic workspace");
        Ok(applied)
    }

    /// Forgets every copy.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

fn copy_of(node: &TreeNode) -> WorkspaceNode {
    WorkspaceNode {
        data: node.data(),
        version: node.version(),
        created: false,
        deleted: false,
        dirty: false,
    }
}
