//! Cache nodes: a data map, a children map and one lazily created lock.
//!
//! The [`NodeLock`] is the logical lock owned by transactions or threads and
//! held across calls. The inner `RwLock` only keeps the maps memory-safe for
//! the duration of a single access.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::fqn::{Fqn, Segment};
use crate::lock::{IsolationLevel, LockOwner, LockType, NodeLock};

/// Key/value map held by a node.
pub type DataMap = HashMap<String, String>;

/// Per-node concurrency flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Pessimistically locked node; supports tombstones.
    Standard,
    /// Optimistically versioned node carrying its current version.
    Versioned(u64),
}

impl NodeKind {
    /// Kind for a freshly created node of the same flavour.
    pub fn fresh(&self) -> NodeKind {
        match self {
            NodeKind::Standard => NodeKind::Standard,
            NodeKind::Versioned(_) => NodeKind::Versioned(0),
        }
    }
}

#[derive(Debug)]
struct NodeMaps {
    kind: NodeKind,
    data: Option<DataMap>,
    children: Option<BTreeMap<Segment, Arc<TreeNode>>>,
    marked_for_removal: bool,
}

/// Serializable deep copy of a subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Node data.
    pub data: DataMap,
    /// Children keyed by name.
    pub children: BTreeMap<Segment, NodeSnapshot>,
}

impl NodeSnapshot {
    /// True if the snapshot holds neither data nor children.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.children.is_empty()
    }

    /// Number of nodes in the snapshot, including its root.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .values()
            .map(NodeSnapshot::node_count)
            .sum::<usize>()
    }
}

/// A node in the cache tree.
#[derive(Debug)]
pub struct TreeNode {
    fqn: Fqn,
    isolation: IsolationLevel,
    maps: RwLock<NodeMaps>,
    lock: OnceLock<NodeLock>,
}

impl TreeNode {
    /// Creates the root node.
    pub fn new_root(kind: NodeKind, isolation: IsolationLevel) -> Arc<TreeNode> {
        Arc::new(Self::with_fqn(Fqn::root(), kind, isolation))
    }

    fn with_fqn(fqn: Fqn, kind: NodeKind, isolation: IsolationLevel) -> TreeNode {
        TreeNode {
            fqn,
            isolation,
            maps: RwLock::new(NodeMaps {
                kind,
                data: None,
                children: None,
                marked_for_removal: false,
            }),
            lock: OnceLock::new(),
        }
    }

    /// Path of this node.
    pub fn fqn(&self) -> &Fqn {
        &self.fqn
    }

    /// Name of this node (last path segment). `None` for the root.
    pub fn name(&self) -> Option<&Segment> {
        self.fqn.last_segment()
    }

    /// Lock guarding this node, created on first use.
    pub fn lock(&self) -> &NodeLock {
        self.lock
            .get_or_init(|| NodeLock::new(self.fqn.clone(), self.isolation))
    }

    /// True once a lock object has been created for this node.
    pub fn has_lock(&self) -> bool {
        self.lock.get().is_some()
    }

    /// Acquires this node's lock for `owner`. See [`NodeLock::acquire`].
    pub fn acquire(
        &self,
        owner: LockOwner,
        lock_type: LockType,
        timeout: Duration,
    ) -> CacheResult<bool> {
        self.lock().acquire(owner, lock_type, timeout)
    }

    /// Releases `owner`'s lock on this node, if any.
    pub fn release(&self, owner: &LockOwner) -> bool {
        match self.lock.get() {
            Some(lock) => lock.release(owner),
            None => false,
        }
    }

    /// Locks this node and its whole subtree for `owner`.
    ///
    /// Returns the nodes whose lock was newly acquired. On failure every
    /// lock taken by this call is released before the error is returned.
    pub fn acquire_all(
        self: &Arc<Self>,
        owner: LockOwner,
        lock_type: LockType,
        timeout: Duration,
    ) -> CacheResult<Vec<Arc<TreeNode>>> {
        let mut acquired = Vec::new();
        if let Err(e) = self.acquire_all_into(owner, lock_type, timeout, &mut acquired) {
            for node in acquired.iter().rev() {
                node.release(&owner);
            }
            return Err(e);
        }
        Ok(acquired)
    }

    fn acquire_all_into(
        self: &Arc<Self>,
        owner: LockOwner,
        lock_type: LockType,
        timeout: Duration,
        acquired: &mut Vec<Arc<TreeNode>>,
    ) -> CacheResult<()> {
        if self.acquire(owner, lock_type, timeout)? {
            acquired.push(self.clone());
        }
        for child in self.children() {
            child.acquire_all_into(owner, lock_type, timeout, acquired)?;
        }
        Ok(())
    }

    /// Releases `owner`'s locks on this node and its whole subtree.
    pub fn release_all(&self, owner: &LockOwner) {
        for child in self.children() {
            child.release_all(owner);
        }
        self.release(owner);
    }

    /// Forcibly releases every lock in this subtree.
    pub fn release_all_forced(&self) {
        for child in self.children() {
            child.release_all_forced();
        }
        if let Some(lock) = self.lock.get() {
            lock.release_all();
        }
    }

    /// Current node kind.
    pub fn kind(&self) -> NodeKind {
        self.maps.read().kind
    }

    /// Version of a versioned node.
    pub fn version(&self) -> Option<u64> {
        match self.maps.read().kind {
            NodeKind::Versioned(v) => Some(v),
            NodeKind::Standard => None,
        }
    }

    /// Increments the version of a versioned node and returns the new value.
    pub fn bump_version(&self) -> Option<u64> {
        let mut maps = self.maps.write();
        match &mut maps.kind {
            NodeKind::Versioned(v) => {
                *v += 1;
                Some(*v)
            }
            NodeKind::Standard => None,
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.maps
            .read()
            .data
            .as_ref()
            .and_then(|d| d.get(key).cloned())
    }

    /// Copy of the data map (empty if never written).
    pub fn data(&self) -> DataMap {
        self.maps.read().data.clone().unwrap_or_default()
    }

    /// Keys of the data map.
    pub fn keys(&self) -> BTreeSet<String> {
        self.maps
            .read()
            .data
            .as_ref()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.maps
            .read()
            .data
            .as_ref()
            .is_some_and(|d| d.contains_key(key))
    }

    /// True if the data map has any entry.
    pub fn has_data(&self) -> bool {
        self.maps.read().data.as_ref().is_some_and(|d| !d.is_empty())
    }

    /// Number of data entries.
    pub fn data_len(&self) -> usize {
        self.maps.read().data.as_ref().map_or(0, |d| d.len())
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn put(&self, key: String, value: String) -> Option<String> {
        self.maps
            .write()
            .data
            .get_or_insert_with(DataMap::new)
            .insert(key, value)
    }

    /// Merges `data` into the map (replacing it first when `erase` is set).
    /// Returns the map as it was before.
    pub fn put_all(&self, data: DataMap, erase: bool) -> DataMap {
        let mut maps = self.maps.write();
        let target = maps.data.get_or_insert_with(DataMap::new);
        let previous = target.clone();
        if erase {
            target.clear();
        }
        target.extend(data);
        previous
    }

    /// Removes `key`, returning its value.
    pub fn remove_key(&self, key: &str) -> Option<String> {
        self.maps.write().data.as_mut().and_then(|d| d.remove(key))
    }

    /// Clears the data map, returning its previous contents.
    pub fn clear_data(&self) -> DataMap {
        self.maps.write().data.take().unwrap_or_default()
    }

    /// Child named `name`, including tombstoned children.
    pub fn child(&self, name: &Segment) -> Option<Arc<TreeNode>> {
        self.maps
            .read()
            .children
            .as_ref()
            .and_then(|c| c.get(name).cloned())
    }

    /// All children, including tombstoned ones.
    pub fn children(&self) -> Vec<Arc<TreeNode>> {
        self.maps
            .read()
            .children
            .as_ref()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of children, optionally including tombstoned ones.
    pub fn children_names(&self, include_removed: bool) -> BTreeSet<Segment> {
        self.maps
            .read()
            .children
            .as_ref()
            .map(|c| {
                c.iter()
                    .filter(|(_, n)| include_removed || !n.is_marked_for_removal())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if the node has any child (tombstoned children included).
    pub fn has_children(&self) -> bool {
        self.maps
            .read()
            .children
            .as_ref()
            .is_some_and(|c| !c.is_empty())
    }

    /// Returns the child named `name`, creating it if absent.
    /// The flag is true when the child was created by this call.
    pub fn add_child(&self, name: Segment) -> (Arc<TreeNode>, bool) {
        let mut maps = self.maps.write();
        let kind = maps.kind.fresh();
        let children = maps.children.get_or_insert_with(BTreeMap::new);
        if let Some(existing) = children.get(&name) {
            return (existing.clone(), false);
        }
        let child = Arc::new(TreeNode::with_fqn(
            self.fqn.child(name.clone()),
            kind,
            self.isolation,
        ));
        children.insert(name, child.clone());
        (child, true)
    }

    /// Attaches an existing node as a child. The node's path must be exactly
    /// this node's path plus one segment.
    pub fn insert_child(&self, child: Arc<TreeNode>) -> CacheResult<()> {
        match child.fqn.last_segment() {
            Some(name) if child.fqn.parent() == self.fqn => {
                let name = name.clone();
                self.attach_child(name, child);
                Ok(())
            }
            _ => Err(CacheError::IllegalState(format!(
                "node {} cannot be attached under {}",
                child.fqn, self.fqn
            ))),
        }
    }

    /// Attaches `child` under `name`, replacing any child of that name. The
    /// caller guarantees the child's path ends in `name` below this node.
    pub(crate) fn attach_child(&self, name: Segment, child: Arc<TreeNode>) {
        debug_assert_eq!(child.fqn, self.fqn.child(name.clone()));
        self.maps
            .write()
            .children
            .get_or_insert_with(BTreeMap::new)
            .insert(name, child);
    }

    /// Physically detaches the child named `name`.
    pub fn remove_child(&self, name: &Segment) -> Option<Arc<TreeNode>> {
        self.maps
            .write()
            .children
            .as_mut()
            .and_then(|c| c.remove(name))
    }

    /// Physically detaches every child.
    pub fn remove_children(&self) -> Vec<Arc<TreeNode>> {
        self.maps
            .write()
            .children
            .take()
            .map(|c| c.into_values().collect())
            .unwrap_or_default()
    }

    /// True if this node carries a tombstone.
    pub fn is_marked_for_removal(&self) -> bool {
        self.maps.read().marked_for_removal
    }

    /// Tombstones this node and, when `deep`, every descendant.
    pub fn mark_for_removal(&self, deep: bool) {
        self.maps.write().marked_for_removal = true;
        if deep {
            for child in self.children() {
                child.mark_for_removal(true);
            }
        }
    }

    /// Clears the tombstone on this node and, when `deep`, on every descendant.
    pub fn unmark_for_removal(&self, deep: bool) {
        self.maps.write().marked_for_removal = false;
        if deep {
            for child in self.children() {
                child.unmark_for_removal(true);
            }
        }
    }

    /// Deep copy of the live (non-tombstoned) subtree.
    pub fn snapshot(&self) -> NodeSnapshot {
        let maps = self.maps.read();
        NodeSnapshot {
            data: maps.data.clone().unwrap_or_default(),
            children: maps
                .children
                .as_ref()
                .map(|c| {
                    c.iter()
                        .filter(|(_, n)| !n.is_marked_for_removal())
                        .map(|(k, n)| (k.clone(), n.snapshot()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Builds a detached subtree at `fqn` from a snapshot, top-down.
    pub fn from_snapshot(
        fqn: Fqn,
        snapshot: &NodeSnapshot,
        kind: NodeKind,
        isolation: IsolationLevel,
    ) -> Arc<TreeNode> {
        let node = Arc::new(TreeNode::with_fqn(fqn, kind, isolation));
        if !snapshot.data.is_empty() {
            node.put_all(snapshot.data.clone(), true);
        }
        for (name, child) in &snapshot.children {
            let child_node =
                TreeNode::from_snapshot(node.fqn.child(name.clone()), child, kind.fresh(), isolation);
            node.maps
                .write()
                .children
                .get_or_insert_with(BTreeMap::new)
                .insert(name.clone(), child_node);
        }
        node
    }

    /// Independent deep copy of this subtree rooted at the same path, with
    /// fresh locks.
    pub fn deep_copy(&self) -> Arc<TreeNode> {
        TreeNode::from_snapshot(self.fqn.clone(), &self.snapshot(), self.kind(), self.isolation)
    }

    /// Replaces this node's data and children with the snapshot contents.
    pub fn apply_snapshot(&self, snapshot: &NodeSnapshot) {
        self.put_all(snapshot.data.clone(), true);
        let kind = self.kind().fresh();
        let children: BTreeMap<Segment, Arc<TreeNode>> = snapshot
            .children
            .iter()
            .map(|(name, child)| {
                (
                    name.clone(),
                    TreeNode::from_snapshot(self.fqn.child(name.clone()), child, kind, self.isolation),
                )
            })
            .collect();
        self.maps.write().children = if children.is_empty() {
            None
        } else {
            Some(children)
        };
    }

    /// Number of live nodes in this subtree, excluding this node.
    pub fn number_of_nodes(&self) -> usize {
        self.children()
            .iter()
            .filter(|c| !c.is_marked_for_removal())
            .map(|c| 1 + c.number_of_nodes())
            .sum()
    }

    /// Number of data entries in this subtree.
    pub fn number_of_attributes(&self) -> usize {
        self.data_len()
            + self
                .children()
                .iter()
                .filter(|c| !c.is_marked_for_removal())
                .map(|c| c.number_of_attributes())
                .sum::<usize>()
    }

    /// Number of locked nodes in this subtree.
    pub fn number_of_locks_held(&self) -> usize {
        let own = usize::from(self.lock.get().is_some_and(|l| l.is_locked()));
        own + self
            .children()
            .iter()
            .map(|c| c.number_of_locks_held())
            .sum::<usize>()
    }

    /// Appends an indented rendering of this subtree to `out`.
    pub fn print_details(&self, out: &mut String, indent: usize) {
        let name = match self.name() {
            Some(name) => name.to_string(),
            None => "/".to_string(),
        };
        let data: BTreeMap<String, String> = self.data().into_iter().collect();
        let marker = if self.is_marked_for_removal() {
            " (removed)"
        } else {
            ""
        };
        let _ = writeln!(out, "{:indent$}{}{} {:?}", "", name, marker, data, indent = indent);
        for child in self.children() {
            child.print_details(out, indent + 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, GlobalTransaction};

    fn root() -> Arc<TreeNode> {
        TreeNode::new_root(NodeKind::Standard, IsolationLevel::RepeatableRead)
    }

    fn owner(id: u64) -> LockOwner {
        LockOwner::Transaction(GlobalTransaction::new(Address::new(1), id))
    }

    #[test]
    fn test_add_child_wires_path() {
        let root = root();
        let (a, created) = root.add_child(Segment::from("a"));
        assert!(created);
        let (b, _) = a.add_child(Segment::from("b"));
        assert_eq!(b.fqn(), &Fqn::parse("/a/b"));
        let (again, created) = root.add_child(Segment::from("a"));
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn test_insert_child_rejects_foreign_node() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        let stray = a.deep_copy();
        // Path /a cannot be attached under /a.
        assert!(matches!(
            a.insert_child(stray),
            Err(CacheError::IllegalState(_))
        ));
        assert!(root.children_names(false).contains(&Segment::from("a")));
    }

    #[test]
    fn test_data_operations() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        assert!(a.put("k".into(), "1".into()).is_none());
        assert_eq!(a.put("k".into(), "2".into()), Some("1".into()));
        assert_eq!(a.get("k"), Some("2".into()));

        let prev = a.put_all(DataMap::from([("x".into(), "y".into())]), true);
        assert_eq!(prev.get("k"), Some(&"2".to_string()));
        assert!(a.get("k").is_none());
        assert_eq!(a.remove_key("x"), Some("y".into()));
        assert!(!a.has_data());
    }

    #[test]
    fn test_tombstone_cascades_and_reverts() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        let (b, _) = a.add_child(Segment::from("b"));
        a.mark_for_removal(true);
        assert!(a.is_marked_for_removal());
        assert!(b.is_marked_for_removal());
        assert!(root.children_names(false).is_empty());
        assert_eq!(root.children_names(true).len(), 1);

        a.unmark_for_removal(false);
        assert!(!a.is_marked_for_removal());
        assert!(b.is_marked_for_removal());
        a.unmark_for_removal(true);
        assert!(!b.is_marked_for_removal());
    }

    #[test]
    fn test_tombstone_never_shows_in_data() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        a.put("k".into(), "v".into());
        a.mark_for_removal(false);
        assert_eq!(a.keys().into_iter().collect::<Vec<_>>(), vec!["k".to_string()]);
        assert_eq!(a.data().len(), 1);

        let (empty, _) = root.add_child(Segment::from("empty"));
        empty.mark_for_removal(false);
        assert!(!empty.has_data());
        assert!(empty.keys().is_empty());
    }

    #[test]
    fn test_acquire_all_releases_on_failure() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        let (b, _) = a.add_child(Segment::from("b"));
        b.acquire(owner(2), LockType::Write, Duration::from_millis(10))
            .unwrap();

        let err = a
            .acquire_all(owner(1), LockType::Write, Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!a.lock().is_locked());

        b.release(&owner(2));
        let acquired = a
            .acquire_all(owner(1), LockType::Write, Duration::from_millis(20))
            .unwrap();
        assert_eq!(acquired.len(), 2);
        a.release_all(&owner(1));
        assert_eq!(root.number_of_locks_held(), 0);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        a.put("k".into(), "v".into());
        a.add_child(Segment::from("b")).0.put("x".into(), "y".into());

        let copy = a.deep_copy();
        assert_eq!(copy.fqn(), a.fqn());
        assert_eq!(copy.snapshot(), a.snapshot());
        let copied_b = copy.child(&Segment::from("b")).unwrap();
        assert_eq!(copied_b.fqn(), &Fqn::parse("/a/b"));
        copied_b.put("x".into(), "changed".into());
        assert_eq!(
            a.child(&Segment::from("b")).unwrap().get("x"),
            Some("y".into())
        );
    }

    #[test]
    fn test_snapshot_skips_tombstones() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        a.add_child(Segment::from("live"));
        a.add_child(Segment::from("dead")).0.mark_for_removal(true);
        let snap = a.snapshot();
        assert_eq!(snap.children.len(), 1);
        assert_eq!(snap.node_count(), 2);
    }

    #[test]
    fn test_versioned_kind_propagates() {
        let root = TreeNode::new_root(NodeKind::Versioned(0), IsolationLevel::RepeatableRead);
        let (a, _) = root.add_child(Segment::from("a"));
        assert_eq!(a.version(), Some(0));
        assert_eq!(a.bump_version(), Some(1));
        assert_eq!(a.version(), Some(1));
    }

    #[test]
    fn test_counts_and_details() {
        let root = root();
        let (a, _) = root.add_child(Segment::from("a"));
        a.put("k".into(), "v".into());
        a.add_child(Segment::from("b"));
        assert_eq!(root.number_of_nodes(), 2);
        assert_eq!(root.number_of_attributes(), 1);

        let mut out = String::new();
        root.print_details(&mut out, 0);
        assert!(out.contains("a {\"k\": \"v\"}"));
    }
}
