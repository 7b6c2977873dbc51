//! Transaction bookkeeping.
//!
//! Maps local transactions to their [`GlobalTransaction`] and keeps, per
//! global transaction, the modifications to replicate, the compensating
//! operations that undo them, the locks taken and the nodes tombstoned.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::command::Command;
use crate::error::{CacheError, CacheResult};
use crate::fqn::Fqn;
use crate::node::{DataMap, NodeSnapshot, TreeNode};
use crate::optimistic::Workspace;
use crate::tree::DataTree;
use crate::types::{Address, GlobalTransaction, LocalTxId};

/// Compensating operation applied directly to the tree on rollback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UndoOp {
    /// Put back a value that was overwritten or removed.
    RestoreValue {
        /// Target node.
        fqn: Fqn,
        /// Key to restore.
        key: String,
        /// Previous value.
        value: String,
    },
    /// Remove a key that did not exist before.
    RemoveKey {
        /// Target node.
        fqn: Fqn,
        /// Key to remove.
        key: String,
    },
    /// Erase the data map and restore a prior snapshot of it.
    RestoreData {
        /// Target node.
        fqn: Fqn,
        /// Previous data.
        data: DataMap,
    },
    /// Physically remove a node created by the transaction.
    RemoveNode {
        /// Node to remove.
        fqn: Fqn,
    },
    /// Clear a tombstone (and its descendants' tombstones).
    UnmarkForRemoval {
        /// Tombstoned node.
        fqn: Fqn,
    },
    /// Put a tombstone back on a node revived by the transaction.
    MarkForRemoval {
        /// Revived node.
        fqn: Fqn,
    },
    /// Reattach a physically removed subtree.
    RestoreSubtree {
        /// Path of the removed subtree.
        fqn: Fqn,
        /// Contents at removal time.
        snapshot: NodeSnapshot,
    },
}

impl UndoOp {
    /// Node this operation touches.
    pub fn fqn(&self) -> &Fqn {
        match self {
            UndoOp::RestoreValue { fqn, .. }
            | UndoOp::RemoveKey { fqn, .. }
            | UndoOp::RestoreData { fqn, .. }
            | UndoOp::RemoveNode { fqn }
            | UndoOp::UnmarkForRemoval { fqn }
            | UndoOp::MarkForRemoval { fqn }
            | UndoOp::RestoreSubtree { fqn, .. } => fqn,
        }
    }

    /// Applies the operation directly to the tree, without recording
    /// anything.
    pub fn apply(&self, tree: &DataTree) -> CacheResult<()> {
        let node = |fqn: &Fqn| {
            tree.find_node(fqn, true)
                .ok_or_else(|| CacheError::node_not_exists(fqn))
        };
        match self {
            UndoOp::RestoreValue { fqn, key, value } => {
                node(fqn)?.put(key.clone(), value.clone());
            }
            UndoOp::RemoveKey { fqn, key } => {
                node(fqn)?.remove_key(key);
            }
            UndoOp::RestoreData { fqn, data } => {
                node(fqn)?.put_all(data.clone(), true);
            }
            UndoOp::RemoveNode { fqn } => {
                tree.remove_node(fqn)
                    .ok_or_else(|| CacheError::node_not_exists(fqn))?;
            }
            UndoOp::UnmarkForRemoval { fqn } => node(fqn)?.unmark_for_removal(true),
            UndoOp::MarkForRemoval { fqn } => node(fqn)?.mark_for_removal(false),
            UndoOp::RestoreSubtree { fqn, snapshot } => {
                tree.restore_subtree(fqn, snapshot);
            }
        }
        Ok(())
    }
}

/// Lifecycle of a transaction entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// Accepting modifications.
    Active,
    /// First phase in progress.
    Preparing,
    /// First phase done, awaiting the decision.
    Prepared,
    /// Commit in progress.
    Committing,
    /// Rollback in progress.
    RollingBack,
}

impl TxStatus {
    /// True while a commit or rollback is running.
    pub fn is_completing(&self) -> bool {
        matches!(self, TxStatus::Committing | TxStatus::RollingBack)
    }
}

/// Order in which a transaction's locks are released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReleaseOrder {
    /// Oldest lock first.
    #[default]
    Fifo,
    /// Newest lock first.
    Lifo,
}

/// Per-transaction record.
#[derive(Debug)]
pub struct TransactionEntry {
    gtx: GlobalTransaction,
    local: Option<LocalTxId>,
    remote: bool,
    replicated: bool,
    status: TxStatus,
    modifications: Vec<Command>,
    undo: Vec<UndoOp>,
    locks: Vec<Arc<TreeNode>>,
    removed_nodes: Vec<Fqn>,
    workspace: Workspace,
}

impl TransactionEntry {
    fn new(gtx: GlobalTransaction, local: Option<LocalTxId>, remote: bool) -> Self {
        Self {
            gtx,
            local,
            remote,
            replicated: false,
            status: TxStatus::Active,
            modifications: Vec::new(),
            undo: Vec::new(),
            locks: Vec::new(),
            removed_nodes: Vec::new(),
            workspace: Workspace::default(),
        }
    }

    /// Global transaction this entry belongs to.
    pub fn gtx(&self) -> GlobalTransaction {
        self.gtx
    }

    /// Local transaction representing it on this member.
    pub fn local(&self) -> Option<LocalTxId> {
        self.local
    }

    /// True if the transaction originated on another member.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Records that a prepare for this transaction was sent to peers.
    pub fn mark_replicated(&mut self) {
        self.replicated = true;
    }

    /// True once a prepare was sent to peers.
    pub fn was_replicated(&self) -> bool {
        self.replicated
    }

    /// Current status.
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Moves to a new status.
    pub fn set_status(&mut self, status: TxStatus) {
        self.status = status;
    }

    /// Appends a replicable modification.
    pub fn add_modification(&mut self, command: Command) {
        self.modifications.push(command);
    }

    /// Replicable modifications in application order.
    pub fn modifications(&self) -> &[Command] {
        &self.modifications
    }

    /// Appends a compensating operation.
    pub fn add_undo_operation(&mut self, op: UndoOp) {
        self.undo.push(op);
    }

    /// Compensating operations in application order.
    pub fn undo_operations(&self) -> &[UndoOp] {
        &self.undo
    }

    /// Records a lock; a node already recorded is not added twice.
    pub fn add_lock(&mut self, node: Arc<TreeNode>) {
        if !self.locks.iter().any(|n| Arc::ptr_eq(n, &node)) {
            self.locks.push(node);
        }
    }

    /// Records several locks in order.
    pub fn add_locks(&mut self, nodes: impl IntoIterator<Item = Arc<TreeNode>>) {
        for node in nodes {
            self.add_lock(node);
        }
    }

    /// Locked nodes in acquisition order.
    pub fn locks(&self) -> &[Arc<TreeNode>] {
        &self.locks
    }

    /// Takes the lock list in the requested release order.
    pub fn take_locks(&mut self, order: ReleaseOrder) -> Vec<Arc<TreeNode>> {
        let mut locks = std::mem::take(&mut self.locks);
        if order == ReleaseOrder::Lifo {
            locks.reverse();
        }
        locks
    }

    /// Records a node tombstoned by this transaction.
    pub fn add_removed_node(&mut self, fqn: Fqn) {
        if !self.removed_nodes.contains(&fqn) {
            self.removed_nodes.push(fqn);
        }
    }

    /// Nodes tombstoned by this transaction.
    pub fn removed_nodes(&self) -> &[Fqn] {
        &self.removed_nodes
    }

    /// Takes the undo list for reverse replay.
    pub fn take_undo_operations(&mut self) -> Vec<UndoOp> {
        std::mem::take(&mut self.undo)
    }

    /// Optimistic workspace.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Mutable optimistic workspace.
    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }
}

/// Shared handle to an entry.
pub type EntryRef = Arc<Mutex<TransactionEntry>>;

/// Concurrent table of live transactions.
pub struct TransactionTable {
    local_to_global: DashMap<LocalTxId, GlobalTransaction>,
    global_to_local: DashMap<GlobalTransaction, LocalTxId>,
    entries: DashMap<GlobalTransaction, EntryRef>,
    next_global: AtomicU64,
    next_local: AtomicU64,
}

impl TransactionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            local_to_global: DashMap::new(),
            global_to_local: DashMap::new(),
            entries: DashMap::new(),
            next_global: AtomicU64::new(1),
            next_local: AtomicU64::new(1),
        }
    }

    /// Allocates a new global transaction originating at `origin`.
    pub fn new_global(&self, origin: Address) -> GlobalTransaction {
        GlobalTransaction::new(origin, self.next_global.fetch_add(1, Ordering::SeqCst))
    }

    /// Allocates a new local transaction id.
    pub fn new_local(&self) -> LocalTxId {
        LocalTxId::new(self.next_local.fetch_add(1, Ordering::SeqCst))
    }

    /// Associates a local transaction with a global one. A local transaction
    /// keeps the first global transaction it was bound to.
    pub fn put(&self, local: LocalTxId, gtx: GlobalTransaction) -> GlobalTransaction {
        let bound = *self.local_to_global.entry(local).or_insert(gtx);
        self.global_to_local.entry(bound).or_insert(local);
        bound
    }

    /// Global transaction for a local one.
    pub fn get_global(&self, local: LocalTxId) -> Option<GlobalTransaction> {
        self.local_to_global.get(&local).map(|g| *g)
    }

    /// Local representative of a global transaction, if it is still around.
    pub fn get_local(&self, gtx: &GlobalTransaction) -> Option<LocalTxId> {
        self.global_to_local.get(gtx).map(|l| *l)
    }

    /// Creates the entry for `gtx` unless one exists, and returns it.
    pub fn create_entry(
        &self,
        gtx: GlobalTransaction,
        local: Option<LocalTxId>,
        remote: bool,
    ) -> EntryRef {
        if let Some(local) = local {
            self.put(local, gtx);
        }
        self.entries
            .entry(gtx)
            .or_insert_with(|| {
                tracing::debug!(%gtx, remote, "created transaction entry");
                Arc::new(Mutex::new(TransactionEntry::new(gtx, local, remote)))
            })
            .clone()
    }

    /// Entry for `gtx`.
    pub fn get(&self, gtx: &GlobalTransaction) -> Option<EntryRef> {
        self.entries.get(gtx).map(|e| e.clone())
    }

    /// Entry for `gtx`, or `TransactionNotFound`.
    pub fn entry(&self, gtx: &GlobalTransaction) -> CacheResult<EntryRef> {
        self.get(gtx)
            .ok_or(CacheError::TransactionNotFound(*gtx))
    }

    /// True if `gtx` has an entry.
    pub fn contains(&self, gtx: &GlobalTransaction) -> bool {
        self.entries.contains_key(gtx)
    }

    /// Removes the entry and both mappings for `gtx`.
    pub fn remove(&self, gtx: &GlobalTransaction) -> Option<EntryRef> {
        if let Some((_, local)) = self.global_to_local.remove(gtx) {
            self.local_to_global.remove(&local);
        }
        self.entries.remove(gtx).map(|(_, e)| e)
    }

    /// Appends a modification to `gtx`'s entry.
    pub fn add_modification(&self, gtx: &GlobalTransaction, command: Command) -> CacheResult<()> {
        self.entry(gtx)?.lock().add_modification(command);
        Ok(())
    }

    /// Appends a compensating operation to `gtx`'s entry.
    pub fn add_undo_operation(&self, gtx: &GlobalTransaction, op: UndoOp) -> CacheResult<()> {
        self.entry(gtx)?.lock().add_undo_operation(op);
        Ok(())
    }

    /// Records a lock in `gtx`'s entry.
    pub fn add_lock(&self, gtx: &GlobalTransaction, node: Arc<TreeNode>) -> CacheResult<()> {
        self.entry(gtx)?.lock().add_lock(node);
        Ok(())
    }

    /// Records a tombstoned node in `gtx`'s entry.
    pub fn add_removed_node(&self, gtx: &GlobalTransaction, fqn: Fqn) -> CacheResult<()> {
        self.entry(gtx)?.lock().add_removed_node(fqn);
        Ok(())
    }

    /// Copy of `gtx`'s compensating operations in application order.
    pub fn undo_operations(&self, gtx: &GlobalTransaction) -> Vec<UndoOp> {
        self.get(gtx)
            .map(|e| e.lock().undo_operations().to_vec())
            .unwrap_or_default()
    }

    /// Copy of `gtx`'s modifications in application order.
    pub fn modifications(&self, gtx: &GlobalTransaction) -> Vec<Command> {
        self.get(gtx)
            .map(|e| e.lock().modifications().to_vec())
            .unwrap_or_default()
    }

    /// All global transactions with an entry.
    pub fn transactions(&self) -> Vec<GlobalTransaction> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no transaction is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}
