//! Invocation pipeline.
//!
//! Every cache call and every inbound replicated command is a [`Command`]
//! passed through an ordered list of [`Interceptor`]s and finally to the
//! [`Executor`], which touches the tree. Per-call state travels in an
//! explicit [`InvocationContext`].

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheInner;
use crate::command::{Command, Reply};
use crate::config::NodeLockingScheme;
use crate::error::CacheResult;
use crate::executor::Executor;
use crate::fqn::Segment;
use crate::lock::LockOwner;
use crate::lock_interceptor::LockInterceptor;
use crate::loader_interceptor::LoaderInterceptor;
use crate::node::TreeNode;
use crate::notify::CacheEvent;
use crate::optimistic_interceptor::OptimisticInterceptor;
use crate::repl_interceptor::ReplicationInterceptor;
use crate::tx_interceptor::TxInterceptor;
use crate::txn_table::{ReleaseOrder, UndoOp};
use crate::types::{GlobalTransaction, LocalTxId};

/// Per-call overrides. They apply to one invocation only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationOptions {
    /// Do not replicate this call.
    pub cache_mode_local: bool,
    /// Do not notify listeners.
    pub suppress_notifications: bool,
    /// Swallow lock timeouts on writes.
    pub fail_silently: bool,
    /// Lock acquisition timeout for this call.
    pub lock_timeout: Option<Duration>,
    /// Do not consult the backing store.
    pub skip_cache_loader: bool,
    /// Lock release order on commit.
    pub release_order: ReleaseOrder,
}

/// State of one invocation.
#[derive(Debug)]
pub struct InvocationContext {
    /// Transaction the call belongs to.
    pub gtx: Option<GlobalTransaction>,
    /// Local transaction representing it here.
    pub local_tx: Option<LocalTxId>,
    /// True if the call originated on this member.
    pub origin_local: bool,
    /// Per-call overrides.
    pub options: InvocationOptions,
    /// Locks held by the calling thread, released when the call returns.
    pub thread_locks: Vec<Arc<TreeNode>>,
}

impl InvocationContext {
    /// Context for a call made on this member.
    pub fn local(options: InvocationOptions) -> Self {
        Self {
            gtx: None,
            local_tx: None,
            origin_local: true,
            options,
            thread_locks: Vec::new(),
        }
    }

    /// Context for a command received from a peer.
    pub fn remote() -> Self {
        Self {
            gtx: None,
            local_tx: None,
            origin_local: false,
            options: InvocationOptions::default(),
            thread_locks: Vec::new(),
        }
    }

    /// Binds the context to a transaction.
    pub fn with_transaction(mut self, gtx: GlobalTransaction, local: Option<LocalTxId>) -> Self {
        self.gtx = Some(gtx);
        self.local_tx = local;
        self
    }

    /// Owner of locks taken by this call.
    pub fn owner(&self) -> LockOwner {
        match self.gtx {
            Some(gtx) => LockOwner::Transaction(gtx),
            None => LockOwner::current_thread(),
        }
    }

    /// Releases the locks held by the calling thread, newest first.
    pub fn release_thread_locks(&mut self) {
        let owner = LockOwner::current_thread();
        for node in self.thread_locks.drain(..).rev() {
            node.release(&owner);
        }
    }
}

impl Drop for InvocationContext {
    fn drop(&mut self) {
        self.release_thread_locks();
    }
}

/// One stage of the pipeline.
pub trait Interceptor: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &'static str;

    /// Handles `command`, usually by calling `next` at some point.
    fn invoke(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply>;
}

/// The rest of the pipeline after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Box<dyn Interceptor>],
    executor: &'a Executor,
}

impl<'a> Next<'a> {
    /// Passes `command` to the next stage.
    pub fn invoke(
        self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
    ) -> CacheResult<Reply> {
        match self.rest.split_first() {
            Some((head, rest)) => head.invoke(
                cache,
                ctx,
                command,
                Next {
                    rest,
                    executor: self.executor,
                },
            ),
            None => self.executor.execute(cache, ctx, command),
        }
    }
}

/// Ordered interceptors plus the executor.
pub struct Pipeline {
    interceptors: Vec<Box<dyn Interceptor>>,
    executor: Executor,
}

impl Pipeline {
    /// Builds the chain for a locking scheme: transactions, replication,
    /// locking (or optimistic workspaces), the backing store, execution.
    pub fn new(scheme: NodeLockingScheme) -> Self {
        let mut interceptors: Vec<Box<dyn Interceptor>> = vec![
            Box::new(TxInterceptor),
            Box::new(ReplicationInterceptor),
        ];
        match scheme {
            NodeLockingScheme::Pessimistic => interceptors.push(Box::new(LockInterceptor)),
            NodeLockingScheme::Optimistic => interceptors.push(Box::new(OptimisticInterceptor)),
        }
        interceptors.push(Box::new(LoaderInterceptor));
        Self {
            interceptors,
            executor: Executor,
        }
    }

    /// Names of the interceptors in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Runs `command` through the whole chain.
    pub fn invoke(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
    ) -> CacheResult<Reply> {
        self.head().invoke(cache, ctx, command)
    }

    /// The full chain.
    pub fn head(&self) -> Next<'_> {
        Next {
            rest: &self.interceptors,
            executor: &self.executor,
        }
    }
}

/// Records newly acquired locks with their owner: in the transaction entry,
/// or in the context for thread-owned locks.
pub(crate) fn record_locks(
    cache: &CacheInner,
    ctx: &mut InvocationContext,
    nodes: Vec<Arc<TreeNode>>,
) -> CacheResult<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    match ctx.gtx {
        Some(gtx) => cache.txs.entry(&gtx)?.lock().add_locks(nodes),
        None => ctx.thread_locks.extend(nodes),
    }
    Ok(())
}

/// Appends a compensating operation when the call runs in a transaction.
pub(crate) fn record_undo(cache: &CacheInner, ctx: &InvocationContext, op: UndoOp) -> CacheResult<()> {
    match ctx.gtx {
        Some(gtx) => cache.txs.add_undo_operation(&gtx, op),
        None => Ok(()),
    }
}

/// Returns the child `name` of `parent`, creating it if missing. A created
/// node is announced to listeners and, inside a transaction, undone by
/// removal. Tombstoned children are returned as they are.
pub(crate) fn ensure_child(
    cache: &CacheInner,
    ctx: &InvocationContext,
    parent: &Arc<TreeNode>,
    name: &Segment,
) -> CacheResult<Arc<TreeNode>> {
    if let Some(child) = parent.child(name) {
        return Ok(child);
    }
    let fqn = parent.fqn().child(name.clone());
    let origin_local = ctx.origin_local;
    let (child, created) = cache.notifier.around(
        ctx.options.suppress_notifications,
        |pre| CacheEvent::NodeCreated {
            fqn: fqn.clone(),
            pre,
            origin_local,
        },
        || Ok(parent.add_child(name.clone())),
    )?;
    if created {
        tracing::trace!(%fqn, "created node");
        record_undo(cache, ctx, UndoOp::RemoveNode { fqn })?;
    }
    Ok(child)
}

/// Creates every missing node on the way to `fqn` and returns the target.
pub(crate) fn create_path(
    cache: &CacheInner,
    ctx: &InvocationContext,
    fqn: &crate::fqn::Fqn,
) -> CacheResult<Arc<TreeNode>> {
    let mut node = cache.tree.root().clone();
    for name in fqn.segments() {
        let child = ensure_child(cache, ctx, &node, name)?;
        revive_if_removed(cache, ctx, &child)?;
        node = child;
    }
    Ok(node)
}

/// Brings a tombstoned node back with empty data; its descendants stay
/// removed. The caller must hold the node's write lock.
pub(crate) fn revive_if_removed(
    cache: &CacheInner,
    ctx: &InvocationContext,
    node: &Arc<TreeNode>,
) -> CacheResult<()> {
    if !node.is_marked_for_removal() {
        return Ok(());
    }
    let fqn = node.fqn().clone();
    let previous = node.clear_data();
    node.unmark_for_removal(false);
    tracing::trace!(%fqn, "revived removed node");
    record_undo(
        cache,
        ctx,
        UndoOp::RestoreData {
            fqn: fqn.clone(),
            data: previous,
        },
    )?;
    record_undo(cache, ctx, UndoOp::MarkForRemoval { fqn })
}
