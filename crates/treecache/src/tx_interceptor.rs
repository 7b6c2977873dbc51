//! Transaction boundaries.
//!
//! Binds calls to their transaction, records local modifications for
//! replication, runs two-phase completion for local transactions and
//! replays prepares received from peers. Completion ends by reaping
//! tombstones or replaying the undo log, then releasing the transaction's
//! locks.

use crate::cache::CacheInner;
use crate::command::{Command, Reply};
use crate::config::NodeLockingScheme;
use crate::error::CacheResult;
use crate::fqn::Fqn;
use crate::lock::LockOwner;
use crate::pipeline::{Interceptor, InvocationContext, Next};
use crate::tree::DataTree;
use crate::txn_table::{ReleaseOrder, TxStatus};
use crate::types::{Address, GlobalTransaction};

/// First pipeline stage: transaction demarcation.
pub struct TxInterceptor;

impl Interceptor for TxInterceptor {
    fn name(&self) -> &'static str {
        "tx"
    }

    fn invoke(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        match command {
            Command::Prepare {
                gtx,
                modifications,
                origin,
                one_phase,
            } if !ctx.origin_local => {
                self.remote_prepare(cache, ctx, gtx, modifications, origin, one_phase, next)
            }
            Command::Commit { gtx } => {
                if !ctx.origin_local && !cache.txs.contains(&gtx) {
                    tracing::debug!(%gtx, "commit for unknown transaction ignored");
                    return Ok(Reply::Unit);
                }
                bind(cache, ctx, gtx);
                if ctx.origin_local {
                    self.commit(cache, ctx, gtx, next)
                } else {
                    self.complete(cache, ctx, gtx, next)
                }
            }
            Command::Rollback { gtx } => {
                if !ctx.origin_local && !cache.txs.contains(&gtx) {
                    tracing::debug!(%gtx, "rollback for unknown transaction ignored");
                    return Ok(Reply::Unit);
                }
                bind(cache, ctx, gtx);
                self.rollback(cache, ctx, gtx, next)
            }
            command
                if ctx.gtx.is_none()
                    && command.is_write()
                    && cache.config.node_locking_scheme == NodeLockingScheme::Optimistic =>
            {
                self.implicit(cache, ctx, command, next)
            }
            command => match ctx.gtx {
                Some(gtx) => self.in_transaction(cache, ctx, gtx, command, next),
                None => next.invoke(cache, ctx, command),
            },
        }
    }
}

impl TxInterceptor {
    fn in_transaction(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        gtx: GlobalTransaction,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let entry = cache.txs.entry(&gtx)?;
        let status = entry.lock().status();
        if status != TxStatus::Active && command.is_write() && ctx.origin_local {
            return Err(crate::error::CacheError::IllegalState(format!(
                "{} is {:?} and accepts no more writes",
                gtx, status
            )));
        }
        let record = ctx.origin_local && command.is_write() && !ctx.options.cache_mode_local;
        let modification = if record { Some(command.clone()) } else { None };
        let reply = next.invoke(cache, ctx, command)?;
        if let Some(modification) = modification {
            entry.lock().add_modification(modification);
        }
        Ok(reply)
    }

    /// Wraps a write made outside any transaction in one of its own.
    fn implicit(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let gtx = cache.txs.new_global(cache.local_address);
        let local = cache.txs.new_local();
        cache.txs.create_entry(gtx, Some(local), false);
        ctx.gtx = Some(gtx);
        ctx.local_tx = Some(local);

        let result = match self.in_transaction(cache, ctx, gtx, command, next) {
            Ok(reply) => {
                let completed = if ctx.origin_local {
                    self.commit(cache, ctx, gtx, next)
                } else {
                    self.complete(cache, ctx, gtx, next)
                };
                completed.map(|_| reply)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback(cache, ctx, gtx, next) {
                    tracing::warn!(%gtx, error = %rollback, "rollback of implicit transaction failed");
                }
                Err(e)
            }
        };
        ctx.gtx = None;
        ctx.local_tx = None;
        result
    }

    /// Two-phase completion of a transaction started on this member.
    fn commit(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        gtx: GlobalTransaction,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let modifications = {
            let entry = cache.txs.entry(&gtx)?;
            let mut entry = entry.lock();
            entry.set_status(TxStatus::Preparing);
            entry.modifications().to_vec()
        };
        let prepare = Command::Prepare {
            gtx,
            modifications,
            origin: cache.local_address,
            one_phase: false,
        };
        if let Err(e) = next.invoke(cache, ctx, prepare) {
            tracing::warn!(%gtx, error = %e, "prepare failed, rolling back");
            if let Err(rollback) = self.rollback(cache, ctx, gtx, next) {
                tracing::warn!(%gtx, error = %rollback, "rollback after failed prepare failed");
            }
            return Err(e);
        }
        if let Some(entry) = cache.txs.get(&gtx) {
            entry.lock().set_status(TxStatus::Prepared);
        }
        self.complete(cache, ctx, gtx, next)
    }

    /// Second phase: commits down the chain, then reaps and releases.
    fn complete(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        gtx: GlobalTransaction,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        if let Some(entry) = cache.txs.get(&gtx) {
            entry.lock().set_status(TxStatus::Committing);
        }
        let result = next.invoke(cache, ctx, Command::Commit { gtx });
        finish(cache, gtx, ctx.options.release_order, true);
        tracing::debug!(%gtx, "committed");
        result.map(|_| Reply::Unit)
    }

    fn rollback(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        gtx: GlobalTransaction,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        if let Some(entry) = cache.txs.get(&gtx) {
            entry.lock().set_status(TxStatus::RollingBack);
        }
        let result = next.invoke(cache, ctx, Command::Rollback { gtx });
        finish(cache, gtx, ReleaseOrder::Fifo, false);
        tracing::debug!(%gtx, "rolled back");
        result.map(|_| Reply::Unit)
    }

    #[allow(clippy::too_many_arguments)]
    fn remote_prepare(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        gtx: GlobalTransaction,
        modifications: Vec<Command>,
        origin: Address,
        one_phase: bool,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let local = cache.txs.new_local();
        let entry = cache.txs.create_entry(gtx, Some(local), true);
        {
            let mut entry = entry.lock();
            entry.set_status(TxStatus::Preparing);
            for m in &modifications {
                entry.add_modification(m.clone());
            }
        }
        ctx.gtx = Some(gtx);
        ctx.local_tx = cache.txs.get_local(&gtx);
        tracing::debug!(%gtx, %origin, count = modifications.len(), one_phase, "replaying prepare");

        let replayed = modifications
            .iter()
            .try_for_each(|m| next.invoke(cache, ctx, m.clone()).map(|_| ()))
            .and_then(|_| {
                next.invoke(
                    cache,
                    ctx,
                    Command::Prepare {
                        gtx,
                        modifications,
                        origin,
                        one_phase,
                    },
                )
            });
        if let Err(e) = replayed {
            tracing::warn!(%gtx, error = %e, "remote prepare failed, rolling back");
            if let Err(rollback) = self.rollback(cache, ctx, gtx, next) {
                tracing::warn!(%gtx, error = %rollback, "rollback after failed prepare failed");
            }
            return Err(e);
        }
        entry.lock().set_status(TxStatus::Prepared);
        if one_phase {
            return self.complete(cache, ctx, gtx, next);
        }
        Ok(Reply::Unit)
    }
}

fn bind(cache: &CacheInner, ctx: &mut InvocationContext, gtx: GlobalTransaction) {
    ctx.gtx = Some(gtx);
    ctx.local_tx = cache.txs.get_local(&gtx);
}

/// Ends a transaction on this member: reaps tombstones on commit or replays
/// the undo log on rollback, releases every lock the transaction holds and
/// forgets the entry.
pub(crate) fn finish(cache: &CacheInner, gtx: GlobalTransaction, order: ReleaseOrder, committed: bool) {
    let Some(entry) = cache.txs.get(&gtx) else {
        return;
    };
    let owner = LockOwner::Transaction(gtx);
    {
        let mut entry = entry.lock();
        if committed {
            for fqn in entry.removed_nodes() {
                reap(&cache.tree, fqn);
            }
        } else {
            let undo = entry.take_undo_operations();
            for op in undo.iter().rev() {
                if let Err(e) = op.apply(&cache.tree) {
                    tracing::warn!(%gtx, fqn = %op.fqn(), error = %e, "undo operation skipped");
                }
            }
        }
        for node in entry.take_locks(order) {
            node.release(&owner);
        }
    }
    cache.txs.remove(&gtx);
}

/// Physically removes tombstoned nodes at or below `fqn`.
fn reap(tree: &DataTree, fqn: &Fqn) {
    let Some(node) = tree.find_node(fqn, true) else {
        return;
    };
    if node.is_marked_for_removal() {
        tree.remove_node(fqn);
        return;
    }
    let mut stack = vec![node];
    while let Some(node) = stack.pop() {
        for child in node.children() {
            if child.is_marked_for_removal() {
                if let Some(name) = child.name() {
                    node.remove_child(name);
                }
            } else {
                stack.push(child);
            }
        }
    }
}
