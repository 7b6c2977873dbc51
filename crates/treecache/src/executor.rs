//! Last pipeline stage: applies commands to the tree.
//!
//! Mutations inside a transaction append the compensating operation that
//! exactly reverses them. Changes are announced to listeners before and
//! after they happen.

use crate::cache::CacheInner;
use crate::command::{Command, Reply};
use crate::config::NodeLockingScheme;
use crate::error::CacheResult;
use crate::fqn::Fqn;
use crate::notify::CacheEvent;
use crate::pipeline::{create_path, record_undo, InvocationContext};
use crate::txn_table::UndoOp;

/// Applies commands to the node tree.
pub struct Executor;

impl Executor {
    /// Executes `command` against the tree.
    pub fn execute(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
    ) -> CacheResult<Reply> {
        let tree = &cache.tree;
        let quiet = ctx.options.suppress_notifications;
        let origin_local = ctx.origin_local;
        match command {
            Command::Get { fqn, key } => {
                let value = tree.find_node(&fqn, false).and_then(|n| n.get(&key));
                self.visited(cache, ctx, &fqn);
                Ok(Reply::Value(value))
            }
            Command::GetData { fqn } => {
                let data = tree.find_node(&fqn, false).map(|n| n.data());
                self.visited(cache, ctx, &fqn);
                Ok(Reply::Data(data))
            }
            Command::GetKeys { fqn } => Ok(Reply::Keys(tree.find_node(&fqn, false).map(|n| n.keys()))),
            Command::GetChildrenNames { fqn } => Ok(Reply::Names(tree.children_names(&fqn))),
            Command::Exists { fqn, key } => {
                let node = tree.find_node(&fqn, false);
                Ok(Reply::Bool(match (node, key) {
                    (Some(node), Some(key)) => node.contains_key(&key),
                    (Some(_), None) => true,
                    (None, _) => false,
                }))
            }
            Command::Put { fqn, key, value } => {
                let node = create_path(cache, ctx, &fqn)?;
                let previous = cache.notifier.around(
                    quiet,
                    |pre| modified(&fqn, pre, origin_local),
                    || Ok(node.put(key.clone(), value)),
                )?;
                let undo = match &previous {
                    Some(old) => UndoOp::RestoreValue {
                        fqn,
                        key,
                        value: old.clone(),
                    },
                    None => UndoOp::RemoveKey { fqn, key },
                };
                record_undo(cache, ctx, undo)?;
                Ok(Reply::Value(previous))
            }
            Command::PutData { fqn, data, erase } => {
                let node = create_path(cache, ctx, &fqn)?;
                let previous = cache.notifier.around(
                    quiet,
                    |pre| modified(&fqn, pre, origin_local),
                    || Ok(node.put_all(data, erase)),
                )?;
                record_undo(cache, ctx, UndoOp::RestoreData { fqn, data: previous })?;
                Ok(Reply::Unit)
            }
            Command::RemoveKey { fqn, key } => {
                let Some(node) = tree.find_node(&fqn, false) else {
                    return Ok(Reply::Value(None));
                };
                if !node.contains_key(&key) {
                    return Ok(Reply::Value(None));
                }
                let previous = cache.notifier.around(
                    quiet,
                    |pre| modified(&fqn, pre, origin_local),
                    || Ok(node.remove_key(&key)),
                )?;
                if let Some(old) = &previous {
                    record_undo(
                        cache,
                        ctx,
                        UndoOp::RestoreValue {
                            fqn,
                            key,
                            value: old.clone(),
                        },
                    )?;
                }
                Ok(Reply::Value(previous))
            }
            Command::RemoveData { fqn } => {
                let Some(node) = tree.find_node(&fqn, false) else {
                    return Ok(Reply::Unit);
                };
                let previous = cache.notifier.around(
                    quiet,
                    |pre| modified(&fqn, pre, origin_local),
                    || Ok(node.clear_data()),
                )?;
                record_undo(cache, ctx, UndoOp::RestoreData { fqn, data: previous })?;
                Ok(Reply::Unit)
            }
            Command::RemoveNode { fqn } => self.remove_node(cache, ctx, fqn),
            Command::Evict { fqn } => {
                let Some(node) = tree.find_node(&fqn, false) else {
                    return Ok(Reply::Bool(false));
                };
                cache.notifier.around(
                    quiet,
                    |pre| CacheEvent::NodeEvicted {
                        fqn: fqn.clone(),
                        pre,
                        origin_local,
                    },
                    || {
                        if node.has_children() {
                            node.clear_data();
                        } else {
                            tree.remove_node(&fqn);
                        }
                        Ok(())
                    },
                )?;
                Ok(Reply::Bool(true))
            }
            Command::Prepare { .. }
            | Command::Commit { .. }
            | Command::Rollback { .. }
            | Command::Replicate { .. }
            | Command::GetPartialState { .. } => Ok(Reply::Unit),
        }
    }

    fn remove_node(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        fqn: Fqn,
    ) -> CacheResult<Reply> {
        let tree = &cache.tree;
        let Some(node) = tree.find_node(&fqn, false) else {
            return Ok(Reply::Bool(false));
        };
        let origin_local = ctx.origin_local;
        let tombstone = ctx.gtx.is_some()
            && !fqn.is_root()
            && cache.config.node_locking_scheme == NodeLockingScheme::Pessimistic;
        let snapshot = if ctx.gtx.is_some() && !tombstone {
            Some(node.snapshot())
        } else {
            None
        };

        cache.notifier.around(
            ctx.options.suppress_notifications,
            |pre| CacheEvent::NodeRemoved {
                fqn: fqn.clone(),
                pre,
                origin_local,
            },
            || {
                if tombstone {
                    node.mark_for_removal(true);
                } else {
                    tree.remove_node(&fqn);
                }
                Ok(())
            },
        )?;

        if tombstone {
            record_undo(cache, ctx, UndoOp::UnmarkForRemoval { fqn: fqn.clone() })?;
            if let Some(gtx) = ctx.gtx {
                cache.txs.add_removed_node(&gtx, fqn)?;
            }
        } else if let Some(snapshot) = snapshot {
            record_undo(cache, ctx, UndoOp::RestoreSubtree { fqn, snapshot })?;
        }
        Ok(Reply::Bool(true))
    }

    fn visited(&self, cache: &CacheInner, ctx: &InvocationContext, fqn: &Fqn) {
        if ctx.options.suppress_notifications || cache.notifier.listener_count() == 0 {
            return;
        }
        // Post-only event, so a listener error cannot veto anything.
        if let Err(e) = cache
            .notifier
            .notify(CacheEvent::NodeVisited { fqn: fqn.clone() })
        {
            tracing::warn!(%fqn, error = %e, "visited listener failed");
        }
    }
}

fn modified(fqn: &Fqn, pre: bool, origin_local: bool) -> CacheEvent {
    CacheEvent::NodeModified {
        fqn: fqn.clone(),
        pre,
        origin_local,
    }
}
